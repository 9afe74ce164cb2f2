//! N-bestビタビデコード
//!
//! 各状態`(pos, k)`に長さ`nbest`の降順スコアリストを保持し、緩和を
//! 順序付き挿入で行います。バックポインタは`(前単語長, 前ランク)`の
//! ペアで、終端状態の上位エントリから各候補を復元します。

use crate::common::PIECE_ID_BOS;
use crate::decoder::{lm_edge_add, prepare, seg_score, NbestWorkspace, Workspace};
use crate::errors::{MomijiError, Result};
use crate::model::Model;
use crate::num::SCORE_NEG_INF;

/// `nbest`の上限
///
/// 緩和時の挿入リストを固定長のスタック配列で扱うための上限です。
pub const MAX_NBEST: usize = 64;

/// 状態毎の降順候補リスト（スタック上の固定長配列）
struct TopList {
    score: [i32; MAX_NBEST],
    prev_len: [u8; MAX_NBEST],
    prev_rank: [u8; MAX_NBEST],
    n: usize,
}

impl TopList {
    fn new(n: usize) -> Self {
        Self {
            score: [SCORE_NEG_INF; MAX_NBEST],
            prev_len: [0; MAX_NBEST],
            prev_rank: [0; MAX_NBEST],
            n,
        }
    }

    /// 順序付き挿入。同点は既存エントリの後ろに入る（安定）。
    #[inline]
    fn insert(&mut self, score: i32, prev_len: u8, prev_rank: u8) {
        for t in 0..self.n {
            if score > self.score[t] {
                for u in (t + 1..self.n).rev() {
                    self.score[u] = self.score[u - 1];
                    self.prev_len[u] = self.prev_len[u - 1];
                    self.prev_rank[u] = self.prev_rank[u - 1];
                }
                self.score[t] = score;
                self.prev_len[t] = prev_len;
                self.prev_rank[t] = prev_rank;
                return;
            }
        }
    }
}

/// N-bestビタビデコード
///
/// 最大`nbest`個の分割候補をスコア降順で返します。各候補は
/// `(境界配列, スコア)`のペアです。候補の分割は互いに異なり、スコアは
/// 非増加で、先頭候補は1-bestビタビと一致します。
///
/// # 引数
///
/// * `model` - 統合モデル
/// * `input` - 入力UTF-8バイト列
/// * `ws` - 作業領域
/// * `nw` - N-best用追加領域（`nbest`は構築時に固定）
///
/// # 戻り値
///
/// スコア降順の候補リスト
pub fn decode_nbest(
    model: &Model,
    input: &[u8],
    ws: &mut Workspace,
    nw: &mut NbestWorkspace,
) -> Result<Vec<(Vec<u16>, i32)>> {
    let nbest = nw.nbest;
    let n_cp = prepare(model, input, ws)?;
    let l = usize::from(model.max_word_len);
    let l1 = l + 1;

    let states = (n_cp + 1) * l1;
    if nw.dp.len() < states * nbest {
        return Err(MomijiError::WorkspaceTooSmall {
            msg: "n-best score table",
            required: states * nbest,
        });
    }

    if n_cp == 0 {
        // 空文字列は自明な1候補のみ
        return Ok(vec![(vec![0, 0], i32::from(model.crf.bos_to1))]);
    }

    let total = states * nbest;
    nw.dp[..total].fill(SCORE_NEG_INF);
    nw.bp_len[..total].fill(0);
    nw.bp_rank[..total].fill(0);

    // 開始状態 (0,0) のランク0
    nw.dp[0] = i32::from(model.crf.bos_to1);

    // 前向きk-best
    for pos in 1..=n_cp {
        let kmax = l.min(pos);
        for k in 1..=kmax {
            let start = pos - k;
            let seg = seg_score(model, ws, start, pos);
            let idx_curr = ws.span_index(pos, k);
            let curr_id = ws.span_id[idx_curr];
            let curr_luni = ws.span_luni[idx_curr];

            let mut top = TopList::new(nbest);

            if start == 0 {
                // 前状態は (0,0) のみ
                let add = lm_edge_add(model, PIECE_ID_BOS, curr_id, curr_luni);
                let edge = seg + add;
                for pr in 0..nbest {
                    let prev = nw.dp[pr];
                    if prev == SCORE_NEG_INF {
                        continue;
                    }
                    top.insert(prev + edge, 0, pr as u8);
                }
            } else {
                let jmax = l.min(start);
                for j in 1..=jmax {
                    let prev_id = ws.span_id[ws.span_index(start, j)];
                    let add = lm_edge_add(model, prev_id, curr_id, curr_luni);
                    let edge = seg + add;

                    let sid_prev = (start * l1 + j) * nbest;
                    for pr in 0..nbest {
                        let prev = nw.dp[sid_prev + pr];
                        if prev == SCORE_NEG_INF {
                            continue;
                        }
                        top.insert(prev + edge, j as u8, pr as u8);
                    }
                }
            }

            let sid = (pos * l1 + k) * nbest;
            nw.dp[sid..sid + nbest].copy_from_slice(&top.score[..nbest]);
            nw.bp_len[sid..sid + nbest].copy_from_slice(&top.prev_len[..nbest]);
            nw.bp_rank[sid..sid + nbest].copy_from_slice(&top.prev_rank[..nbest]);
        }
    }

    // 終端状態の全エントリから上位N個を選択
    let mut top_s = [SCORE_NEG_INF; MAX_NBEST];
    let mut top_k = [0usize; MAX_NBEST];
    let mut top_r = [0u8; MAX_NBEST];
    let kmax_end = l.min(n_cp);
    for k in 1..=kmax_end {
        let sid = (n_cp * l1 + k) * nbest;
        for r in 0..nbest {
            let s = nw.dp[sid + r];
            if s == SCORE_NEG_INF {
                continue;
            }
            for t in 0..nbest {
                if s > top_s[t] {
                    for u in (t + 1..nbest).rev() {
                        top_s[u] = top_s[u - 1];
                        top_k[u] = top_k[u - 1];
                        top_r[u] = top_r[u - 1];
                    }
                    top_s[t] = s;
                    top_k[t] = k;
                    top_r[t] = r as u8;
                    break;
                }
            }
        }
    }

    // 各候補をバックトラック
    let mut results = Vec::with_capacity(nbest);
    for i in 0..nbest {
        if top_s[i] == SCORE_NEG_INF || top_k[i] == 0 {
            continue;
        }
        let mut boundaries = Vec::with_capacity(n_cp + 1);
        let mut pos = n_cp;
        let mut k = top_k[i];
        let mut r = usize::from(top_r[i]);
        loop {
            boundaries.push(pos as u16);
            if pos == 0 {
                break;
            }
            let start = pos - k;
            let sid = (pos * l1 + k) * nbest;
            let pl = nw.bp_len[sid + r];
            let pr = nw.bp_rank[sid + r];
            pos = start;
            k = usize::from(pl);
            r = usize::from(pr);
            if pos == 0 {
                boundaries.push(0);
                break;
            }
            if k == 0 {
                return Err(MomijiError::invalid_state("corrupted n-best backpointer"));
            }
            if boundaries.len() > n_cp + 1 {
                return Err(MomijiError::invalid_state(
                    "n-best backtrack did not terminate",
                ));
            }
        }
        boundaries.reverse();
        if boundaries.first() != Some(&0)
            || boundaries.last().map(|&b| usize::from(b)) != Some(n_cp)
        {
            return Err(MomijiError::invalid_state("malformed n-best boundary array"));
        }
        results.push((boundaries, top_s[i]));
    }

    if results.is_empty() {
        return Err(MomijiError::NoCover(format!(
            "no segmentation reaches the end of the input (n_cp={n_cp}, max_word_len={l})"
        )));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;
    use crate::test_utils::toy_model;

    #[test]
    fn test_nbest_empty_input() {
        let model = toy_model(&[("a", -1.0)], 4);
        let mut ws = Workspace::new(16, 4).unwrap();
        let mut nw = NbestWorkspace::new(16, 4, 8).unwrap();
        let results = decode_nbest(&model, b"", &mut ws, &mut nw).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, vec![0, 0]);
    }

    #[test]
    fn test_nbest_top1_matches_viterbi() {
        let model = toy_model(
            &[("a", -1.0), ("b", -1.3), ("ab", -1.8), ("ba", -2.1)],
            3,
        );
        let mut ws = Workspace::new(32, 3).unwrap();
        let mut nw = NbestWorkspace::new(32, 3, 4).unwrap();
        for input in [&b"ab"[..], b"abab", b"aabba"] {
            let mut vb = vec![];
            let vscore = decode(&model, input, &mut ws, &mut vb).unwrap();
            let results = decode_nbest(&model, input, &mut ws, &mut nw).unwrap();
            assert_eq!(results[0].0, vb, "input {input:?}");
            assert_eq!(results[0].1, vscore);
        }
    }

    #[test]
    fn test_nbest_scores_non_increasing_and_distinct() {
        let model = toy_model(
            &[("a", -1.0), ("b", -1.0), ("ab", -1.5), ("aba", -2.5)],
            3,
        );
        let mut ws = Workspace::new(32, 3).unwrap();
        let mut nw = NbestWorkspace::new(32, 3, 8).unwrap();
        let results = decode_nbest(&model, b"abab", &mut ws, &mut nw).unwrap();
        assert!(results.len() >= 2);
        for w in results.windows(2) {
            assert!(w[0].1 >= w[1].1);
        }
        for i in 0..results.len() {
            for j in i + 1..results.len() {
                assert_ne!(results[i].0, results[j].0, "duplicate segmentation");
            }
        }
    }

    #[test]
    fn test_nbest_enumerates_all_paths_of_short_input() {
        // "ab" の分割は [0,2] と [0,1,2] の2通りだけ
        let model = toy_model(&[("a", -1.0), ("b", -1.0), ("ab", -1.5)], 4);
        let mut ws = Workspace::new(16, 4).unwrap();
        let mut nw = NbestWorkspace::new(16, 4, 8).unwrap();
        let results = decode_nbest(&model, b"ab", &mut ws, &mut nw).unwrap();
        assert_eq!(results.len(), 2);
        let bs: Vec<_> = results.iter().map(|(b, _)| b.clone()).collect();
        assert!(bs.contains(&vec![0, 2]));
        assert!(bs.contains(&vec![0, 1, 2]));
    }

    #[test]
    fn test_nbest_cap() {
        assert!(NbestWorkspace::new(8, 2, MAX_NBEST + 1).is_err());
        assert!(NbestWorkspace::new(8, 2, 0).is_err());
        assert!(NbestWorkspace::new(8, 2, MAX_NBEST).is_ok());
    }
}
