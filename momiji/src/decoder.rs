//! 半マルコフラティス上のビタビデコード
//!
//! 状態は`(位置, 最後の単語長)`のペアで、長さ`k`の単語を追加して位置を
//! 進める遷移からなるラティス上でCRF+LM統合スコアを最大化します。
//! 初期状態`(0, 0)`はBOS、終端状態は`(N, k)`（`k >= 1`）です。
//!
//! DPはメモリ効率のため位置を`(L+1)`でmodしたリングバッファ上で行い、
//! 過去`L+1`位置分のスコアのみを保持します。漸化式は`k >= 1`のため、
//! ある位置の行をクリアしても未読のセルを上書きすることはありません。

pub mod nbest;
pub mod sample;
mod workspace;

pub use workspace::{NbestWorkspace, SampleWorkspace, Workspace};

use crate::charclass::{CC_BOS, CC_EOS};
use crate::common::{PieceId, PIECE_ID_BOS, PIECE_ID_NONE};
use crate::errors::{MomijiError, Result};
use crate::model::Model;
use crate::num::{q16_mul_q8, SCORE_NEG_INF};
use crate::trie::TRIE_ROOT;
use crate::utf8::{build_offsets, decode_cp};

/// 事前計算を実行し、コードポイント数を返します。
///
/// 1. オフセットテーブルの構築
/// 2. 各位置の放射スコア（emit0/emit1）と累積和
/// 3. スパンテーブル（トライ検索による単語IDとユニグラムスコア）
pub(crate) fn prepare(model: &Model, input: &[u8], ws: &mut Workspace) -> Result<usize> {
    let l = usize::from(model.max_word_len);
    if l == 0 || l > 255 {
        return Err(MomijiError::invalid_argument(
            "model",
            "max_word_len must be in 1..=255",
        ));
    }
    if model.lm.da_base.len() != model.lm.da_check.len() || model.lm.da_base.len() < 2 {
        return Err(MomijiError::invalid_argument(
            "model",
            "double-array is empty or inconsistent",
        ));
    }
    if l > ws.max_word_len() {
        return Err(MomijiError::WorkspaceTooSmall {
            msg: "max word length",
            required: l,
        });
    }

    let max_n_cp = ws.max_n_cp();
    let n_cp = build_offsets(input, &mut ws.cp_off, max_n_cp)?;

    precompute_emissions(model, input, ws, n_cp)?;
    precompute_spans(model, input, ws, n_cp, l);
    Ok(n_cp)
}

/// CRF放射スコアを事前計算します。
///
/// 各位置でラベル0/1の放射スコアを求め、emit0の累積和も構築します
/// （区間`[s+1, t)`の和は`pref[t] - pref[s+1]`で求まる）。
fn precompute_emissions(model: &Model, input: &[u8], ws: &mut Workspace, n_cp: usize) -> Result<()> {
    let mut prev_c = CC_BOS;
    for i in 0..n_cp {
        let pos = usize::from(ws.cp_off[i]);
        let (cp, _) = decode_cp(input, pos)
            .ok_or_else(|| MomijiError::invalid_state("offset table points at invalid UTF-8"))?;
        let cur_c = model.cc.classify(cp);

        let next_c = if i + 1 < n_cp {
            let npos = usize::from(ws.cp_off[i + 1]);
            let (ncp, _) = decode_cp(input, npos).ok_or_else(|| {
                MomijiError::invalid_state("offset table points at invalid UTF-8")
            })?;
            model.cc.classify(ncp)
        } else {
            CC_EOS
        };

        ws.emit0[i] = model.crf.emit(0, prev_c, cur_c, next_c);
        ws.emit1[i] = model.crf.emit(1, prev_c, cur_c, next_c);
        prev_c = cur_c;
    }

    ws.pref_emit0[0] = 0;
    for i in 0..n_cp {
        ws.pref_emit0[i + 1] = ws.pref_emit0[i] + i32::from(ws.emit0[i]);
    }
    Ok(())
}

/// スパン情報を事前計算します。
///
/// 全ての開始位置からトライをバイト単位で辿り、一致した終端の単語IDを
/// `(終了位置, 長さ)`に記録します。続いて長さ1以上の全スパンについて
/// ユニグラム/未知語の対数確率を埋めます。
fn precompute_spans(model: &Model, input: &[u8], ws: &mut Workspace, n_cp: usize, l: usize) {
    let clear_n = (n_cp + 1) * (ws.max_word_len() + 1);
    ws.span_id[..clear_n].fill(PIECE_ID_NONE);
    ws.span_luni[..clear_n].fill(0);
    ws.bp_prevlen[..clear_n].fill(0);

    // BOS状態（位置0、長さ0）
    let bos_idx = ws.span_index(0, 0);
    ws.span_id[bos_idx] = PIECE_ID_BOS;
    ws.span_luni[bos_idx] = 0;

    let trie = model.lm.trie();
    for start in 0..n_cp {
        let mut node = TRIE_ROOT;
        let max_l = l.min(n_cp - start);
        'lens: for len in 1..=max_l {
            let cp_i = start + len - 1;
            let b0 = usize::from(ws.cp_off[cp_i]);
            let b1 = usize::from(ws.cp_off[cp_i + 1]);
            for &byte in &input[b0..b1] {
                node = trie.next(node, byte);
                if node == 0 {
                    break 'lens;
                }
            }
            if let Some(id) = trie.term_value_at(node) {
                // 16ビットに収まらないIDは未知語扱いのまま残す
                if id <= u32::from(u16::MAX) {
                    let idx = ws.span_index(start + len, len);
                    ws.span_id[idx] = id as PieceId;
                }
            }
        }
    }

    for end in 1..=n_cp {
        let max_l = l.min(end);
        for len in 1..=max_l {
            let idx = ws.span_index(end, len);
            let id = ws.span_id[idx];
            ws.span_luni[idx] = model.lm.unigram_logp(id, len as u16);
        }
    }
}

/// 単語スパン`[s, t)`のCRFスコアを計算します。
///
/// ラベル系列は`1, 0, ..., 0`（長さkの単語）で、次の単語境界でラベル1に
/// 遷移します:
///
/// * k = 1: `emit1[s] + trans11`
/// * k >= 2: `emit1[s] + trans10 + Σemit0[s+1..t-1] + (k-2)*trans00 + trans01`
#[inline]
pub(crate) fn seg_score(model: &Model, ws: &Workspace, s: usize, t: usize) -> i32 {
    let k = t - s;
    if k == 0 {
        return 0;
    }
    if k == 1 {
        return i32::from(ws.emit1[s]) + i32::from(model.crf.trans11);
    }

    let mut score = i32::from(ws.emit1[s]);
    score += i32::from(model.crf.trans10);
    score += ws.pref_emit0[t] - ws.pref_emit0[s + 1];
    score += i32::from(model.crf.trans00) * (k as i32 - 2);
    score += i32::from(model.crf.trans01);
    score
}

/// 遷移エッジのLM寄与（`lambda0 * bigram_logp`、Q8.8）を計算します。
#[inline]
pub(crate) fn lm_edge_add(model: &Model, prev_id: PieceId, curr_id: PieceId, curr_luni: i16) -> i32 {
    let lm = model.lm.bigram_logp(prev_id, curr_id, curr_luni);
    q16_mul_q8(i32::from(model.lambda0), i32::from(lm))
}

/// ビタビアルゴリズムによる分かち書き境界デコード
///
/// 半マルコフラティス上でCRF+LM統合スコアを最大化する分割を探索します。
/// 境界は`[0, b1, ..., n_cp]`の形式（コードポイント単位）で`out_b_cp`に
/// 出力されます。トークン`i`は`[out_b_cp[i], out_b_cp[i+1])`の範囲です。
///
/// スコアが同点の場合は前単語長が小さい候補を優先します。空文字列は
/// 自明な境界`[0, 0]`とスコア`bos_to1`を返します。
///
/// # 引数
///
/// * `model` - 統合モデル
/// * `input` - 入力UTF-8バイト列
/// * `ws` - 作業領域
/// * `out_b_cp` - 出力境界配列（コードポイント単位、クリアされる）
///
/// # 戻り値
///
/// 最良パスのスコア（Q8.8）
///
/// # エラー
///
/// * [`MomijiError::InvalidUtf8`] - 入力が不正な場合
/// * [`MomijiError::WorkspaceTooSmall`] - 作業領域が入力に対して小さい場合
/// * [`MomijiError::NoCover`] - 終端状態に到達できない場合
pub fn decode(
    model: &Model,
    input: &[u8],
    ws: &mut Workspace,
    out_b_cp: &mut Vec<u16>,
) -> Result<i32> {
    let n_cp = prepare(model, input, ws)?;
    let l = usize::from(model.max_word_len);
    let l1 = l + 1;

    // DPリングバッファを初期化: dp[0][0] = bos_to1
    let ring_w = ws.max_word_len() + 1;
    for v in ws.dp_ring.iter_mut() {
        *v = SCORE_NEG_INF;
    }
    ws.dp_ring[0] = i32::from(model.crf.bos_to1);

    out_b_cp.clear();
    if n_cp == 0 {
        out_b_cp.push(0);
        out_b_cp.push(0);
        return Ok(ws.dp_ring[0]);
    }
    out_b_cp.reserve(n_cp + 1);

    // 前向きDP
    for pos in 1..=n_cp {
        let row = pos % l1;
        for k in 0..l1 {
            ws.dp_ring[row * ring_w + k] = SCORE_NEG_INF;
        }

        let kmax = l.min(pos);
        for k in 1..=kmax {
            let start = pos - k;
            let seg = seg_score(model, ws, start, pos);
            let idx_curr = ws.span_index(pos, k);
            let curr_id = ws.span_id[idx_curr];
            let curr_luni = ws.span_luni[idx_curr];

            let mut best = SCORE_NEG_INF;
            let mut best_j = 0u8;
            let prev_row = start % l1;

            // j=0（BOS）は start == 0 の場合のみ有効
            if start == 0 {
                let prev_score = ws.dp_ring[prev_row * ring_w];
                if prev_score != SCORE_NEG_INF {
                    let add = lm_edge_add(model, PIECE_ID_BOS, curr_id, curr_luni);
                    best = prev_score + seg + add;
                    best_j = 0;
                }
            }

            // j >= 1: 前単語の長さ。同点では小さいjが勝つ
            let jmax = l.min(start);
            for j in 1..=jmax {
                let prev_score = ws.dp_ring[prev_row * ring_w + j];
                if prev_score == SCORE_NEG_INF {
                    continue;
                }
                let prev_id = ws.span_id[ws.span_index(start, j)];
                let add = lm_edge_add(model, prev_id, curr_id, curr_luni);
                let cand = prev_score + seg + add;
                if cand > best {
                    best = cand;
                    best_j = j as u8;
                }
            }

            ws.dp_ring[row * ring_w + k] = best;
            let bp_idx = ws.span_index(pos, k);
            ws.bp_prevlen[bp_idx] = best_j;
        }
    }

    // 最良終端状態を選択
    let end_row = n_cp % l1;
    let mut best_final = SCORE_NEG_INF;
    let mut best_k = 0usize;
    for k in 1..=l.min(n_cp) {
        let v = ws.dp_ring[end_row * ring_w + k];
        if v > best_final {
            best_final = v;
            best_k = k;
        }
    }

    if best_k == 0 || best_final == SCORE_NEG_INF {
        return Err(MomijiError::NoCover(format!(
            "no segmentation reaches the end of the input (n_cp={n_cp}, max_word_len={l})"
        )));
    }

    // バックトラックで境界を復元（逆順に収集して反転）
    let mut pos = n_cp;
    let mut k = best_k;
    loop {
        out_b_cp.push(pos as u16);
        if pos == 0 {
            break;
        }
        let start = pos - k;
        let j = ws.bp_prevlen[ws.span_index(pos, k)];
        pos = start;
        k = usize::from(j);
        if pos == 0 {
            out_b_cp.push(0);
            break;
        }
        if k == 0 {
            return Err(MomijiError::invalid_state("corrupted backpointer"));
        }
        if out_b_cp.len() > n_cp + 1 {
            return Err(MomijiError::invalid_state("backtrack did not terminate"));
        }
    }
    out_b_cp.reverse();

    if out_b_cp.first() != Some(&0) || out_b_cp.last().map(|&b| usize::from(b)) != Some(n_cp) {
        return Err(MomijiError::invalid_state("malformed boundary array"));
    }

    Ok(best_final)
}

/// 境界インデックスをコードポイント単位からバイト単位に変換します。
///
/// # 引数
///
/// * `cp_off` - デコード時に構築されたオフセット配列（[`Workspace::offsets`]）
/// * `b_cp` - 境界配列（コードポイント単位）
/// * `out` - 出力境界配列（バイト単位、クリアされる）
pub fn boundaries_to_bytes(cp_off: &[u16], b_cp: &[u16], out: &mut Vec<u16>) {
    out.clear();
    out.extend(b_cp.iter().map(|&b| cp_off[usize::from(b)]));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::toy_model;

    #[test]
    fn test_decode_empty() {
        let model = toy_model(&[("a", -1.0)], 4);
        let mut ws = Workspace::new(16, 4).unwrap();
        let mut b = vec![];
        let score = decode(&model, b"", &mut ws, &mut b).unwrap();
        assert_eq!(b, vec![0, 0]);
        assert_eq!(score, i32::from(model.crf.bos_to1));
    }

    #[test]
    fn test_decode_prefers_high_probability_piece() {
        let model = toy_model(&[("a", -3.0), ("b", -3.0), ("ab", -1.0)], 4);
        let mut ws = Workspace::new(16, 4).unwrap();
        let mut b = vec![];
        decode(&model, b"ab", &mut ws, &mut b).unwrap();
        assert_eq!(b, vec![0, 2]);
    }

    #[test]
    fn test_decode_splits_when_pieces_win() {
        let model = toy_model(&[("a", -0.5), ("b", -0.5), ("ab", -4.0)], 4);
        let mut ws = Workspace::new(16, 4).unwrap();
        let mut b = vec![];
        decode(&model, b"ab", &mut ws, &mut b).unwrap();
        assert_eq!(b, vec![0, 1, 2]);
    }

    #[test]
    fn test_decode_multibyte_boundaries() {
        let model = toy_model(&[("東", -2.0), ("京", -2.0), ("東京", -1.0)], 4);
        let mut ws = Workspace::new(16, 4).unwrap();
        let mut b = vec![];
        decode(&model, "東京".as_bytes(), &mut ws, &mut b).unwrap();
        assert_eq!(b, vec![0, 2]);
        let mut bytes = vec![];
        boundaries_to_bytes(ws.offsets(), &b, &mut bytes);
        assert_eq!(bytes, vec![0, 6]);
    }

    #[test]
    fn test_boundary_well_formedness() {
        let model = toy_model(
            &[("a", -1.5), ("b", -1.5), ("c", -1.5), ("ab", -2.0), ("bc", -2.0)],
            3,
        );
        let mut ws = Workspace::new(16, 3).unwrap();
        let mut b = vec![];
        let input = b"abcabc";
        decode(&model, input, &mut ws, &mut b).unwrap();
        assert_eq!(b[0], 0);
        assert_eq!(usize::from(*b.last().unwrap()), 6);
        for w in b.windows(2) {
            assert!(w[0] < w[1]);
            assert!(usize::from(w[1] - w[0]) <= 3);
        }
        // 境界からバイトを再構成すると入力と一致する
        let mut bytes = vec![];
        boundaries_to_bytes(ws.offsets(), &b, &mut bytes);
        let mut rebuilt = vec![];
        for w in bytes.windows(2) {
            rebuilt.extend_from_slice(&input[usize::from(w[0])..usize::from(w[1])]);
        }
        assert_eq!(&rebuilt, input);
    }

    #[test]
    fn test_unknown_span_penalty_still_covers() {
        // 語彙に無い文字もOOVペナルティで1文字スパンとしてカバーされる
        let model = toy_model(&[("a", -1.0)], 4);
        let mut ws = Workspace::new(16, 4).unwrap();
        let mut b = vec![];
        decode(&model, b"axa", &mut ws, &mut b).unwrap();
        assert_eq!(b.first(), Some(&0));
        assert_eq!(b.last(), Some(&3));
    }

    #[test]
    fn test_input_exceeds_workspace() {
        let model = toy_model(&[("a", -1.0)], 2);
        let mut ws = Workspace::new(3, 2).unwrap();
        let mut b = vec![];
        let e = decode(&model, b"aaaaaa", &mut ws, &mut b);
        assert!(matches!(e, Err(MomijiError::WorkspaceTooSmall { .. })));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let model = toy_model(&[("a", -1.0)], 2);
        let mut ws = Workspace::new(16, 2).unwrap();
        let mut b = vec![];
        let e = decode(&model, &[0x61, 0x80], &mut ws, &mut b);
        assert!(matches!(e, Err(MomijiError::InvalidUtf8 { .. })));
    }

    #[test]
    fn test_workspace_reuse_between_calls() {
        let model = toy_model(&[("a", -1.0), ("b", -1.0), ("ab", -0.5)], 4);
        let mut ws = Workspace::new(16, 4).unwrap();
        let mut b = vec![];
        decode(&model, b"ab", &mut ws, &mut b).unwrap();
        assert_eq!(b, vec![0, 2]);
        decode(&model, b"a", &mut ws, &mut b).unwrap();
        assert_eq!(b, vec![0, 1]);
        decode(&model, b"", &mut ws, &mut b).unwrap();
        assert_eq!(b, vec![0, 0]);
    }
}
