//! Forward-Filtering Backward-Sampling（確率的分割）
//!
//! 最良解ではなく、統合スコアに比例した確率分布から分割を1つサンプル
//! します（Subword Regularization用途）。前向きパスは`max`をlog-sum-expに
//! 置き換えた`f64`のDPで、温度パラメータ`τ`でスコアを`1/τ`倍します。
//! 後ろ向きパスは各状態で前状態を`exp(alpha[s][j] + edge/τ - alpha[t][k])`
//! に比例した重みでサンプルします。
//!
//! 乱数状態は呼び出し側から明示的に渡されるため、シードを固定すれば
//! 結果は再現可能です。

use crate::common::PIECE_ID_BOS;
use crate::decoder::{lm_edge_add, prepare, seg_score, SampleWorkspace, Workspace};
use crate::errors::{MomijiError, Result};
use crate::model::Model;
use crate::num::{log_sum_exp, q88_to_f64};

/// 32ビットxorshift乱数生成器
///
/// 状態0は退化するため、シード0は固定値に置き換えられます。
#[derive(Debug, Clone)]
pub struct XorShift32 {
    state: u32,
}

impl XorShift32 {
    /// シードを指定して生成器を作成します。
    pub fn new(seed: u32) -> Self {
        Self {
            state: if seed == 0 { 0x12345678 } else { seed },
        }
    }

    /// 次の32ビット乱数を返します。
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// `[0, 1)`の一様乱数を返します（上位24ビットを仮数に使用）。
    #[inline]
    pub fn next_f64(&mut self) -> f64 {
        f64::from(self.next_u32() >> 8) * (1.0 / 16777216.0)
    }
}

/// FFBSによる1サンプルデコード
///
/// # 引数
///
/// * `model` - 統合モデル
/// * `input` - 入力UTF-8バイト列
/// * `ws` - 作業領域
/// * `sw` - サンプリング用追加領域（寸法は`ws`と一致していること）
/// * `temperature` - 温度。1.0で通常、大きいほど分割が揺らぐ。
///   正の有限値でない場合は1.0として扱います
/// * `rng` - 乱数生成器（呼び出し側がシードを管理）
/// * `out_b_cp` - 出力境界配列（コードポイント単位、クリアされる)
///
/// # 戻り値
///
/// サンプルされたパスのスコア（Q8.8）
pub fn decode_sample(
    model: &Model,
    input: &[u8],
    ws: &mut Workspace,
    sw: &mut SampleWorkspace,
    temperature: f64,
    rng: &mut XorShift32,
    out_b_cp: &mut Vec<u16>,
) -> Result<i32> {
    let temperature = if temperature.is_finite() && temperature > 0.0 {
        temperature
    } else {
        1.0
    };

    let n_cp = prepare(model, input, ws)?;
    let l = usize::from(model.max_word_len);
    let l1 = l + 1;

    let states = (n_cp + 1) * sw.l1;
    if sw.alpha.len() < states || sw.l1 < l1 {
        return Err(MomijiError::WorkspaceTooSmall {
            msg: "sampling alpha table",
            required: states,
        });
    }

    out_b_cp.clear();
    if n_cp == 0 {
        out_b_cp.push(0);
        out_b_cp.push(0);
        return Ok(i32::from(model.crf.bos_to1));
    }
    out_b_cp.reserve(n_cp + 1);

    // 前向き: log-sum DP
    sw.alpha[..states].fill(f64::NEG_INFINITY);
    sw.alpha[0] = q88_to_f64(i32::from(model.crf.bos_to1)) / temperature;

    for pos in 1..=n_cp {
        let kmax = l.min(pos);
        for k in 1..=kmax {
            let start = pos - k;
            let seg = seg_score(model, ws, start, pos);
            let idx_curr = ws.span_index(pos, k);
            let curr_id = ws.span_id[idx_curr];
            let curr_luni = ws.span_luni[idx_curr];

            let mut log_sum = f64::NEG_INFINITY;
            if start == 0 {
                let prev = sw.at(0, 0);
                if prev != f64::NEG_INFINITY {
                    let add = lm_edge_add(model, PIECE_ID_BOS, curr_id, curr_luni);
                    let edge = q88_to_f64(seg + add) / temperature;
                    log_sum = prev + edge;
                }
            } else {
                let jmax = l.min(start);
                for j in 1..=jmax {
                    let prev = sw.at(start, j);
                    if prev == f64::NEG_INFINITY {
                        continue;
                    }
                    let prev_id = ws.span_id[ws.span_index(start, j)];
                    let add = lm_edge_add(model, prev_id, curr_id, curr_luni);
                    let edge = q88_to_f64(seg + add) / temperature;
                    log_sum = log_sum_exp(log_sum, prev + edge);
                }
            }

            sw.alpha[pos * sw.l1 + k] = log_sum;
        }
    }

    // 終端kをsoftmax(alpha[N][.])からサンプル
    let kmax_end = l.min(n_cp);
    let mut log_z = f64::NEG_INFINITY;
    for k in 1..=kmax_end {
        log_z = log_sum_exp(log_z, sw.at(n_cp, k));
    }
    if log_z == f64::NEG_INFINITY {
        return Err(MomijiError::NoCover(
            "sampling partition function is zero".to_string(),
        ));
    }

    let u = rng.next_f64();
    let mut cdf = 0.0;
    let mut cur_k = 1usize;
    for k in 1..=kmax_end {
        let p = (sw.at(n_cp, k) - log_z).exp();
        cdf += p;
        if u <= cdf {
            cur_k = k;
            break;
        }
    }

    // 後ろ向きサンプリング
    let mut pos = n_cp;
    let mut k = cur_k;
    loop {
        out_b_cp.push(pos as u16);
        if pos == 0 {
            break;
        }
        let start = pos - k;
        if start == 0 {
            out_b_cp.push(0);
            break;
        }

        // p(j | pos, k) ∝ exp(alpha[start][j] + edge(j -> k) - alpha[pos][k])
        let jmax = l.min(start);
        let seg = seg_score(model, ws, start, pos);
        let idx_curr = ws.span_index(pos, k);
        let curr_id = ws.span_id[idx_curr];
        let curr_luni = ws.span_luni[idx_curr];
        let alpha_cur = sw.at(pos, k);

        // 1パス目: 最大log重み（exp下限対策のシフト量）
        let mut maxlw = f64::NEG_INFINITY;
        let mut valid = 0usize;
        for j in 1..=jmax {
            let a_prev = sw.at(start, j);
            if a_prev == f64::NEG_INFINITY {
                continue;
            }
            let prev_id = ws.span_id[ws.span_index(start, j)];
            let add = lm_edge_add(model, prev_id, curr_id, curr_luni);
            let edge = q88_to_f64(seg + add) / temperature;
            let lw = (a_prev + edge) - alpha_cur;
            if lw > maxlw {
                maxlw = lw;
            }
            valid += 1;
        }
        if valid == 0 || maxlw == f64::NEG_INFINITY {
            return Err(MomijiError::invalid_state(
                "no valid predecessor during backward sampling",
            ));
        }

        // 2パス目: 正規化定数
        let mut sum = 0.0;
        for j in 1..=jmax {
            let a_prev = sw.at(start, j);
            if a_prev == f64::NEG_INFINITY {
                continue;
            }
            let prev_id = ws.span_id[ws.span_index(start, j)];
            let add = lm_edge_add(model, prev_id, curr_id, curr_luni);
            let edge = q88_to_f64(seg + add) / temperature;
            sum += ((a_prev + edge) - alpha_cur - maxlw).exp();
        }
        if !(sum > 0.0) || !sum.is_finite() {
            return Err(MomijiError::invalid_state(
                "degenerate predecessor distribution during backward sampling",
            ));
        }

        // 3パス目: 累積和から1つ選ぶ
        let r = rng.next_f64() * sum;
        let mut acc = 0.0;
        let mut pick = 1usize;
        for j in 1..=jmax {
            let a_prev = sw.at(start, j);
            if a_prev == f64::NEG_INFINITY {
                continue;
            }
            let prev_id = ws.span_id[ws.span_index(start, j)];
            let add = lm_edge_add(model, prev_id, curr_id, curr_luni);
            let edge = q88_to_f64(seg + add) / temperature;
            acc += ((a_prev + edge) - alpha_cur - maxlw).exp();
            pick = j;
            if r <= acc {
                break;
            }
        }

        pos = start;
        k = pick;
        if out_b_cp.len() > n_cp + 1 {
            return Err(MomijiError::invalid_state(
                "backward sampling did not terminate",
            ));
        }
    }

    out_b_cp.reverse();
    if out_b_cp.first() != Some(&0) || out_b_cp.last().map(|&b| usize::from(b)) != Some(n_cp) {
        return Err(MomijiError::invalid_state("malformed boundary array"));
    }

    // サンプルされたパスのスコアをQ8.8で計算
    let mut total = i32::from(model.crf.bos_to1);
    for i in 0..out_b_cp.len() - 1 {
        let s = usize::from(out_b_cp[i]);
        let t = usize::from(out_b_cp[i + 1]);
        let len_cp = t - s;
        if len_cp == 0 || len_cp > l {
            continue;
        }
        let seg = seg_score(model, ws, s, t);
        let idx = ws.span_index(t, len_cp);
        let curr_id = ws.span_id[idx];
        let curr_luni = ws.span_luni[idx];

        let mut prev_id = PIECE_ID_BOS;
        if i > 0 {
            let ps = usize::from(out_b_cp[i - 1]);
            let pt = usize::from(out_b_cp[i]);
            let plen = pt - ps;
            if plen > 0 && plen <= l {
                prev_id = ws.span_id[ws.span_index(pt, plen)];
            }
        }

        total += seg + lm_edge_add(model, prev_id, curr_id, curr_luni);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;
    use crate::test_utils::toy_model;

    #[test]
    fn test_xorshift_reproducible() {
        let mut a = XorShift32::new(42);
        let mut b = XorShift32::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
        let u = a.next_f64();
        assert!((0.0..1.0).contains(&u));
    }

    #[test]
    fn test_xorshift_zero_seed() {
        let mut a = XorShift32::new(0);
        let mut b = XorShift32::new(0x12345678);
        assert_eq!(a.next_u32(), b.next_u32());
    }

    #[test]
    fn test_sample_empty() {
        let model = toy_model(&[("a", -1.0)], 4);
        let mut ws = Workspace::new(16, 4).unwrap();
        let mut sw = SampleWorkspace::new(16, 4);
        let mut rng = XorShift32::new(1);
        let mut b = vec![];
        let score =
            decode_sample(&model, b"", &mut ws, &mut sw, 1.0, &mut rng, &mut b).unwrap();
        assert_eq!(b, vec![0, 0]);
        assert_eq!(score, i32::from(model.crf.bos_to1));
    }

    #[test]
    fn test_sample_boundaries_well_formed() {
        let model = toy_model(
            &[("a", -1.0), ("b", -1.0), ("ab", -1.2), ("ba", -1.2)],
            3,
        );
        let mut ws = Workspace::new(32, 3).unwrap();
        let mut sw = SampleWorkspace::new(32, 3);
        let mut rng = XorShift32::new(7);
        let mut b = vec![];
        for _ in 0..50 {
            decode_sample(&model, b"abab", &mut ws, &mut sw, 1.0, &mut rng, &mut b).unwrap();
            assert_eq!(b[0], 0);
            assert_eq!(*b.last().unwrap(), 4);
            for w in b.windows(2) {
                assert!(w[0] < w[1]);
                assert!(w[1] - w[0] <= 3);
            }
        }
    }

    #[test]
    fn test_low_temperature_concentrates_on_viterbi() {
        let model = toy_model(&[("a", -3.0), ("b", -3.0), ("ab", -0.5)], 4);
        let mut ws = Workspace::new(16, 4).unwrap();
        let mut sw = SampleWorkspace::new(16, 4);
        let mut viterbi_b = vec![];
        decode(&model, b"ab", &mut ws, &mut viterbi_b).unwrap();

        let mut rng = XorShift32::new(3);
        let mut b = vec![];
        for _ in 0..20 {
            decode_sample(&model, b"ab", &mut ws, &mut sw, 0.01, &mut rng, &mut b).unwrap();
            assert_eq!(b, viterbi_b);
        }
    }

    #[test]
    fn test_high_temperature_spreads() {
        // τ→∞で分布は一様に近づくため、両方の分割が観測されるはず
        let model = toy_model(&[("a", -3.0), ("b", -3.0), ("ab", -0.5)], 4);
        let mut ws = Workspace::new(16, 4).unwrap();
        let mut sw = SampleWorkspace::new(16, 4);
        let mut rng = XorShift32::new(11);
        let mut b = vec![];
        let mut seen_joined = false;
        let mut seen_split = false;
        for _ in 0..200 {
            decode_sample(&model, b"ab", &mut ws, &mut sw, 100.0, &mut rng, &mut b).unwrap();
            match b.len() {
                2 => seen_joined = true,
                3 => seen_split = true,
                _ => unreachable!(),
            }
        }
        assert!(seen_joined && seen_split);
    }

    #[test]
    fn test_invalid_temperature_falls_back() {
        let model = toy_model(&[("a", -1.0)], 4);
        let mut ws = Workspace::new(16, 4).unwrap();
        let mut sw = SampleWorkspace::new(16, 4);
        let mut rng = XorShift32::new(5);
        let mut b = vec![];
        for bad in [f64::NAN, f64::INFINITY, 0.0, -2.0] {
            decode_sample(&model, b"a", &mut ws, &mut sw, bad, &mut rng, &mut b).unwrap();
            assert_eq!(b, vec![0, 1]);
        }
    }
}
