//! Q8.8固定小数点と対数領域の数値ユーティリティ
//!
//! 推論時のスコアはすべて符号付き固定小数点（Q8.8、スケール=256）で表現します。
//! 上位8ビットが整数部、下位8ビットが小数部です（例: 1.5 = 0x0180）。
//! 学習時のみ`f64`の対数領域演算（log-sum-exp）を使用します。

/// 1.0に相当するQ8.8の整数値
pub const Q88_SCALE: i32 = 1 << 8;

/// DP初期化用の「負の無限大」番兵値
///
/// 加算してもオーバーフローしないよう、`i32::MIN`より十分大きい値を使います。
pub const SCORE_NEG_INF: i32 = -0x3fff_ffff;

/// Q8.8同士の乗算
///
/// `(Q8.8 * Q8.8) >> 8 -> Q8.8`。64ビット中間結果でオーバーフローを回避します。
#[inline(always)]
pub const fn q16_mul_q8(a_q8: i32, b_q8: i32) -> i32 {
    ((a_q8 as i64 * b_q8 as i64) >> 8) as i32
}

/// `i32`値を`i16`の範囲に飽和させます。
#[inline(always)]
pub const fn sat_i16(v: i32) -> i16 {
    if v > i16::MAX as i32 {
        i16::MAX
    } else if v < i16::MIN as i32 {
        i16::MIN
    } else {
        v as i16
    }
}

/// `f64`値をQ8.8に変換します（最近接丸め、`i16`範囲に飽和）。
#[inline]
pub fn q88_from_f64(v: f64) -> i16 {
    let x = v * Q88_SCALE as f64;
    if x >= i16::MAX as f64 {
        i16::MAX
    } else if x <= i16::MIN as f64 {
        i16::MIN
    } else {
        x.round() as i16
    }
}

/// Q8.8値を`f64`に変換します。
#[inline(always)]
pub fn q88_to_f64(q: i32) -> f64 {
    q as f64 / Q88_SCALE as f64
}

/// log(exp(a) + exp(b)) を数値的に安定に計算します（学習用、f64）。
///
/// 片方が負の無限大であればもう一方を返します。NaNを伝播させないため、
/// 判定は`-inf`チェックで行います。
#[inline]
pub fn log_sum_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = if a > b { a } else { b };
    m + ((a - m).exp() + (b - m).exp()).ln()
}
