//! L-BFGS最小化器
//!
//! 小規模な教師ありデータセット向けの限定メモリ準ニュートン法です。
//! 履歴は`m`組の`(s, y)`ベクトルをリングバッファで保持し、探索方向は
//! two-loop再帰で計算します。直線探索はArmijo条件のバックトラッキング
//! （ステップ半減、最大`ls_max`回評価）です。
//!
//! * 初期ヘッセ近似は `H0 = (s^T y) / (y^T y)`
//! * 方向が降下条件を満たさない場合は履歴をリセットして最急降下へ
//! * `s^T y <= 1e-12` の場合は曲率更新をスキップ（数値的に不良）
//! * 収束判定は勾配ノルム `||g|| < tol`

use log::info;

use crate::errors::{MomijiError, Result};

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm2(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// L-BFGSで`eval`が定義する目的関数を最小化します。
///
/// `eval(x, g)`は`x`での目的関数値を返し、勾配を`g`に書き込みます。
/// `x`はインプレースで更新されます。
///
/// # 引数
///
/// * `x` - 初期点（最適化後は最終点）
/// * `max_iter` - 最大反復回数
/// * `m_hist` - 履歴サイズ（1..=32にクランプ）
/// * `tol` - 勾配ノルムの収束閾値
/// * `ls_max` - 直線探索の最大評価回数
/// * `eval` - 目的関数と勾配の評価関数
pub fn minimize<F>(
    x: &mut [f64],
    max_iter: usize,
    m_hist: usize,
    tol: f64,
    ls_max: usize,
    mut eval: F,
) -> Result<()>
where
    F: FnMut(&[f64], &mut [f64]) -> f64,
{
    let n = x.len();
    if n == 0 {
        return Err(MomijiError::invalid_argument("x", "empty parameter vector"));
    }
    let max_iter = max_iter.max(1);
    let m_hist = m_hist.clamp(1, 32);
    let tol = if tol > 0.0 { tol } else { 1e-5 };
    let ls_max = if ls_max > 0 { ls_max } else { 20 };

    let mut g = vec![0.0; n];
    let mut g_new = vec![0.0; n];
    let mut x_new = vec![0.0; n];
    let mut d = vec![0.0; n];
    let mut q = vec![0.0; n];
    let mut alpha = vec![0.0; m_hist];
    let mut rho = vec![0.0; m_hist];
    let mut s_hist = vec![0.0; m_hist * n];
    let mut y_hist = vec![0.0; m_hist * n];

    let mut hist_count = 0usize;
    let mut hist_start = 0usize;

    let mut f = eval(x, &mut g);

    for it in 0..max_iter {
        let gnorm = norm2(&g);
        if gnorm < tol {
            info!("lbfgs converged it={it} grad_norm={gnorm:.6e}");
            break;
        }

        // two-loop再帰で探索方向を計算
        q.copy_from_slice(&g);
        for i in (0..hist_count).rev() {
            let idx = (hist_start + i) % m_hist;
            let s = &s_hist[idx * n..(idx + 1) * n];
            let y = &y_hist[idx * n..(idx + 1) * n];
            let a = rho[idx] * dot(s, &q);
            alpha[i] = a;
            for (qj, yj) in q.iter_mut().zip(y) {
                *qj -= a * yj;
            }
        }

        let mut h0 = 1.0;
        if hist_count > 0 {
            let idx_last = (hist_start + hist_count - 1) % m_hist;
            let s = &s_hist[idx_last * n..(idx_last + 1) * n];
            let y = &y_hist[idx_last * n..(idx_last + 1) * n];
            let sy = dot(s, y);
            let yy = dot(y, y);
            if yy > 0.0 {
                h0 = sy / yy;
            }
        }

        for (dj, qj) in d.iter_mut().zip(&q) {
            *dj = h0 * qj;
        }
        for i in 0..hist_count {
            let idx = (hist_start + i) % m_hist;
            let s = &s_hist[idx * n..(idx + 1) * n];
            let y = &y_hist[idx * n..(idx + 1) * n];
            let b = rho[idx] * dot(y, &d);
            let a = alpha[i];
            for (dj, sj) in d.iter_mut().zip(s) {
                *dj += (a - b) * sj;
            }
        }
        for dj in d.iter_mut() {
            *dj = -*dj;
        }

        let mut gtd = dot(&g, &d);
        if !(gtd < 0.0) {
            // 降下方向でない: 履歴を捨てて最急降下にフォールバック
            for (dj, gj) in d.iter_mut().zip(&g) {
                *dj = -gj;
            }
            gtd = dot(&g, &d);
            hist_count = 0;
            hist_start = 0;
        }

        // Armijoバックトラッキング直線探索
        let c1 = 1e-4;
        let mut t = 1.0;
        let mut accepted = false;
        let mut f_new = f;
        for _ in 0..ls_max {
            for ((xn, xo), dj) in x_new.iter_mut().zip(x.iter()).zip(&d) {
                *xn = xo + t * dj;
            }
            f_new = eval(&x_new, &mut g_new);
            if f_new <= f + c1 * t * gtd {
                accepted = true;
                break;
            }
            t *= 0.5;
            if t < 1e-20 {
                break;
            }
        }

        if !accepted {
            info!("lbfgs line search failed (it={it}); stopping");
            break;
        }

        // 履歴更新: s = x_new - x, y = g_new - g
        let store_idx;
        if hist_count < m_hist {
            store_idx = (hist_start + hist_count) % m_hist;
            hist_count += 1;
        } else {
            store_idx = hist_start;
            hist_start = (hist_start + 1) % m_hist;
        }
        {
            let s = &mut s_hist[store_idx * n..(store_idx + 1) * n];
            for ((sj, xn), xo) in s.iter_mut().zip(&x_new).zip(x.iter()) {
                *sj = xn - xo;
            }
        }
        {
            let y = &mut y_hist[store_idx * n..(store_idx + 1) * n];
            for ((yj, gn), go) in y.iter_mut().zip(&g_new).zip(g.iter()) {
                *yj = gn - go;
            }
        }
        let ys = dot(
            &y_hist[store_idx * n..(store_idx + 1) * n],
            &s_hist[store_idx * n..(store_idx + 1) * n],
        );
        if ys > 1e-12 {
            rho[store_idx] = 1.0 / ys;
        } else {
            // 数値的に不良な曲率は履歴ごと破棄する
            hist_count = 0;
            hist_start = 0;
        }

        x.copy_from_slice(&x_new);
        g.copy_from_slice(&g_new);
        f = f_new;

        info!(
            "lbfgs it={}/{} f={:.6} grad_norm={:.6e} step={:.3e}",
            it + 1,
            max_iter,
            f,
            norm2(&g),
            t
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimize_quadratic() {
        // f(x) = (x0-3)^2 + 2*(x1+1)^2
        let mut x = vec![0.0, 0.0];
        minimize(&mut x, 100, 8, 1e-8, 20, |x, g| {
            g[0] = 2.0 * (x[0] - 3.0);
            g[1] = 4.0 * (x[1] + 1.0);
            (x[0] - 3.0).powi(2) + 2.0 * (x[1] + 1.0).powi(2)
        })
        .unwrap();
        assert!((x[0] - 3.0).abs() < 1e-5);
        assert!((x[1] + 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_minimize_rosenbrock() {
        let mut x = vec![-1.2, 1.0];
        minimize(&mut x, 500, 8, 1e-8, 40, |x, g| {
            let (a, b) = (x[0], x[1]);
            g[0] = -2.0 * (1.0 - a) - 400.0 * a * (b - a * a);
            g[1] = 200.0 * (b - a * a);
            (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2)
        })
        .unwrap();
        assert!((x[0] - 1.0).abs() < 1e-3, "x = {x:?}");
        assert!((x[1] - 1.0).abs() < 1e-3, "x = {x:?}");
    }

    #[test]
    fn test_empty_rejected() {
        let mut x: Vec<f64> = vec![];
        assert!(minimize(&mut x, 10, 8, 1e-5, 20, |_, _| 0.0).is_err());
    }
}
