//! 2ラベル線形連鎖CRFの教師あり学習
//!
//! 境界ラベル（`y[i] = 1`が単語開始、`0`が単語内部）の学習を行います。
//! 制約:
//!
//! - `y[0] = 1` を強制
//! - 文末は暗黙にラベル1（EOS）への遷移として扱う
//!
//! 前向き-後ろ向きは対数領域の`f64`で計算し、勾配は経験カウントから
//! 期待カウントを引いたものです。L2正則化は勾配から`λ·w`を引き、
//! 損失に`½λ‖w‖²`を加えます。最適化はSGD（エポック毎のバッチ更新）と
//! L-BFGS + Armijo直線探索の2種類を提供します。

use std::io::{BufRead, BufReader, Read};

use log::{info, warn};

use crate::charclass::{CharClassifier, CC_BOS, CC_EOS};
use crate::errors::{MomijiError, Result};
use crate::model::feat_key;
use crate::num::log_sum_exp;
use crate::trainer::corpus::trim_line;
use crate::trainer::lbfgs;
use crate::trainer::unigram::{viterbi_tokenize, UnigramModel, UnigramWorkspace};
use crate::trainer::CorpusIter;
use crate::utf8;

/// 素性キーのソート済みテーブル
///
/// 学習対象の素性キー集合を固定し、重みベクトルのインデックスへ
/// 写像します。未知のキーは無視されます（重み0扱い）。
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    keys: Vec<u32>,
}

impl FeatureTable {
    /// キー集合からテーブルを作成します（ソート・重複除去）。
    pub fn new(mut keys: Vec<u32>) -> Self {
        keys.sort_unstable();
        keys.dedup();
        Self { keys }
    }

    /// テーブルのエントリ数を返します。
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// テーブルが空かどうかを返します。
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// ソート済みキー配列を返します。
    #[inline(always)]
    pub fn keys(&self) -> &[u32] {
        &self.keys
    }

    /// キーのインデックスを二分探索します。
    #[inline]
    pub fn find(&self, key: u32) -> Option<usize> {
        self.keys.binary_search(&key).ok()
    }
}

/// 学習中のCRF重み（f64）
#[derive(Debug, Clone)]
pub struct CrfWeights {
    /// 素性重み（[`FeatureTable`]と同じ並び）
    pub feat_w: Vec<f64>,
    /// 遷移重み
    pub trans00: f64,
    /// 遷移重み
    pub trans01: f64,
    /// 遷移重み
    pub trans10: f64,
    /// 遷移重み
    pub trans11: f64,
    /// BOSから最初のラベルへの遷移重み
    pub bos_to1: f64,
}

impl CrfWeights {
    /// すべてゼロの重みを作成します。
    pub fn zeros(n_feat: usize) -> Self {
        Self {
            feat_w: vec![0.0; n_feat],
            trans00: 0.0,
            trans01: 0.0,
            trans10: 0.0,
            trans11: 0.0,
            bos_to1: 0.0,
        }
    }
}

/// 学習用の1文（コードポイント毎の文字クラスと境界ラベル）
#[derive(Debug, Clone)]
pub struct CrfSentence {
    /// 文字クラス列
    pub cls: Vec<u8>,
    /// ラベル列（1 = 開始, 0 = 内部）
    pub y: Vec<u8>,
}

/// 教師ありCRFデータセット
#[derive(Debug, Default)]
pub struct CrfDataset {
    /// 文のリスト
    pub sentences: Vec<CrfSentence>,
    /// 総位置数（全文のコードポイント数の合計）
    pub total_pos: usize,
}

impl CrfDataset {
    /// 文を追加します。`y[0] = 1`が強制されます。
    pub fn push(&mut self, cls: Vec<u8>, mut y: Vec<u8>) {
        if cls.is_empty() || cls.len() != y.len() {
            return;
        }
        y[0] = 1;
        self.total_pos += cls.len();
        self.sentences.push(CrfSentence { cls, y });
    }

    /// 分かち書き済みテキストからデータセットを構築します。
    ///
    /// 各行は空白区切りのトークン列で、トークンの先頭コードポイントが
    /// ラベル1、それ以外が0になります。不正なUTF-8を含む行と
    /// `max_sentence_cp`を超える行はスキップされます。
    pub fn from_segmented_reader<R>(
        rdr: R,
        cc: &CharClassifier,
        max_line_bytes: usize,
        max_sentence_cp: usize,
    ) -> Result<Self>
    where
        R: Read,
    {
        let mut ds = Self::default();
        let reader = BufReader::new(rdr);
        for line in reader.split(b'\n') {
            let mut line = line?;
            trim_line(&mut line);
            if line.is_empty() {
                continue;
            }
            if max_line_bytes > 0 && line.len() > max_line_bytes {
                continue;
            }
            if let Some((cls, y)) = parse_segmented_line(&line, cc, max_sentence_cp) {
                ds.push(cls, y);
            }
        }
        Ok(ds)
    }

    /// LM単独のビタビ分割から疑似ラベルのデータセットを構築します。
    ///
    /// ピースの先頭コードポイントが`y = 1`、内部が`y = 0`になります。
    /// 分割に失敗した文は全コードポイントを境界とするフォールバックで
    /// 取り込みます。
    pub fn from_lm_viterbi(
        corpus: &mut dyn CorpusIter,
        um: &UnigramModel,
        wk: &mut UnigramWorkspace,
        max_piece_len_cp: usize,
        limit_sentences: usize,
        cc: &CharClassifier,
    ) -> Result<Self> {
        let mut ds = Self::default();
        corpus.reset()?;

        let mut ids = vec![];
        let mut n_read = 0usize;
        let mut n_ok = 0usize;
        let mut n_err = 0usize;

        while ds.sentences.len() < limit_sentences {
            let sent = match corpus.next_sentence()? {
                Some(s) => s.to_vec(),
                None => break,
            };
            if sent.is_empty() {
                continue;
            }
            n_read += 1;

            let mut cls = vec![];
            let mut pos = 0;
            while pos < sent.len() {
                match utf8::decode_cp(&sent, pos) {
                    Some((cp, adv)) => {
                        cls.push(cc.classify(cp));
                        pos += adv;
                    }
                    None => {
                        cls.push(cc.classify(u32::from(sent[pos])));
                        pos += 1;
                    }
                }
            }
            let n_cp = cls.len();
            if n_cp == 0 {
                continue;
            }

            let mut y = vec![0u8; n_cp];
            match viterbi_tokenize(um, &sent, max_piece_len_cp, wk, &mut ids) {
                Ok(()) => {
                    n_ok += 1;
                    let mut cp_idx = 0usize;
                    for &pid in &ids {
                        if cp_idx >= n_cp {
                            break;
                        }
                        y[cp_idx] = 1;
                        cp_idx += usize::from(um.piece(pid).len_cp);
                    }
                    // ピース列が尽きた残りはすべて境界扱い
                    for yy in y.iter_mut().skip(cp_idx) {
                        *yy = 1;
                    }
                }
                Err(_) => {
                    // フォールバック: 全コードポイントを境界にする
                    n_err += 1;
                    y.fill(1);
                }
            }

            ds.push(cls, y);
        }

        info!(
            "pseudo-label dataset: read={} viterbi_ok={} viterbi_err={} pushed={}",
            n_read,
            n_ok,
            n_err,
            ds.sentences.len()
        );
        Ok(ds)
    }
}

/// 分かち書き済み行を`(文字クラス列, ラベル列)`に解析します。
fn parse_segmented_line(
    line: &[u8],
    cc: &CharClassifier,
    max_sentence_cp: usize,
) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut cls = vec![];
    let mut y = vec![];
    let mut pos = 0;
    let mut at_token_start = true;

    while pos < line.len() {
        let b = line[pos];
        if b == b' ' || b == b'\t' {
            pos += 1;
            at_token_start = true;
            continue;
        }
        let (cp, adv) = utf8::decode_cp(line, pos)?;
        pos += adv;
        if max_sentence_cp > 0 && cls.len() >= max_sentence_cp {
            return None; // 長すぎる文は丸ごとスキップ
        }
        cls.push(cc.classify(cp));
        y.push(u8::from(at_token_start));
        at_token_start = false;
    }

    if cls.is_empty() {
        return None;
    }
    y[0] = 1;
    Some((cls, y))
}

/// 文毎の再利用バッファ（最大文長分）
struct Scratch {
    e0: Vec<f64>,
    e1: Vec<f64>,
    a0: Vec<f64>,
    a1: Vec<f64>,
    b0: Vec<f64>,
    b1: Vec<f64>,
}

impl Scratch {
    fn new(max_n: usize) -> Self {
        Self {
            e0: vec![0.0; max_n],
            e1: vec![0.0; max_n],
            a0: vec![0.0; max_n],
            a1: vec![0.0; max_n],
            b0: vec![0.0; max_n],
            b1: vec![0.0; max_n],
        }
    }
}

/// 1位置の放射スコア（f64重み版）
fn emit_score_one(
    tbl: &FeatureTable,
    feat_w: &[f64],
    label: u8,
    prev_c: u8,
    cur_c: u8,
    next_c: u8,
) -> f64 {
    let mut s = 0.0;
    if let Some(i) = tbl.find(feat_key(0, label, cur_c, 0)) {
        s += feat_w[i];
    }
    if let Some(i) = tbl.find(feat_key(1, label, prev_c, 0)) {
        s += feat_w[i];
    }
    if let Some(i) = tbl.find(feat_key(2, label, next_c, 0)) {
        s += feat_w[i];
    }
    if let Some(i) = tbl.find(feat_key(3, label, prev_c, cur_c)) {
        s += feat_w[i];
    }
    if let Some(i) = tbl.find(feat_key(4, label, cur_c, next_c)) {
        s += feat_w[i];
    }
    s
}

/// 1位置の素性勾配に`coeff`を加算します（[`emit_score_one`]と対応）。
fn add_feat_grad(
    tbl: &FeatureTable,
    grad_feat: &mut [f64],
    coeff: f64,
    label: u8,
    prev_c: u8,
    cur_c: u8,
    next_c: u8,
) {
    if let Some(i) = tbl.find(feat_key(0, label, cur_c, 0)) {
        grad_feat[i] += coeff;
    }
    if let Some(i) = tbl.find(feat_key(1, label, prev_c, 0)) {
        grad_feat[i] += coeff;
    }
    if let Some(i) = tbl.find(feat_key(2, label, next_c, 0)) {
        grad_feat[i] += coeff;
    }
    if let Some(i) = tbl.find(feat_key(3, label, prev_c, cur_c)) {
        grad_feat[i] += coeff;
    }
    if let Some(i) = tbl.find(feat_key(4, label, cur_c, next_c)) {
        grad_feat[i] += coeff;
    }
}

/// データセット全体の対数尤度と勾配（最大化方向、L2なし）を計算します。
///
/// パラメータベクトル`x`のレイアウトは`[feat_w..., t00, t01, t10, t11]`。
/// 勾配は`grad`に加算されるため、呼び出し側でクリアしてください。
fn accumulate_obj_grad(
    ds: &CrfDataset,
    tbl: &FeatureTable,
    x: &[f64],
    grad: &mut [f64],
    scratch: &mut Scratch,
) -> f64 {
    let nfeat = tbl.len();
    let feat_w = &x[..nfeat];
    let t00 = x[nfeat];
    let t01 = x[nfeat + 1];
    let t10 = x[nfeat + 2];
    let t11 = x[nfeat + 3];

    let mut total_ll = 0.0;

    for sent in &ds.sentences {
        let n = sent.cls.len().min(scratch.e0.len());
        if n == 0 {
            continue;
        }

        // 放射スコア
        for i in 0..n {
            let prev_c = if i == 0 { CC_BOS } else { sent.cls[i - 1] };
            let cur_c = sent.cls[i];
            let next_c = if i + 1 == n { CC_EOS } else { sent.cls[i + 1] };
            scratch.e0[i] = emit_score_one(tbl, feat_w, 0, prev_c, cur_c, next_c);
            scratch.e1[i] = emit_score_one(tbl, feat_w, 1, prev_c, cur_c, next_c);
        }

        // 前向き（対数領域）。y0はラベル1固定で、bos_to1は定数なので省略
        scratch.a0[0] = f64::NEG_INFINITY;
        scratch.a1[0] = scratch.e1[0];
        for i in 1..n {
            scratch.a0[i] = scratch.e0[i]
                + log_sum_exp(scratch.a0[i - 1] + t00, scratch.a1[i - 1] + t01);
            scratch.a1[i] = scratch.e1[i]
                + log_sum_exp(scratch.a0[i - 1] + t10, scratch.a1[i - 1] + t11);
        }
        // EOSラベルは1固定
        let log_z = log_sum_exp(scratch.a0[n - 1] + t10, scratch.a1[n - 1] + t11);

        // 後ろ向き
        scratch.b0[n - 1] = t10;
        scratch.b1[n - 1] = t11;
        for i in (0..n.saturating_sub(1)).rev() {
            scratch.b0[i] = log_sum_exp(
                t00 + scratch.e0[i + 1] + scratch.b0[i + 1],
                t10 + scratch.e1[i + 1] + scratch.b1[i + 1],
            );
            scratch.b1[i] = log_sum_exp(
                t01 + scratch.e0[i + 1] + scratch.b0[i + 1],
                t11 + scratch.e1[i + 1] + scratch.b1[i + 1],
            );
        }

        // 経験スコア
        let mut st = scratch.e1[0];
        for i in 1..n {
            let yp = sent.y[i - 1];
            let yc = sent.y[i];
            st += match (yp, yc) {
                (0, 0) => t00,
                (0, 1) => t10,
                (1, 0) => t01,
                _ => t11,
            };
            st += if yc == 1 { scratch.e1[i] } else { scratch.e0[i] };
        }
        st += if sent.y[n - 1] == 0 { t10 } else { t11 };

        total_ll += st - log_z;

        // 期待遷移カウント
        let mut exp_t00 = 0.0;
        let mut exp_t01 = 0.0;
        let mut exp_t10 = 0.0;
        let mut exp_t11 = 0.0;
        for i in 1..n {
            let p00 = (scratch.a0[i - 1] + t00 + scratch.e0[i] + scratch.b0[i] - log_z).exp();
            let p01 = (scratch.a0[i - 1] + t10 + scratch.e1[i] + scratch.b1[i] - log_z).exp();
            let p10 = (scratch.a1[i - 1] + t01 + scratch.e0[i] + scratch.b0[i] - log_z).exp();
            let p11 = (scratch.a1[i - 1] + t11 + scratch.e1[i] + scratch.b1[i] - log_z).exp();
            exp_t00 += p00;
            exp_t10 += p01;
            exp_t01 += p10;
            exp_t11 += p11;
        }
        exp_t10 += (scratch.a0[n - 1] + t10 - log_z).exp();
        exp_t11 += (scratch.a1[n - 1] + t11 - log_z).exp();

        // 経験遷移カウント
        let mut emp_t00 = 0.0;
        let mut emp_t01 = 0.0;
        let mut emp_t10 = 0.0;
        let mut emp_t11 = 0.0;
        for i in 1..n {
            match (sent.y[i - 1], sent.y[i]) {
                (0, 0) => emp_t00 += 1.0,
                (0, 1) => emp_t10 += 1.0,
                (1, 0) => emp_t01 += 1.0,
                _ => emp_t11 += 1.0,
            }
        }
        if sent.y[n - 1] == 0 {
            emp_t10 += 1.0;
        } else {
            emp_t11 += 1.0;
        }

        grad[nfeat] += emp_t00 - exp_t00;
        grad[nfeat + 1] += emp_t01 - exp_t01;
        grad[nfeat + 2] += emp_t10 - exp_t10;
        grad[nfeat + 3] += emp_t11 - exp_t11;

        // 素性勾配: 経験 - 期待
        for i in 0..n {
            let prev_c = if i == 0 { CC_BOS } else { sent.cls[i - 1] };
            let cur_c = sent.cls[i];
            let next_c = if i + 1 == n { CC_EOS } else { sent.cls[i + 1] };

            add_feat_grad(tbl, grad, 1.0, sent.y[i], prev_c, cur_c, next_c);

            let p0 = (scratch.a0[i] + scratch.b0[i] - log_z).exp();
            let p1 = (scratch.a1[i] + scratch.b1[i] - log_z).exp();
            add_feat_grad(tbl, grad, -p0, 0, prev_c, cur_c, next_c);
            add_feat_grad(tbl, grad, -p1, 1, prev_c, cur_c, next_c);
        }
    }

    total_ll
}

fn max_sentence_len(ds: &CrfDataset) -> usize {
    ds.sentences.iter().map(|s| s.cls.len()).max().unwrap_or(0)
}

/// 各位置の境界確率 `p(y_i = 1)` を計算します。
///
/// 前向き-後ろ向きの周辺確率で、モデル診断と検証に使用します。
pub fn boundary_marginals(
    tbl: &FeatureTable,
    weights: &CrfWeights,
    cls: &[u8],
    out: &mut Vec<f64>,
) {
    out.clear();
    let n = cls.len();
    if n == 0 {
        return;
    }
    let mut scratch = Scratch::new(n);
    let t00 = weights.trans00;
    let t01 = weights.trans01;
    let t10 = weights.trans10;
    let t11 = weights.trans11;

    for i in 0..n {
        let prev_c = if i == 0 { CC_BOS } else { cls[i - 1] };
        let cur_c = cls[i];
        let next_c = if i + 1 == n { CC_EOS } else { cls[i + 1] };
        scratch.e0[i] = emit_score_one(tbl, &weights.feat_w, 0, prev_c, cur_c, next_c);
        scratch.e1[i] = emit_score_one(tbl, &weights.feat_w, 1, prev_c, cur_c, next_c);
    }

    scratch.a0[0] = f64::NEG_INFINITY;
    scratch.a1[0] = scratch.e1[0];
    for i in 1..n {
        scratch.a0[i] =
            scratch.e0[i] + log_sum_exp(scratch.a0[i - 1] + t00, scratch.a1[i - 1] + t01);
        scratch.a1[i] =
            scratch.e1[i] + log_sum_exp(scratch.a0[i - 1] + t10, scratch.a1[i - 1] + t11);
    }
    let log_z = log_sum_exp(scratch.a0[n - 1] + t10, scratch.a1[n - 1] + t11);

    scratch.b0[n - 1] = t10;
    scratch.b1[n - 1] = t11;
    for i in (0..n.saturating_sub(1)).rev() {
        scratch.b0[i] = log_sum_exp(
            t00 + scratch.e0[i + 1] + scratch.b0[i + 1],
            t10 + scratch.e1[i + 1] + scratch.b1[i + 1],
        );
        scratch.b1[i] = log_sum_exp(
            t01 + scratch.e0[i + 1] + scratch.b0[i + 1],
            t11 + scratch.e1[i + 1] + scratch.b1[i + 1],
        );
    }

    for i in 0..n {
        out.push((scratch.a1[i] + scratch.b1[i] - log_z).exp());
    }
}

/// SGD（エポック毎のバッチ更新）でCRF重みを学習します。
///
/// エポック毎に全文の勾配を蓄積し、総位置数で割ったステップ
/// （`lr / total_pos`）で重みと遷移を更新します。
pub fn train_sgd(
    ds: &CrfDataset,
    tbl: &FeatureTable,
    weights: &mut CrfWeights,
    epochs: usize,
    lr: f64,
    l2: f64,
) -> Result<()> {
    if ds.sentences.is_empty() {
        return Err(MomijiError::invalid_argument("dataset", "no sentences"));
    }
    if weights.feat_w.len() != tbl.len() {
        return Err(MomijiError::invalid_argument(
            "weights",
            "feature weight length mismatch",
        ));
    }
    let epochs = epochs.max(1);
    let lr = if lr > 0.0 { lr } else { 0.05 };
    let l2 = l2.max(0.0);

    let nfeat = tbl.len();
    let dim = nfeat + 4;
    let mut x = vec![0.0; dim];
    x[..nfeat].copy_from_slice(&weights.feat_w);
    x[nfeat] = weights.trans00;
    x[nfeat + 1] = weights.trans01;
    x[nfeat + 2] = weights.trans10;
    x[nfeat + 3] = weights.trans11;

    let mut grad = vec![0.0; dim];
    let mut scratch = Scratch::new(max_sentence_len(ds));

    for ep in 0..epochs {
        grad.fill(0.0);
        let total_ll = accumulate_obj_grad(ds, tbl, &x, &mut grad, &mut scratch);

        if l2 > 0.0 {
            for (g, w) in grad.iter_mut().zip(&x) {
                *g -= l2 * w;
            }
        }

        let scale = if ds.total_pos > 0 {
            1.0 / ds.total_pos as f64
        } else {
            1.0
        };
        let step = lr * scale;
        for (w, g) in x.iter_mut().zip(&grad) {
            *w += step * g;
        }

        info!(
            "crf sgd ep={}/{} ll={:.3} (trans00={:.3} trans01={:.3} trans10={:.3} trans11={:.3})",
            ep + 1,
            epochs,
            total_ll,
            x[nfeat],
            x[nfeat + 1],
            x[nfeat + 2],
            x[nfeat + 3]
        );
    }

    weights.feat_w.copy_from_slice(&x[..nfeat]);
    weights.trans00 = x[nfeat];
    weights.trans01 = x[nfeat + 1];
    weights.trans10 = x[nfeat + 2];
    weights.trans11 = x[nfeat + 3];
    Ok(())
}

/// L-BFGSでCRF重みを学習します。
///
/// `f = -(ll - ½λ‖w‖²) / total_pos` を最小化します。
pub fn train_lbfgs(
    ds: &CrfDataset,
    tbl: &FeatureTable,
    weights: &mut CrfWeights,
    max_iter: usize,
    l2: f64,
    m_hist: usize,
    tol: f64,
) -> Result<()> {
    if ds.sentences.is_empty() {
        return Err(MomijiError::invalid_argument("dataset", "no sentences"));
    }
    if weights.feat_w.len() != tbl.len() {
        return Err(MomijiError::invalid_argument(
            "weights",
            "feature weight length mismatch",
        ));
    }
    let max_n = max_sentence_len(ds);
    if max_n == 0 {
        return Err(MomijiError::invalid_argument("dataset", "empty sentences"));
    }
    let l2 = l2.max(0.0);

    let nfeat = tbl.len();
    let dim = nfeat + 4;
    let mut x = vec![0.0; dim];
    x[..nfeat].copy_from_slice(&weights.feat_w);
    x[nfeat] = weights.trans00;
    x[nfeat + 1] = weights.trans01;
    x[nfeat + 2] = weights.trans10;
    x[nfeat + 3] = weights.trans11;

    let mut scratch = Scratch::new(max_n);
    let scale = if ds.total_pos > 0 {
        1.0 / ds.total_pos as f64
    } else {
        1.0
    };

    info!(
        "crf lbfgs: iter={} m={} tol={:.2e} l2={:.2e}",
        max_iter, m_hist, tol, l2
    );

    lbfgs::minimize(&mut x, max_iter, m_hist, tol, 20, |x, g| {
        g.fill(0.0);
        let total_ll = accumulate_obj_grad(ds, tbl, x, g, &mut scratch);

        // L2（最大化目的 J = ll - ½λ‖w‖² 上で）
        let mut w2 = 0.0;
        for &w in x.iter() {
            w2 += w * w;
        }
        if l2 > 0.0 {
            for (gj, wj) in g.iter_mut().zip(x.iter()) {
                *gj -= l2 * wj;
            }
        }
        let pen = 0.5 * l2 * w2;

        // 最小化問題へ変換: f = -J / total_pos
        let f = -(total_ll - pen) * scale;
        for gj in g.iter_mut() {
            *gj = -*gj * scale;
        }
        f
    })?;

    weights.feat_w.copy_from_slice(&x[..nfeat]);
    weights.trans00 = x[nfeat];
    weights.trans01 = x[nfeat + 1];
    weights.trans10 = x[nfeat + 2];
    weights.trans11 = x[nfeat + 3];

    info!(
        "crf lbfgs done: trans00={:.4} trans01={:.4} trans10={:.4} trans11={:.4}",
        weights.trans00, weights.trans01, weights.trans10, weights.trans11
    );
    Ok(())
}

/// データセットが空に近い場合の警告付きチェック
pub fn warn_if_small(ds: &CrfDataset) {
    if ds.sentences.len() < 10 {
        warn!(
            "crf training dataset is very small ({} sentences); weights may overfit",
            ds.sentences.len()
        );
    }
}
