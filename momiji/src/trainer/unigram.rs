//! ユニグラム言語モデルのEM/MDL学習
//!
//! 語彙ピースの集合に対し、前向き-後ろ向きアルゴリズム（E-step）と
//! 正規化（M-step）でトークナイズ確率を最適化します。枝刈りはMDL流:
//! ピースを文字フォールバックとの記述長差で採点し、スコア上位（または
//! 正スコア）のみを残します。単一コードポイントのピースはカバレッジ
//! 保証のため暗黙に必須であり、枝刈りされません。
//!
//! DP位置はUTF-8コードポイント境界で、トークンマッチングには
//! ダブル配列トライを使用します（ピースIDは終端ノードに負数格納）。

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use log::info;

use crate::errors::{MomijiError, Result};
use crate::num::log_sum_exp;
use crate::trainer::{CorpusIter, EmStats, UnigramTrainConfig};
use crate::trie::{Trie, TRIE_ROOT};
use crate::utf8;

/// 枝刈りされない必須ピースを示すフラグ
pub const PIECE_MANDATORY: u8 = 1;

/// E-stepで無視する寄与のlog重み下限
const LOG_WEIGHT_FLOOR: f64 = -80.0;

/// 語彙ピースの情報
///
/// バイト列本体は[`UnigramModel`]の共有プールに格納され、ここには
/// オフセットと長さだけを持ちます。
#[derive(Debug, Clone, Copy)]
pub struct Piece {
    /// プール内のバイトオフセット
    pub str_off: u32,
    /// バイト長
    pub len: u16,
    /// UTF-8コードポイント数
    pub len_cp: u16,
    /// フラグ（[`PIECE_MANDATORY`]など）
    pub flags: u8,
}

/// 学習中のユニグラムモデル
///
/// 可変のピースストレージとトライを所有します。学習後は
/// エクスポート処理で凍結モデルに変換されます。
pub struct UnigramModel {
    strbuf: Vec<u8>,
    pieces: Vec<Piece>,
    logp: Vec<f64>,
    trie: Trie,
}

impl Default for UnigramModel {
    fn default() -> Self {
        Self::new()
    }
}

impl UnigramModel {
    /// 空のモデルを作成します。
    pub fn new() -> Self {
        Self {
            strbuf: vec![],
            pieces: vec![],
            logp: vec![],
            trie: Trie::new(),
        }
    }

    /// 語彙サイズを返します。
    #[inline(always)]
    pub fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    /// ピース情報を返します。
    #[inline(always)]
    pub fn piece(&self, id: u32) -> &Piece {
        &self.pieces[id as usize]
    }

    /// ピースのバイト列を返します。
    #[inline]
    pub fn piece_bytes(&self, id: u32) -> &[u8] {
        let p = &self.pieces[id as usize];
        &self.strbuf[p.str_off as usize..p.str_off as usize + usize::from(p.len)]
    }

    /// ピースの対数確率を返します。
    #[inline(always)]
    pub fn logp(&self, id: u32) -> f64 {
        self.logp[id as usize]
    }

    /// ピースの対数確率を設定します。
    pub fn set_logp(&mut self, id: u32, logp: f64) {
        self.logp[id as usize] = logp;
    }

    /// 既存ピースのIDを検索します。
    pub fn find_id(&self, bytes: &[u8]) -> Option<u32> {
        self.trie.get_term_value(bytes)
    }

    /// ピースを追加し、IDを返します。
    ///
    /// 既に存在する場合はフラグをORして既存IDを返します（冪等）。
    pub fn add_piece(&mut self, bytes: &[u8], flags: u8) -> Result<u32> {
        if bytes.is_empty() {
            return Err(MomijiError::invalid_argument("bytes", "empty piece"));
        }
        if let Some(id) = self.find_id(bytes) {
            self.pieces[id as usize].flags |= flags;
            return Ok(id);
        }

        let id = self.pieces.len() as u32;
        let str_off = self.strbuf.len() as u32;
        if bytes.len() > usize::from(u16::MAX) {
            return Err(MomijiError::invalid_argument("bytes", "piece too long"));
        }
        self.strbuf.extend_from_slice(bytes);
        self.pieces.push(Piece {
            str_off,
            len: bytes.len() as u16,
            len_cp: utf8::count_codepoints(bytes) as u16,
            flags,
        });
        // 初期logpは0。呼び出し側で正規化またはEMを実行する
        self.logp.push(0.0);

        self.trie.set_term_value(bytes, id)?;
        Ok(id)
    }

    /// 確率を正規化します。
    ///
    /// 正規化→フロア適用→再正規化の2パスで、合計1とフロアの両方を
    /// 可能な範囲で保ちます。
    pub fn normalize(&mut self, min_prob: f64) -> Result<()> {
        if self.pieces.is_empty() {
            return Err(MomijiError::invalid_argument("model", "empty vocabulary"));
        }
        let min_prob = if min_prob > 0.0 { min_prob } else { 1e-12 };

        for _pass in 0..2 {
            let mut sum = 0.0;
            for &lp in &self.logp {
                let p = lp.exp();
                if p > 0.0 {
                    sum += p;
                }
            }
            if !(sum > 0.0) {
                return Err(MomijiError::invalid_state(
                    "probability mass vanished during normalization",
                ));
            }
            let inv = 1.0 / sum;
            for lp in self.logp.iter_mut() {
                let mut p = lp.exp() * inv;
                if p < min_prob {
                    p = min_prob;
                }
                *lp = p.ln();
            }
        }
        Ok(())
    }

    /// 内部トライを辞書順挿入で再構築します。
    ///
    /// 語彙の追加・削除・並び替えの後に呼び出します。ピースのバイト列の
    /// 辞書順（同値はID順）で挿入することで、比較的コンパクトなbase配列に
    /// なりやすく、挿入順依存の再配置も安定します。
    pub fn rebuild_trie_sorted(&mut self) -> Result<()> {
        self.trie.clear();
        if self.pieces.is_empty() {
            return Ok(());
        }

        let mut ids: Vec<u32> = (0..self.pieces.len() as u32).collect();
        // 比較はこのモデルのプールを明示的に参照する（プロセス共有状態なし）
        ids.sort_by(|&a, &b| {
            self.piece_bytes(a)
                .cmp(self.piece_bytes(b))
                .then_with(|| a.cmp(&b))
        });

        // sort_byはstrbufへの共有参照のみ使うため、その後の挿入と衝突しない
        for idx in 0..ids.len() {
            let id = ids[idx];
            let p = self.pieces[id as usize];
            let range = p.str_off as usize..p.str_off as usize + usize::from(p.len);
            // トライ挿入はstrbufを変更しないが、借用を切るため一時コピー
            let bytes: Vec<u8> = self.strbuf[range].to_vec();
            self.trie.set_term_value(&bytes, id)?;
        }
        Ok(())
    }

    /// コードポイント位置`i`から始まるすべての一致ピースを列挙します。
    ///
    /// `f(end_pos, piece_id)`が一致毎に呼ばれます。`end_pos`は一致終端の
    /// コードポイント位置です。
    fn for_each_match<F>(&self, sent: &[u8], cp_off: &[u32], i: usize, max_len_cp: usize, mut f: F)
    where
        F: FnMut(usize, u32),
    {
        let m = cp_off.len() - 1;
        let view = self.trie.view();
        let mut node = TRIE_ROOT;
        let kmax = if max_len_cp > 0 {
            (i + max_len_cp).min(m)
        } else {
            m
        };
        for k in i..kmax {
            let b0 = cp_off[k] as usize;
            let b1 = cp_off[k + 1] as usize;
            for &byte in &sent[b0..b1] {
                node = view.next(node, byte);
                if node == 0 {
                    return;
                }
            }
            if let Some(pid) = view.term_value_at(node) {
                f(k + 1, pid);
            }
        }
    }

    /// ピースの文字フォールバックコスト（`Σ -log p(文字)`）を計算します。
    ///
    /// 構成コードポイントのいずれかが語彙に無ければ`None`を返します。
    fn piece_char_cost(&self, id: u32) -> Option<f64> {
        let p = self.pieces[id as usize];
        let start = p.str_off as usize;
        let end = start + usize::from(p.len);

        let mut cost = 0.0;
        let mut pos = start;
        while pos < end {
            let next = utf8_next_lenient(&self.strbuf, end, pos);
            let cid = self.find_id(&self.strbuf[pos..next])?;
            cost += -self.logp[cid as usize];
            pos = next;
        }
        Some(cost)
    }
}

/// 次のUTF-8コードポイント境界を返します（学習側の寛容版）。
///
/// 無効な先頭バイトは1バイトとして扱い、途中で切れたシーケンスは
/// バッファ終端にクランプします。
#[inline]
fn utf8_next_lenient(s: &[u8], len: usize, pos: usize) -> usize {
    if pos >= len {
        return len;
    }
    let b = s[pos];
    let adv = if b < 0x80 {
        1
    } else if b & 0xE0 == 0xC0 {
        2
    } else if b & 0xF0 == 0xE0 {
        3
    } else if b & 0xF8 == 0xF0 {
        4
    } else {
        1
    };
    (pos + adv).min(len)
}

/// EM/ビタビ用の作業領域
///
/// DP配列は`max_codepoints + 1`要素で、文毎に再利用されます。
pub struct UnigramWorkspace {
    max_codepoints: usize,
    cp_off: Vec<u32>,
    alpha: Vec<f64>,
    beta: Vec<f64>,
    bp_prev: Vec<i32>,
    bp_piece: Vec<i32>,
}

impl UnigramWorkspace {
    /// 作業領域を確保します。
    pub fn new(max_codepoints: usize) -> Self {
        let n = max_codepoints + 1;
        Self {
            max_codepoints,
            cp_off: Vec::with_capacity(n),
            alpha: vec![0.0; n],
            beta: vec![0.0; n],
            bp_prev: vec![-1; n],
            bp_piece: vec![-1; n],
        }
    }

    /// コードポイント境界オフセットを構築します（`cp_off[0] = 0`、
    /// `cp_off[M] = len`）。
    fn build_cp_offsets(&mut self, sent: &[u8]) -> Result<usize> {
        self.cp_off.clear();
        self.cp_off.push(0);
        let mut pos = 0;
        while pos < sent.len() {
            if self.cp_off.len() > self.max_codepoints {
                return Err(MomijiError::WorkspaceTooSmall {
                    msg: "unigram cp offsets",
                    required: sent.len(),
                });
            }
            pos = utf8_next_lenient(sent, sent.len(), pos);
            self.cp_off.push(pos as u32);
        }
        Ok(self.cp_off.len() - 1)
    }
}

/// 1文の前向き-後ろ向きを実行し、期待カウントを加算します。
///
/// # 戻り値
///
/// `(logZ, 期待トークン数)`
fn forward_backward_sentence(
    model: &UnigramModel,
    sent: &[u8],
    max_piece_len_cp: usize,
    wk: &mut UnigramWorkspace,
    counts: &mut [f64],
) -> Result<(f64, f64)> {
    let m = wk.build_cp_offsets(sent)?;

    // 前向き
    wk.alpha[..=m].fill(f64::NEG_INFINITY);
    wk.alpha[0] = 0.0;
    for i in 0..m {
        let ai = wk.alpha[i];
        if ai == f64::NEG_INFINITY {
            continue;
        }
        let alpha = &mut wk.alpha;
        model.for_each_match(sent, &wk.cp_off, i, max_piece_len_cp, |end, pid| {
            let cand = ai + model.logp[pid as usize];
            alpha[end] = log_sum_exp(alpha[end], cand);
        });
    }

    let log_z = wk.alpha[m];
    if log_z == f64::NEG_INFINITY {
        return Err(nocover_error(model, sent));
    }

    // 後ろ向き
    wk.beta[..=m].fill(f64::NEG_INFINITY);
    wk.beta[m] = 0.0;
    for i in (0..m).rev() {
        let mut acc = f64::NEG_INFINITY;
        let beta = &wk.beta;
        model.for_each_match(sent, &wk.cp_off, i, max_piece_len_cp, |end, pid| {
            let cand = model.logp[pid as usize] + beta[end];
            acc = log_sum_exp(acc, cand);
        });
        wk.beta[i] = acc;
    }

    // 期待カウント。微小な寄与は数値安定のため切り捨てる
    let mut tok_exp = 0.0;
    for i in 0..m {
        let ai = wk.alpha[i];
        if ai == f64::NEG_INFINITY {
            continue;
        }
        let beta = &wk.beta;
        model.for_each_match(sent, &wk.cp_off, i, max_piece_len_cp, |end, pid| {
            let log_use = ai + model.logp[pid as usize] + beta[end] - log_z;
            if log_use > LOG_WEIGHT_FLOOR {
                let p = log_use.exp();
                counts[pid as usize] += p;
                tok_exp += p;
            }
        });
    }

    Ok((log_z, tok_exp))
}

/// NoCoverの診断メッセージを構築します。
///
/// 文中で最初に語彙に存在しない単一コードポイントのピースを探して
/// 報告します。
fn nocover_error(model: &UnigramModel, sent: &[u8]) -> MomijiError {
    let mut pos = 0;
    let mut cp_i = 0;
    while pos < sent.len() {
        let next = utf8_next_lenient(sent, sent.len(), pos);
        if model.find_id(&sent[pos..next]).is_none() {
            let cp = utf8::decode_cp(sent, pos).map_or(u32::from(sent[pos]), |(c, _)| c);
            return MomijiError::NoCover(format!(
                "sentence has no covering segmentation; first missing single-codepoint piece U+{cp:04X} at codepoint {cp_i}"
            ));
        }
        pos = next;
        cp_i += 1;
    }
    MomijiError::NoCover(
        "sentence has no covering segmentation although all single-codepoint pieces are present \
         (possible trie corruption)"
            .to_string(),
    )
}

/// E-step: コーパス全体の期待カウントと対数尤度を計算します。
///
/// `counts`は語彙サイズ以上の長さが必要で、内部でクリアされます。
pub fn em_e_step(
    model: &UnigramModel,
    corpus: &mut dyn CorpusIter,
    cfg: &UnigramTrainConfig,
    wk: &mut UnigramWorkspace,
    counts: &mut [f64],
) -> Result<EmStats> {
    if model.vocab_size() == 0 {
        return Err(MomijiError::invalid_argument("model", "empty vocabulary"));
    }
    if counts.len() < model.vocab_size() {
        return Err(MomijiError::WorkspaceTooSmall {
            msg: "expected-count buffer",
            required: model.vocab_size(),
        });
    }

    counts[..model.vocab_size()].fill(0.0);
    corpus.reset()?;

    let mut stats = EmStats::default();
    while let Some(sent) = corpus.next_sentence()? {
        if sent.is_empty() {
            continue;
        }
        let (log_z, tok) =
            forward_backward_sentence(model, sent, cfg.max_piece_len_cp, wk, counts)?;
        stats.loglik += log_z;
        stats.n_tokens_exp += tok;
        stats.n_sent += 1;
    }
    Ok(stats)
}

/// M-step: 期待カウントから対数確率を更新します。
pub fn em_m_step(
    model: &mut UnigramModel,
    cfg: &UnigramTrainConfig,
    counts: &[f64],
) -> Result<()> {
    let v = model.vocab_size();
    if v == 0 {
        return Err(MomijiError::invalid_argument("model", "empty vocabulary"));
    }
    let smooth = if cfg.smoothing >= 0.0 { cfg.smoothing } else { 0.0 };

    let mut total = 0.0;
    for &c in &counts[..v] {
        let c = (c + smooth).max(0.0);
        total += c;
    }
    if !(total > 0.0) {
        return Err(MomijiError::invalid_state("all expected counts are zero"));
    }

    let min_prob = if cfg.min_prob > 0.0 { cfg.min_prob } else { 1e-12 };
    for i in 0..v {
        let c = (counts[i] + smooth).max(0.0);
        let p = (c / total).max(min_prob);
        model.logp[i] = p.ln();
    }

    model.normalize(min_prob)
}

/// スコア付きピース（上位K選択用）
struct ScoredPiece {
    score: f64,
    id: u32,
}

impl PartialEq for ScoredPiece {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for ScoredPiece {}
impl PartialOrd for ScoredPiece {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScoredPiece {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// MDL流の枝刈りを実行します。
///
/// 非必須ピース`i`を `saved = (char_cost(i) - self_cost(i)) * count(i)` から
/// モデルコスト `lambda0 + lambda_len * len_cp` を引いた値で採点します。
///
/// * `target_vocab_size > 0`: 必須ピース + スコア上位Kを保持
/// * それ以外でMDL係数が正: スコアが正のピースのみ保持
///
/// 選択後はピースをインプレースで圧縮し（文字列プールのオフセットは
/// そのまま有効）、新しいIDで辞書順にトライを再構築して再正規化します。
///
/// # 戻り値
///
/// 枝刈り後の語彙サイズ
pub fn prune_mdl(
    model: &mut UnigramModel,
    cfg: &UnigramTrainConfig,
    counts: &[f64],
) -> Result<usize> {
    let v = model.vocab_size();
    if v == 0 {
        return Err(MomijiError::invalid_argument("model", "empty vocabulary"));
    }
    if counts.len() < v {
        return Err(MomijiError::WorkspaceTooSmall {
            msg: "expected-count buffer",
            required: v,
        });
    }

    let mut keep = vec![false; v];

    // 必須ピース: 明示フラグ、または単一コードポイント（カバレッジ保証）
    let mut mandatory = 0usize;
    for (i, p) in model.pieces.iter().enumerate() {
        if p.flags & PIECE_MANDATORY != 0 || p.len_cp <= 1 {
            keep[i] = true;
            mandatory += 1;
        }
    }

    let want_size_limit = cfg.target_vocab_size > 0;
    if !want_size_limit && !(cfg.mdl_lambda0 > 0.0 || cfg.mdl_lambda_len > 0.0) {
        // 枝刈りが要求されていない
        return Ok(v);
    }

    let k = if want_size_limit {
        cfg.target_vocab_size.saturating_sub(mandatory)
    } else {
        0
    };

    let mut heap: BinaryHeap<std::cmp::Reverse<ScoredPiece>> = BinaryHeap::with_capacity(k + 1);

    for i in 0..v {
        if keep[i] {
            continue;
        }
        let id = i as u32;
        let c = counts[i].max(0.0);

        let alt = match model.piece_char_cost(id) {
            Some(x) if x.is_finite() => x,
            _ => continue,
        };
        let self_cost = -model.logp[i];
        if !self_cost.is_finite() {
            continue;
        }

        let saved = (alt - self_cost) * c;
        let cost = cfg.mdl_lambda0 + cfg.mdl_lambda_len * f64::from(model.pieces[i].len_cp);
        let score = saved - cost;

        if !want_size_limit {
            if score > 0.0 {
                keep[i] = true;
            }
            continue;
        }

        if k == 0 {
            continue;
        }
        if heap.len() < k {
            heap.push(std::cmp::Reverse(ScoredPiece { score, id }));
        } else if let Some(min) = heap.peek() {
            if score > min.0.score {
                heap.pop();
                heap.push(std::cmp::Reverse(ScoredPiece { score, id }));
            }
        }
    }

    if want_size_limit {
        for item in heap.into_iter() {
            keep[item.0.id as usize] = true;
        }
    }

    // 語彙をインプレースで圧縮（文字列はプールに残り、オフセットは有効なまま）
    let mut new_v = 0usize;
    for i in 0..v {
        if keep[i] {
            if new_v != i {
                model.pieces[new_v] = model.pieces[i];
                model.logp[new_v] = model.logp[i];
            }
            new_v += 1;
        }
    }
    model.pieces.truncate(new_v);
    model.logp.truncate(new_v);

    // 新しいIDでトライを再構築し、確率の合計を1に戻す
    model.rebuild_trie_sorted()?;
    model.normalize(cfg.min_prob)?;
    Ok(new_v)
}

/// 完全な学習ループ（E + M + オプション枝刈り）を実行します。
///
/// すべてのlogpがゼロ（一般的な初期状態）の場合は一様分布から開始します。
pub fn train_em_mdl(
    model: &mut UnigramModel,
    corpus: &mut dyn CorpusIter,
    cfg: &UnigramTrainConfig,
    wk: &mut UnigramWorkspace,
) -> Result<EmStats> {
    if model.vocab_size() == 0 {
        return Err(MomijiError::invalid_argument("model", "empty vocabulary"));
    }

    if model.logp.iter().all(|&lp| lp == 0.0) {
        let lp = -(model.vocab_size() as f64).ln();
        model.logp.fill(lp);
    }
    model.normalize(cfg.min_prob)?;

    let iters = cfg.num_iters.max(1);
    let mut counts = vec![0.0; model.vocab_size()];
    let mut last_stats = EmStats::default();

    for iter in 0..iters {
        counts.resize(model.vocab_size(), 0.0);
        let stats = em_e_step(model, corpus, cfg, wk, &mut counts)?;
        em_m_step(model, cfg, &counts)?;

        let vocab = if cfg.prune_each_iter {
            prune_mdl(model, cfg, &counts)?
        } else {
            model.vocab_size()
        };

        info!(
            "unigram EM iter {}/{}: loglik={:.3} n_sent={} n_tokens_exp={:.1} vocab={}",
            iter + 1,
            iters,
            stats.loglik,
            stats.n_sent,
            stats.n_tokens_exp,
            vocab
        );
        last_stats = stats;
    }
    Ok(last_stats)
}

/// ビタビトークナイズ（最大確率）。ピースIDの列を返します。
///
/// CRFを含まないLM単独の分割で、疑似ラベル生成やカバレッジ検査に
/// 使用します。
pub fn viterbi_tokenize(
    model: &UnigramModel,
    sent: &[u8],
    max_piece_len_cp: usize,
    wk: &mut UnigramWorkspace,
    out_ids: &mut Vec<u32>,
) -> Result<()> {
    out_ids.clear();
    let m = wk.build_cp_offsets(sent)?;

    wk.alpha[..=m].fill(f64::NEG_INFINITY);
    for i in 0..=m {
        wk.bp_prev[i] = -1;
        wk.bp_piece[i] = -1;
    }
    wk.alpha[0] = 0.0;
    wk.bp_prev[0] = 0;

    for i in 0..m {
        let ai = wk.alpha[i];
        if ai == f64::NEG_INFINITY {
            continue;
        }
        let alpha = &mut wk.alpha;
        let bp_prev = &mut wk.bp_prev;
        let bp_piece = &mut wk.bp_piece;
        model.for_each_match(sent, &wk.cp_off, i, max_piece_len_cp, |end, pid| {
            let cand = ai + model.logp[pid as usize];
            if cand > alpha[end] {
                alpha[end] = cand;
                bp_prev[end] = i as i32;
                bp_piece[end] = pid as i32;
            }
        });
    }

    if wk.alpha[m] == f64::NEG_INFINITY || wk.bp_prev[m] < 0 {
        return Err(nocover_error(model, sent));
    }

    // バックトレース
    let mut pos = m as i32;
    while pos > 0 {
        let pid = wk.bp_piece[pos as usize];
        let prev = wk.bp_prev[pos as usize];
        if pid < 0 || prev < 0 {
            return Err(MomijiError::invalid_state("corrupted viterbi backpointer"));
        }
        out_ids.push(pid as u32);
        pos = prev;
    }
    out_ids.reverse();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::SliceCorpus;

    fn model_with(pieces: &[(&str, u8)]) -> UnigramModel {
        let mut m = UnigramModel::new();
        for &(s, flags) in pieces {
            m.add_piece(s.as_bytes(), flags).unwrap();
        }
        m
    }

    #[test]
    fn test_add_piece_idempotent() {
        let mut m = UnigramModel::new();
        let a = m.add_piece(b"abc", 0).unwrap();
        let b = m.add_piece(b"abc", PIECE_MANDATORY).unwrap();
        assert_eq!(a, b);
        assert_eq!(m.vocab_size(), 1);
        assert_eq!(m.piece(a).flags & PIECE_MANDATORY, PIECE_MANDATORY);
        assert_eq!(m.piece(a).len_cp, 3);
    }

    #[test]
    fn test_normalize_sums_to_one() {
        let mut m = model_with(&[("a", 0), ("b", 0), ("ab", 0)]);
        m.set_logp(0, (0.5f64).ln());
        m.set_logp(1, (0.3f64).ln());
        m.set_logp(2, (0.4f64).ln());
        m.normalize(1e-12).unwrap();
        let sum: f64 = (0..3).map(|i| m.logp(i).exp()).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_em_increases_loglik() {
        let mut m = model_with(&[("a", 0), ("b", 0), ("c", 0), ("ab", 0), ("abc", 0)]);
        let sents: Vec<&[u8]> = vec![b"abcab", b"ababc", b"abcabc"];
        let mut corpus = SliceCorpus::new(&sents);
        let mut wk = UnigramWorkspace::new(64);
        let cfg = UnigramTrainConfig {
            num_iters: 1,
            ..Default::default()
        };

        let lp = -(m.vocab_size() as f64).ln();
        m.logp.fill(lp);
        m.normalize(cfg.min_prob).unwrap();

        let mut counts = vec![0.0; m.vocab_size()];
        let s1 = em_e_step(&m, &mut corpus, &cfg, &mut wk, &mut counts).unwrap();
        em_m_step(&mut m, &cfg, &counts).unwrap();
        let s2 = em_e_step(&m, &mut corpus, &cfg, &mut wk, &mut counts).unwrap();
        assert!(s2.loglik >= s1.loglik - 1e-9, "{} < {}", s2.loglik, s1.loglik);
        assert_eq!(s1.n_sent, 3);
        assert!(s1.n_tokens_exp > 0.0);
    }

    #[test]
    fn test_e_step_nocover_reports_missing_single() {
        let m = model_with(&[("a", 0), ("b", 0)]);
        let sents: Vec<&[u8]> = vec![b"axb"];
        let mut corpus = SliceCorpus::new(&sents);
        let mut wk = UnigramWorkspace::new(16);
        let cfg = UnigramTrainConfig::default();
        let mut counts = vec![0.0; m.vocab_size()];
        let e = em_e_step(&m, &mut corpus, &cfg, &mut wk, &mut counts).unwrap_err();
        match e {
            MomijiError::NoCover(msg) => assert!(msg.contains("U+0078"), "msg: {msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_prune_keeps_mandatory_and_singles() {
        let mut m = model_with(&[
            ("a", 0),
            ("b", 0),
            ("ab", 0),
            ("ba", 0),
            ("aab", PIECE_MANDATORY),
        ]);
        let lp = -(m.vocab_size() as f64).ln();
        m.logp.fill(lp);
        m.normalize(1e-12).unwrap();

        // abだけ頻出、baは使われない
        let counts = vec![10.0, 10.0, 50.0, 0.0, 1.0];
        let cfg = UnigramTrainConfig {
            target_vocab_size: 4,
            ..Default::default()
        };
        let new_v = prune_mdl(&mut m, &cfg, &counts).unwrap();
        assert_eq!(new_v, 4);
        // 単一コードポイントと必須フラグ付きは必ず残る
        assert!(m.find_id(b"a").is_some());
        assert!(m.find_id(b"b").is_some());
        assert!(m.find_id(b"aab").is_some());
        assert!(m.find_id(b"ab").is_some());
        assert!(m.find_id(b"ba").is_none());
        // 確率は再正規化されている
        let sum: f64 = (0..new_v as u32).map(|i| m.logp(i).exp()).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_prune_threshold_mode() {
        let mut m = model_with(&[("a", 0), ("b", 0), ("ab", 0), ("ba", 0)]);
        let lp = -(m.vocab_size() as f64).ln();
        m.logp.fill(lp);
        m.normalize(1e-12).unwrap();

        let counts = vec![5.0, 5.0, 100.0, 0.0];
        let cfg = UnigramTrainConfig {
            target_vocab_size: 0,
            mdl_lambda0: 0.5,
            mdl_lambda_len: 0.15,
            ..Default::default()
        };
        let new_v = prune_mdl(&mut m, &cfg, &counts).unwrap();
        // 頻出のabは正スコアで残り、未使用のbaは落ちる
        assert!(m.find_id(b"ab").is_some());
        assert!(m.find_id(b"ba").is_none());
        assert_eq!(new_v, 3);
    }

    #[test]
    fn test_trie_rebuild_preserves_lookup() {
        let mut m = model_with(&[("zz", 0), ("a", 0), ("mn", 0)]);
        m.rebuild_trie_sorted().unwrap();
        assert_eq!(m.find_id(b"zz"), Some(0));
        assert_eq!(m.find_id(b"a"), Some(1));
        assert_eq!(m.find_id(b"mn"), Some(2));
    }

    #[test]
    fn test_viterbi_tokenize() {
        let mut m = model_with(&[("a", 0), ("b", 0), ("ab", 0)]);
        m.set_logp(0, (0.1f64).ln());
        m.set_logp(1, (0.1f64).ln());
        m.set_logp(2, (0.8f64).ln());

        let mut wk = UnigramWorkspace::new(16);
        let mut ids = vec![];
        viterbi_tokenize(&m, b"abab", 8, &mut wk, &mut ids).unwrap();
        assert_eq!(ids, vec![2, 2]);

        viterbi_tokenize(&m, b"aba", 8, &mut wk, &mut ids).unwrap();
        assert_eq!(ids, vec![2, 0]);
    }

    #[test]
    fn test_full_training_loop() {
        let mut m = model_with(&[("a", 0), ("b", 0), ("c", 0), ("ab", 0), ("bc", 0), ("abc", 0)]);
        let sents: Vec<&[u8]> = vec![b"abcabc", b"abc", b"ababc"];
        let mut corpus = SliceCorpus::new(&sents);
        let mut wk = UnigramWorkspace::new(64);
        let cfg = UnigramTrainConfig {
            num_iters: 3,
            target_vocab_size: 5,
            prune_each_iter: true,
            ..Default::default()
        };
        let stats = train_em_mdl(&mut m, &mut corpus, &cfg, &mut wk).unwrap();
        assert_eq!(stats.n_sent, 3);
        assert!(m.vocab_size() <= 5);
        // 単一コードポイントは全員生存
        for s in [b"a" as &[u8], b"b", b"c"] {
            assert!(m.find_id(s).is_some());
        }
    }
}
