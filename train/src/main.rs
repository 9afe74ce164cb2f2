//! モデル学習ドライバ
//!
//! 生コーパスから分かち書きモデルを学習してバイナリ形式で保存します。
//! パイプライン:
//!
//! 1. コーパスを走査してコードポイント頻度を数え、keep-charセットを構築
//! 2. 低頻度文字をフォールバックに置換したサンプルから候補n-gramを抽出
//! 3. 必須の単一文字ピース + 候補でユニグラムLMを初期化し、EM+MDLで学習
//! 4. エクスポート語彙を選択し（全複数文字ピース + 確率上位の単一文字）、
//!    ダブル配列トライとQ8.8テーブルを構築
//! 5. CRF重みを決定（プリセット → 設定ファイル → 教師あり/教師なし学習）
//! 6. モデルを保存

use std::error::Error;
use std::fs::File;
use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};

use momiji::charclass::{CcMode, CharClassifier};
use momiji::model::{
    CrfParams, LangModel, Model, FLAG_CC_ASCII, FLAG_CC_COMPAT, FLAG_CC_RANGES, FLAG_CC_UTF8LEN,
    FLAG_LOSSLESS_WS,
};
use momiji::num::q88_from_f64;
use momiji::trainer::candidates::collect_top_ngrams;
use momiji::trainer::config::{apply_config_reader, basic_feature_table, basic_initial_weights};
use momiji::trainer::corpus::{build_keep_set, count_codepoint_freqs, LineCorpus};
use momiji::trainer::crf::{train_lbfgs, train_sgd, warn_if_small, CrfDataset};
use momiji::trainer::unigram::{
    em_e_step, em_m_step, prune_mdl, viterbi_tokenize, UnigramModel, UnigramWorkspace,
    PIECE_MANDATORY,
};
use momiji::trainer::{CorpusIter, UnigramTrainConfig};
use momiji::trie::Trie;
use momiji::utf8;

/// コマンドライン引数
#[derive(Parser, Debug)]
#[clap(name = "train", about = "Trains a momiji segmentation model")]
struct Args {
    /// Raw corpus file (one sentence per line).
    #[clap(long)]
    corpus: PathBuf,

    /// Output model file.
    #[clap(long)]
    out: PathBuf,

    /// Target vocabulary size.
    #[clap(long, default_value = "8000")]
    vocab: usize,

    /// Maximum piece length in codepoints.
    #[clap(long, default_value = "8")]
    max_piece_len: usize,

    /// EM iterations.
    #[clap(long, default_value = "5")]
    iters: usize,

    /// Bytes used for candidate extraction.
    #[clap(long, default_value = "20000000")]
    sample_bytes: usize,

    /// Total candidates kept.
    #[clap(long, default_value = "50000")]
    cand_total: usize,

    /// Minimum n-gram count.
    #[clap(long, default_value = "50")]
    min_count: u32,

    /// Number of single chars kept for UniLM coverage.
    #[clap(long, default_value = "6000")]
    char_vocab: usize,

    /// Fallback character for rare chars.
    #[clap(long, default_value = "?")]
    fallback_char: String,

    /// Skip lines longer than this many bytes.
    #[clap(long, default_value = "4096")]
    max_line_bytes: usize,

    /// Workspace max codepoints per sentence.
    #[clap(long, default_value = "2048")]
    max_sentence_cp: usize,

    /// Precheck coverage on the first N sentences (0 = disable).
    #[clap(long, default_value = "5000")]
    precheck_lines: usize,

    /// Keep top-N single-char pieces in the exported dictionary.
    #[clap(long, default_value = "400")]
    keep_single_top: usize,

    /// Unknown base penalty (ln).
    #[clap(long, default_value = "-5.0", allow_hyphen_values = true)]
    unk_base: f64,

    /// Unknown per-codepoint penalty (ln).
    #[clap(long, default_value = "-1.0", allow_hyphen_values = true)]
    unk_per_cp: f64,

    /// LM weight for joint decoding.
    #[clap(long, default_value = "1.0")]
    lambda0: f64,

    /// MDL lambda0 (constant model cost, nat).
    #[clap(long, default_value = "0.0")]
    mdl_lambda0: f64,

    /// MDL lambda per codepoint (nat).
    #[clap(long, default_value = "0.15")]
    mdl_lambda_len: f64,

    /// Override CRF weights from a config file.
    #[clap(long)]
    crf_config: Option<PathBuf>,

    /// Train CRF weights from a segmented corpus (space-separated tokens).
    #[clap(long)]
    crf_supervised: Option<PathBuf>,

    /// Supervised CRF epochs/iterations.
    #[clap(long, default_value = "20")]
    crf_epochs: usize,

    /// Supervised optimizer: sgd or lbfgs.
    #[clap(long, default_value = "lbfgs")]
    crf_opt: String,

    /// Supervised CRF learning rate (SGD only).
    #[clap(long, default_value = "0.05")]
    crf_lr: f64,

    /// Supervised CRF L2 regularization.
    #[clap(long, default_value = "1e-4")]
    crf_l2: f64,

    /// L-BFGS history size.
    #[clap(long, default_value = "8")]
    crf_lbfgs_m: usize,

    /// L-BFGS gradient-norm tolerance.
    #[clap(long, default_value = "1e-4")]
    crf_tol: f64,

    /// Enable CRF unsupervised training (pseudo-labels from LM Viterbi).
    #[clap(long)]
    crf_unsupervised: bool,

    /// Number of sentences for pseudo-labels.
    #[clap(long, default_value = "1000")]
    crf_unsup_sentences: usize,

    /// Enable lossless whitespace encoding.
    #[clap(long)]
    lossless_ws: bool,

    /// Append a meta-LF to each line for line-based roundtrip.
    #[clap(long)]
    lossless_eol: bool,

    /// Character class mode: compat|ascii|utf8len|ranges.
    #[clap(long, default_value = "compat")]
    cc_mode: String,

    /// Ranges file for `--cc-mode ranges` (format: start end class_id per line).
    #[clap(long)]
    cc_ranges: Option<PathBuf>,

    /// Fallback mode for ranges: ascii|utf8len.
    #[clap(long, default_value = "utf8len")]
    cc_fallback: String,
}

fn parse_cc_mode(s: &str) -> Result<CcMode, String> {
    match s {
        "compat" => Ok(CcMode::Compat),
        "ascii" => Ok(CcMode::Ascii),
        "utf8len" => Ok(CcMode::Utf8Len),
        "ranges" => Ok(CcMode::Ranges),
        _ => Err(format!(
            "unknown cc_mode: {s} (expected: compat|ascii|utf8len|ranges)"
        )),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();

    let fallback_cp = args
        .fallback_char
        .chars()
        .next()
        .map_or(u32::from(b'?'), u32::from);

    // 文字クラス設定を先に確定させる（CRFデータセット構築と共有）
    let cc_fallback = match args.cc_fallback.as_str() {
        "ascii" => CcMode::Ascii,
        "utf8len" => CcMode::Utf8Len,
        other => {
            return Err(format!("unknown cc_fallback: {other} (expected: ascii|utf8len)").into())
        }
    };
    let cc_mode = parse_cc_mode(&args.cc_mode)?;
    let cc = match cc_mode {
        CcMode::Ranges => {
            let path = args
                .cc_ranges
                .as_ref()
                .ok_or("--cc-mode ranges requires --cc-ranges FILE")?;
            let cls = CharClassifier::from_ranges_reader(File::open(path)?, cc_fallback)?;
            info!("cc_ranges: loaded {} ranges", cls.ranges.len());
            cls
        }
        mode => CharClassifier {
            mode,
            fallback: cc_fallback,
            ranges: vec![],
        },
    };

    info!("corpus={}", args.corpus.display());
    info!(
        "target_vocab={} max_piece_len_cp={} iters={}",
        args.vocab, args.max_piece_len, args.iters
    );
    info!(
        "limits: max_line_bytes={} max_sentence_cp={}",
        args.max_line_bytes, args.max_sentence_cp
    );
    if args.lossless_ws || args.lossless_eol {
        info!(
            "lossless_ws={} lossless_eol={}",
            args.lossless_ws, args.lossless_eol
        );
    }

    // --- パス1: コードポイント頻度（カバレッジ文字集合のため） ---
    let mut corpus = LineCorpus::new(File::open(&args.corpus)?)
        .max_line_bytes(args.max_line_bytes)
        .max_sentence_cp(args.max_sentence_cp, true)
        .append_eol(args.lossless_eol);

    let freqs = count_codepoint_freqs(&mut corpus, fallback_cp)?;
    info!("scanned corpus: unique codepoints={}", freqs.len());

    // mandatoryな単一文字がtarget_vocabを食い尽くさないように調整
    let mut char_vocab = args.char_vocab;
    if args.vocab > 0 && char_vocab >= args.vocab {
        char_vocab = if args.vocab >= 512 {
            args.vocab / 2
        } else {
            args.vocab - 1
        };
    }
    char_vocab = char_vocab.max(256);

    let keep_chars = build_keep_set(&freqs, char_vocab, fallback_cp);
    info!(
        "keep_chars={} (char_vocab={}, fallback=U+{:04X})",
        keep_chars.len(),
        char_vocab,
        fallback_cp
    );

    // 以後のパスではマッピングを有効化
    corpus.set_keep_chars(keep_chars.clone(), fallback_cp);

    // --- 候補抽出（マッピング済みサンプル） ---
    corpus.reset()?;
    let mut sample = Vec::with_capacity(args.sample_bytes.min(1 << 26) + 1024);
    while sample.len() < args.sample_bytes {
        match corpus.next_sentence()? {
            Some(s) => {
                sample.extend_from_slice(s);
                sample.push(b'\n');
            }
            None => break,
        }
    }
    info!("candidate sample bytes={} (mapped)", sample.len());

    let mut fb_enc = [0u8; 4];
    let fb_len = utf8::encode_cp(fallback_cp, &mut fb_enc);
    let cands = collect_top_ngrams(
        &sample,
        args.max_piece_len,
        args.cand_total,
        args.min_count,
        &fb_enc[..fb_len],
    );
    info!("candidates={}", cands.len());
    drop(sample);

    // --- ユニグラムモデル初期化 ---
    let mut um = UnigramModel::new();

    // 必須の単一コードポイントを追加（決定性のためソート順で）
    let mut singles: Vec<u32> = keep_chars.iter().copied().collect();
    singles.sort_unstable();
    let mut enc = [0u8; 4];
    for cp in singles {
        let n = utf8::encode_cp(cp, &mut enc);
        um.add_piece(&enc[..n], PIECE_MANDATORY)?;
    }
    info!("mandatory singles added={}", um.vocab_size());

    let n_singles = um.vocab_size();
    for cand in &cands {
        um.add_piece(&cand.bytes, 0)?;
    }
    info!(
        "candidates added={} (requested={})",
        um.vocab_size() - n_singles,
        cands.len()
    );
    drop(cands);

    // 挿入順依存の再配置を避けるため、語彙を辞書順でトライに積み直す
    um.rebuild_trie_sorted()?;

    // --- UniLM学習（EM + MDL） ---
    let cfg = UnigramTrainConfig {
        num_iters: args.iters,
        max_piece_len_cp: args.max_piece_len,
        smoothing: 0.1,
        mdl_lambda0: args.mdl_lambda0,
        mdl_lambda_len: args.mdl_lambda_len,
        target_vocab_size: args.vocab,
        prune_each_iter: true,
        min_prob: 1e-12,
    };
    let mut wk = UnigramWorkspace::new(args.max_sentence_cp);

    // logpを一様に初期化
    let uniform = -((um.vocab_size() as f64).ln());
    for id in 0..um.vocab_size() as u32 {
        um.set_logp(id, uniform);
    }
    um.normalize(cfg.min_prob)?;

    // 事前にカバレッジ（NoCover）を軽くチェックし、落ちる場合は原因を表示
    if args.precheck_lines > 0 {
        info!("precheck coverage (first {} sentences)", args.precheck_lines);
        corpus.reset()?;
        let mut ids = vec![];
        let mut n_sent = 0usize;
        loop {
            let sent = match corpus.next_sentence()? {
                Some(s) => s.to_vec(),
                None => break,
            };
            n_sent += 1;
            if n_sent > args.precheck_lines {
                break;
            }
            if let Err(e) =
                viterbi_tokenize(&um, &sent, args.max_piece_len, &mut wk, &mut ids)
            {
                let preview = String::from_utf8_lossy(&sent[..sent.len().min(400)]).into_owned();
                return Err(format!(
                    "precheck failed at sentence {n_sent}: {e}\npreview: {preview}"
                )
                .into());
            }
        }
    }

    info!("EM+MDL start (vocab={})", um.vocab_size());
    let mut counts = vec![0.0; um.vocab_size()];
    for iter in 0..cfg.num_iters.max(1) {
        corpus.reset_stats();
        counts.resize(um.vocab_size(), 0.0);
        let stats = em_e_step(&um, &mut corpus, &cfg, &mut wk, &mut counts)?;
        em_m_step(&mut um, &cfg, &counts)?;
        let new_v = prune_mdl(&mut um, &cfg, &counts)?;
        info!(
            "iter {}: loglik={:.3} n_sent={} n_tok_exp={:.1} vocab={} (skipped_bytes={} skipped_cp={})",
            iter + 1,
            stats.loglik,
            stats.n_sent,
            stats.n_tokens_exp,
            new_v,
            corpus.stats.skipped_long_bytes,
            corpus.stats.skipped_long_cp
        );
    }
    info!("UniLM done. vocab={}", um.vocab_size());

    // --- エクスポート語彙の選択 ---
    // 複数文字ピースは全保持、単一文字は確率上位keep_single_topのみ
    let v = um.vocab_size();
    let mut keep = vec![false; v];
    let mut single_probs: Vec<(u32, f64)> = vec![];
    let mut multi_keep = 0usize;
    for id in 0..v as u32 {
        if um.piece(id).len_cp >= 2 {
            keep[id as usize] = true;
            multi_keep += 1;
        } else {
            single_probs.push((id, um.logp(id).exp()));
        }
    }
    single_probs.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let mut keep_singles = 0usize;
    for &(id, _) in single_probs.iter().take(args.keep_single_top) {
        keep[id as usize] = true;
        keep_singles += 1;
    }
    info!(
        "export keep: multi={} singles_top={} -> total_keep={}",
        multi_keep,
        keep_singles,
        multi_keep + keep_singles
    );

    // 新IDへの写像とエクスポート用トライ/テーブルの構築
    let export_vocab = keep.iter().filter(|&&k| k).count();
    if export_vocab > 0xFFFE {
        return Err(format!("export vocab too large ({export_vocab} > 65534)").into());
    }

    let mut trie = Trie::with_capacity(1024);
    let mut logp_uni = vec![0i16; export_vocab];
    let mut new_id = 0u32;
    for id in 0..v as u32 {
        if !keep[id as usize] {
            continue;
        }
        trie.set_term_value(um.piece_bytes(id), new_id)?;
        logp_uni[new_id as usize] = q88_from_f64(um.logp(id));
        new_id += 1;
    }

    // --- CRF重み（プリセット → 設定ファイル → 教師あり/教師なし） ---
    let tbl = basic_feature_table();
    let mut weights = basic_initial_weights(&tbl);

    if let Some(path) = &args.crf_config {
        info!("crf config: {}", path.display());
        apply_config_reader(File::open(path)?, &tbl, &mut weights)?;
    }

    if let Some(path) = &args.crf_supervised {
        info!("crf supervised: {}", path.display());
        let ds = CrfDataset::from_segmented_reader(
            File::open(path)?,
            &cc,
            args.max_line_bytes,
            args.max_sentence_cp,
        )?;
        if ds.sentences.is_empty() {
            warn!("crf supervised: no usable sentences");
        } else {
            info!(
                "crf supervised: sentences={} total_pos={}",
                ds.sentences.len(),
                ds.total_pos
            );
            warn_if_small(&ds);
            if args.crf_opt == "sgd" {
                train_sgd(&ds, &tbl, &mut weights, args.crf_epochs, args.crf_lr, args.crf_l2)?;
            } else {
                train_lbfgs(
                    &ds,
                    &tbl,
                    &mut weights,
                    args.crf_epochs,
                    args.crf_l2,
                    args.crf_lbfgs_m,
                    args.crf_tol,
                )?;
            }
        }
    }

    if args.crf_unsupervised {
        info!("crf unsupervised: generating pseudo-labels (LM-only Viterbi)");
        // 疑似ラベルはマッピングなしの生コーパスから作る
        let mut raw = LineCorpus::new(File::open(&args.corpus)?)
            .max_line_bytes(args.max_line_bytes)
            .max_sentence_cp(args.max_sentence_cp, true)
            .append_eol(args.lossless_eol);
        let ds = CrfDataset::from_lm_viterbi(
            &mut raw,
            &um,
            &mut wk,
            args.max_piece_len,
            args.crf_unsup_sentences,
            &cc,
        )?;
        if ds.sentences.is_empty() {
            warn!("crf unsupervised: no usable sentences");
        } else {
            info!(
                "crf unsupervised: sentences={} total_pos={}",
                ds.sentences.len(),
                ds.total_pos
            );
            if args.crf_opt == "sgd" {
                train_sgd(&ds, &tbl, &mut weights, args.crf_epochs, args.crf_lr, args.crf_l2)?;
            } else {
                train_lbfgs(
                    &ds,
                    &tbl,
                    &mut weights,
                    args.crf_epochs,
                    args.crf_l2,
                    args.crf_lbfgs_m,
                    args.crf_tol,
                )?;
            }
        }
    }

    // --- モデル組み立てとQ8.8量子化 ---
    let mut flags = 0u32;
    if args.lossless_ws {
        flags |= FLAG_LOSSLESS_WS;
    }
    flags |= match cc.mode {
        CcMode::Ascii => FLAG_CC_ASCII,
        CcMode::Utf8Len => FLAG_CC_UTF8LEN,
        CcMode::Ranges => FLAG_CC_RANGES,
        CcMode::Compat => FLAG_CC_COMPAT,
    };

    let model = Model {
        crf: CrfParams {
            trans00: q88_from_f64(weights.trans00),
            trans01: q88_from_f64(weights.trans01),
            trans10: q88_from_f64(weights.trans10),
            trans11: q88_from_f64(weights.trans11),
            bos_to1: q88_from_f64(weights.bos_to1),
            feat_key: tbl.keys().to_vec(),
            feat_w: weights.feat_w.iter().map(|&w| q88_from_f64(w)).collect(),
        },
        lm: LangModel {
            da_base: trie.base().to_vec(),
            da_check: trie.check().to_vec(),
            logp_uni,
            bigram_key: vec![],
            logp_bi: vec![],
            unk_base: q88_from_f64(args.unk_base),
            unk_per_cp: q88_from_f64(args.unk_per_cp),
        },
        lambda0: q88_from_f64(args.lambda0),
        max_word_len: args.max_piece_len.clamp(1, 255) as u16,
        flags,
        cc,
    };

    info!(
        "saving model: vocab={} da_cap={} feat={} -> {}",
        export_vocab,
        model.lm.da_base.len(),
        model.crf.feat_key.len(),
        args.out.display()
    );
    model.save(&args.out)?;
    info!("done");
    Ok(())
}
