//! テスト用のモデル構築ヘルパー

use crate::charclass::CharClassifier;
use crate::model::{CrfParams, LangModel, Model};
use crate::num::q88_from_f64;
use crate::trie::Trie;

/// ピースと対数確率のリストから最小構成のモデルを組み立てます。
///
/// CRFの重みはすべてゼロなので、スコアは純粋にLM項
/// （`lambda0 = 1.0`）で決まります。
pub(crate) fn toy_model(pieces: &[(&str, f64)], max_word_len: u16) -> Model {
    let mut trie = Trie::new();
    let mut logp_uni = vec![];
    for (i, &(s, lp)) in pieces.iter().enumerate() {
        trie.set_term_value(s.as_bytes(), i as u32).unwrap();
        logp_uni.push(q88_from_f64(lp));
    }
    Model {
        crf: CrfParams::default(),
        lm: LangModel {
            da_base: trie.base().to_vec(),
            da_check: trie.check().to_vec(),
            logp_uni,
            bigram_key: vec![],
            logp_bi: vec![],
            unk_base: q88_from_f64(-12.0),
            unk_per_cp: q88_from_f64(-2.0),
        },
        lambda0: q88_from_f64(1.0),
        max_word_len,
        flags: 0,
        cc: CharClassifier::compat(),
    }
}
