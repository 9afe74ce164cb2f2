//! モジュール横断の結合テスト

use crate::lossless;
use crate::model::Model;
use crate::test_utils::toy_model;
use crate::Tokenizer;

#[test]
fn test_model_roundtrip_preserves_decoding() {
    let model = toy_model(
        &[("a", -1.0), ("b", -1.3), ("ab", -1.1), ("ba", -2.0)],
        4,
    );
    let mut buf = vec![];
    model.write(&mut buf).unwrap();
    let reloaded = Model::read(buf.as_slice()).unwrap();

    let t1 = Tokenizer::new(model);
    let t2 = Tokenizer::new(reloaded);
    let mut w1 = t1.new_worker();
    let mut w2 = t2.new_worker();
    for input in ["ab", "abba", "aabb", ""] {
        w1.tokenize(input).unwrap();
        w2.tokenize(input).unwrap();
        assert_eq!(w1.boundaries_cp(), w2.boundaries_cp(), "input {input:?}");
        assert_eq!(w1.score(), w2.score());
    }
}

#[test]
fn test_lossless_tokenize_detokenize_commutes() {
    // lossless有効モデルで tokenize -> join("") -> detokenize が恒等になる
    let model = toy_model(
        &[
            ("a", -1.0),
            ("b", -1.0),
            ("▁", -1.5),
            ("▃", -2.0),
            ("ab", -1.2),
        ],
        4,
    );
    let tokenizer = Tokenizer::new(model);
    let mut worker = tokenizer.new_worker();

    for text in ["ab ab", "a b", " ab", "ab \n a", "▁メタ入り ab"] {
        let mut encoded = vec![];
        lossless::encode(text.as_bytes(), true, &mut encoded);
        worker.tokenize(&encoded).unwrap();

        // トークンを区切りなしで連結してからデコード
        let mut joined = vec![];
        for i in 0..worker.num_tokens() {
            joined.extend_from_slice(&encoded[worker.range_byte(i)]);
        }
        let mut decoded = vec![];
        lossless::decode(&joined, &mut decoded);
        assert_eq!(decoded, text.as_bytes(), "text {text:?}");
    }
}

#[test]
fn test_viterbi_dominates_nbest() {
    let model = toy_model(
        &[
            ("x", -1.0),
            ("y", -1.1),
            ("xy", -1.4),
            ("yx", -1.9),
            ("xyx", -2.2),
        ],
        3,
    );
    let tokenizer = Tokenizer::new(model);
    let mut worker = tokenizer.new_worker();
    for input in ["xyxy", "xxyy", "xyxyx"] {
        worker.tokenize(input).unwrap();
        let best_score = worker.score();
        worker.tokenize_nbest(input, 8).unwrap();
        assert_eq!(worker.path_score(0), Some(best_score), "input {input:?}");
        for i in 1..worker.num_nbest_paths() {
            assert!(worker.path_score(i).unwrap() <= best_score);
        }
    }
}

#[cfg(feature = "train")]
mod train_pipeline {
    use super::*;
    use crate::charclass::CharClassifier;
    use crate::decoder::sample::XorShift32;
    use crate::model::{CrfParams, LangModel};
    use crate::num::q88_from_f64;
    use crate::trainer::unigram::{train_em_mdl, UnigramModel, UnigramWorkspace, PIECE_MANDATORY};
    use crate::trainer::{SliceCorpus, UnigramTrainConfig};
    use crate::trie::Trie;

    /// 学習済みUnigramModelから最小のエクスポートを行う
    fn export(um: &UnigramModel, max_word_len: u16) -> Model {
        let mut trie = Trie::new();
        let mut logp_uni = vec![];
        for id in 0..um.vocab_size() as u32 {
            trie.set_term_value(um.piece_bytes(id), id).unwrap();
            logp_uni.push(q88_from_f64(um.logp(id)));
        }
        Model {
            crf: CrfParams::default(),
            lm: LangModel {
                da_base: trie.base().to_vec(),
                da_check: trie.check().to_vec(),
                logp_uni,
                bigram_key: vec![],
                logp_bi: vec![],
                unk_base: q88_from_f64(-10.0),
                unk_per_cp: q88_from_f64(-2.0),
            },
            lambda0: q88_from_f64(1.0),
            max_word_len,
            flags: 0,
            cc: CharClassifier::compat(),
        }
    }

    #[test]
    fn test_train_export_decode_pipeline() {
        // 単一文字 + 頻出n-gramで学習し、エクスポートした
        // モデルが頻出ピースを1トークンに切り出すことを確認する
        let mut um = UnigramModel::new();
        for s in ["東", "京", "都", "に", "住", "む"] {
            um.add_piece(s.as_bytes(), PIECE_MANDATORY).unwrap();
        }
        for s in ["東京", "東京都", "住む"] {
            um.add_piece(s.as_bytes(), 0).unwrap();
        }
        um.rebuild_trie_sorted().unwrap();

        let sents: Vec<&[u8]> = vec![
            "東京都に住む".as_bytes(),
            "東京に住む".as_bytes(),
            "東京都".as_bytes(),
            "東京".as_bytes(),
        ];
        let mut corpus = SliceCorpus::new(&sents);
        let mut wk = UnigramWorkspace::new(64);
        let cfg = UnigramTrainConfig {
            num_iters: 4,
            max_piece_len_cp: 3,
            ..Default::default()
        };
        train_em_mdl(&mut um, &mut corpus, &cfg, &mut wk).unwrap();

        let model = export(&um, 3);
        let tokenizer = Tokenizer::new(model);
        let mut worker = tokenizer.new_worker();
        let text = "東京都に住む";
        worker.tokenize(text).unwrap();

        let tokens: Vec<&str> = (0..worker.num_tokens())
            .map(|i| &text[worker.range_byte(i)])
            .collect();
        // EM後は「東京都」「住む」がまとまり、全体は入力を再構成する
        assert_eq!(tokens.concat(), text);
        assert!(tokens.contains(&"東京都"), "tokens: {tokens:?}");
        assert!(tokens.contains(&"住む"), "tokens: {tokens:?}");
    }

    #[test]
    fn test_sampling_agrees_with_viterbi_at_low_temperature() {
        let model = toy_model(&[("a", -2.5), ("b", -2.5), ("ab", -0.4)], 4);
        let tokenizer = Tokenizer::new(model);
        let mut worker = tokenizer.new_worker();
        worker.tokenize("abab").unwrap();
        let viterbi = worker.boundaries_cp().to_vec();

        let mut rng = XorShift32::new(1234);
        for _ in 0..10 {
            worker.tokenize_sample("abab", 1e-3, &mut rng).unwrap();
            assert_eq!(worker.boundaries_cp(), viterbi.as_slice());
        }
    }
}
