//! # Momiji
//!
//! Momijiは、2状態マルコフCRFと辞書ユニグラム/バイグラム言語モデルを
//! 半マルコフラティス上で統合した、UTF-8テキストの分かち書き
//! （サブワード分割）の実装です。
//!
//! ## 概要
//!
//! デコードはコードポイント位置をノード、最大長`L`までの候補単語スパンを
//! エッジとするラティス上のビタビアルゴリズムで行います。推論時のスコアは
//! すべてQ8.8固定小数点で、浮動小数点演算に依存しません。辞書検索には
//! ダブル配列トライを使用します。
//!
//! ## 主な機能
//!
//! - **ビタビデコード**: CRF+LM統合スコアを最大化する分割の探索
//! - **FFBSサンプリング**: スコアに比例した確率分布からの分割サンプル
//!   （Subword Regularization用途、温度パラメータ対応）
//! - **N-bestデコード**: 上位N個の分割候補の列挙
//! - **可逆トークナイズ**: 空白をメタ文字に写像する全単射エンコード
//! - **学習機能**: ユニグラムLMのEM/MDL学習とCRF教師あり学習
//!   （`train`フィーチャー有効時）
//!
//! ## 使用例
//!
//! ```
//! # fn main() -> Result<(), momiji::errors::MomijiError> {
//! use momiji::model::{LangModel, Model};
//! use momiji::num::q88_from_f64;
//! use momiji::trie::Trie;
//! use momiji::Tokenizer;
//!
//! let mut trie = Trie::new();
//! for (id, piece) in ["外国", "人", "参政", "権"].iter().enumerate() {
//!     trie.set_term_value(piece.as_bytes(), id as u32)?;
//! }
//! let model = Model {
//!     lm: LangModel {
//!         da_base: trie.base().to_vec(),
//!         da_check: trie.check().to_vec(),
//!         logp_uni: vec![q88_from_f64(-2.0); 4],
//!         unk_base: q88_from_f64(-8.0),
//!         unk_per_cp: q88_from_f64(-2.0),
//!         ..Default::default()
//!     },
//!     lambda0: q88_from_f64(1.0),
//!     max_word_len: 4,
//!     ..Default::default()
//! };
//!
//! let tokenizer = Tokenizer::new(model);
//! let mut worker = tokenizer.new_worker();
//! let text = "外国人参政権";
//! worker.tokenize(text)?;
//! assert_eq!(worker.num_tokens(), 4);
//! assert_eq!(&text[worker.range_byte(0)], "外国");
//! # Ok(())
//! # }
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(not(any(target_pointer_width = "32", target_pointer_width = "64")))]
compile_error!("`target_pointer_width` must be 32 or 64");

/// 文字クラス分類
pub mod charclass;

/// 共通の型定義と定数
pub mod common;

/// 半マルコフラティスデコーダ
pub mod decoder;

/// エラー型の定義
pub mod errors;

/// 可逆トークナイズのための空白コーデック
pub mod lossless;

/// 統合モデルとバイナリI/O
pub mod model;

/// Q8.8固定小数点ユーティリティ
pub mod num;

/// トークナイザーとワーカー
pub mod tokenizer;

/// ダブル配列トライ
pub mod trie;

/// UTF-8コーデック
pub mod utf8;

/// モデル学習機能
///
/// `train`フィーチャーが有効な場合のみ利用可能です。
/// ユニグラムLMのEM/MDL最適化、2ラベルCRFの教師あり学習（SGD/L-BFGS）、
/// 接尾辞配列による候補抽出を提供します。
#[cfg(feature = "train")]
#[cfg_attr(docsrs, doc(cfg(feature = "train")))]
pub mod trainer;

#[cfg(test)]
pub(crate) mod test_utils;
#[cfg(test)]
mod tests;

// Re-exports
pub use tokenizer::{Tokenizer, Worker};

/// このライブラリのバージョン番号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
