//! 推論用の統合モデル（CRF + 辞書言語モデル）
//!
//! このモジュールは、エクスポート後の凍結済みモデルを定義します。
//! モデルは不変であり、不変参照でスレッド間共有できます。
//! 統合スコアは `crf_score + lambda0 * lm_score` で計算されます。

pub mod io;

use crate::charclass::CharClassifier;
use crate::common::{PieceId, PIECE_ID_BOS, PIECE_ID_NONE};
use crate::num::sat_i16;
use crate::trie::TrieView;

/// lossless空白変換が有効
pub const FLAG_LOSSLESS_WS: u32 = 1;
/// cc_mode = ASCII（注記用フラグ。権威は`cc_mode`バイト）
pub const FLAG_CC_ASCII: u32 = 1 << 8;
/// cc_mode = UTF8LEN（注記用フラグ）
pub const FLAG_CC_UTF8LEN: u32 = 1 << 9;
/// cc_mode = RANGES（注記用フラグ）
pub const FLAG_CC_RANGES: u32 = 1 << 10;
/// cc_mode = COMPAT（注記用フラグ）
pub const FLAG_CC_COMPAT: u32 = 1 << 11;

/// 放射素性キーのパック形式
///
/// 素性は`(template_id, label, v1, v2)`の4要素を32ビットキーにパックします:
/// `key = (template_id << 24) | (label << 16) | (v1 << 8) | v2`
///
/// テンプレート:
///
/// * 0: 現在位置の文字クラス
/// * 1: 前位置の文字クラス
/// * 2: 次位置の文字クラス
/// * 3: 前・現在の文字クラスペア
/// * 4: 現在・次の文字クラスペア
#[inline(always)]
pub const fn feat_key(template_id: u8, label: u8, v1: u8, v2: u8) -> u32 {
    ((template_id as u32) << 24) | ((label as u32) << 16) | ((v1 as u32) << 8) | (v2 as u32)
}

/// 2状態マルコフCRF（単語開始ラベリング用）
///
/// ラベル定義: `label=1`は単語開始位置、`label=0`は単語内部です。
/// 遷移重みは観測に依存しない5つのQ8.8定数、放射重みはキーでソート済みの
/// テーブルから二分探索で検索します。
#[derive(Debug, Clone, Default)]
pub struct CrfParams {
    /// 遷移重み（Q8.8）
    pub trans00: i16,
    /// 遷移重み（Q8.8）
    pub trans01: i16,
    /// 遷移重み（Q8.8）
    pub trans10: i16,
    /// 遷移重み（Q8.8）
    pub trans11: i16,
    /// BOSから最初のラベル(=1)への遷移重み（Q8.8）
    pub bos_to1: i16,

    /// 昇順ソート済み素性キー配列
    pub feat_key: Vec<u32>,
    /// 対応する重み（Q8.8）
    pub feat_w: Vec<i16>,
}

impl CrfParams {
    /// ソート済みキーテーブルから素性重みを二分探索します（未発見時0）。
    ///
    /// 推論のホットループであり、ハッシュは使いません。
    #[inline]
    pub fn lookup_weight(&self, key: u32) -> i16 {
        // feat_keyは学習後に固定されるソート済み配列
        match self.feat_key.binary_search(&key) {
            Ok(i) => self.feat_w[i],
            Err(_) => 0,
        }
    }

    /// 1位置の放射スコアを計算します。
    ///
    /// テンプレート0〜4の素性重みを合計し、`i16`範囲に飽和させます。
    ///
    /// # 引数
    ///
    /// * `label` - ラベル（0=内部, 1=開始）
    /// * `prev_c` - 前位置の文字クラス（先頭ではBOS）
    /// * `cur_c` - 現在位置の文字クラス
    /// * `next_c` - 次位置の文字クラス（末尾ではEOS）
    pub fn emit(&self, label: u8, prev_c: u8, cur_c: u8, next_c: u8) -> i16 {
        let mut sum = 0i32;
        sum += i32::from(self.lookup_weight(feat_key(0, label, cur_c, 0)));
        sum += i32::from(self.lookup_weight(feat_key(1, label, prev_c, 0)));
        sum += i32::from(self.lookup_weight(feat_key(2, label, next_c, 0)));
        sum += i32::from(self.lookup_weight(feat_key(3, label, prev_c, cur_c)));
        sum += i32::from(self.lookup_weight(feat_key(4, label, cur_c, next_c)));
        sat_i16(sum)
    }
}

/// 辞書言語モデル
///
/// UTF-8単語バイト列→単語IDのマッピング（読み取り専用ダブル配列トライ、
/// 終端ノードのBASE値に負数エンコード）、ユニグラム対数確率テーブル、
/// オプションのバイグラムテーブル、未知語ペナルティを保持します。
#[derive(Debug, Clone, Default)]
pub struct LangModel {
    /// ダブル配列のBASE
    pub da_base: Vec<i32>,
    /// ダブル配列のCHECK
    pub da_check: Vec<i32>,

    /// ユニグラム対数確率（Q8.8）、サイズ=語彙サイズ
    pub logp_uni: Vec<i16>,

    /// バイグラムキー（`(prev_id << 16) | curr_id`、ソート済み）
    pub bigram_key: Vec<u32>,
    /// バイグラム対数確率（Q8.8）
    pub logp_bi: Vec<i16>,

    /// 未知語基本ペナルティ（Q8.8）
    pub unk_base: i16,
    /// 未知語・コードポイント毎ペナルティ（Q8.8、通常負値）
    pub unk_per_cp: i16,
}

impl LangModel {
    /// 語彙サイズを返します。
    #[inline(always)]
    pub fn vocab_size(&self) -> usize {
        self.logp_uni.len()
    }

    /// 読み取り専用トライビューを取得します。
    #[inline(always)]
    pub fn trie(&self) -> TrieView<'_> {
        // 配列はロード時に検証済み
        TrieView::new(&self.da_base, &self.da_check).expect("validated at load time")
    }

    /// ユニグラム対数確率を取得します（Q8.8）。
    ///
    /// 未知語（`NONE`/`BOS`/範囲外ID）の場合は
    /// `unk_base + unk_per_cp * len_cp`を`i16`に飽和させて返します。
    #[inline]
    pub fn unigram_logp(&self, id: PieceId, len_cp: u16) -> i16 {
        if id != PIECE_ID_NONE && id != PIECE_ID_BOS && usize::from(id) < self.logp_uni.len() {
            return self.logp_uni[usize::from(id)];
        }
        let v = i32::from(self.unk_base) + i32::from(self.unk_per_cp) * i32::from(len_cp);
        sat_i16(v)
    }

    /// バイグラム対数確率を取得します（バックオフ付き、Q8.8）。
    ///
    /// キー`(prev << 16) | curr`でソート済みテーブルを二分探索し、
    /// 見つからない場合は`curr_backoff`（currのユニグラム値）を返します。
    #[inline]
    pub fn bigram_logp(&self, prev: PieceId, curr: PieceId, curr_backoff: i16) -> i16 {
        if self.bigram_key.is_empty() {
            return curr_backoff;
        }
        if prev == PIECE_ID_NONE || curr == PIECE_ID_NONE {
            return curr_backoff;
        }
        let key = (u32::from(prev) << 16) | u32::from(curr);
        match self.bigram_key.binary_search(&key) {
            Ok(i) => self.logp_bi[i],
            Err(_) => curr_backoff,
        }
    }
}

/// CRF + LM 統合モデル
///
/// 統合スコアは `crf_score + lambda0 * lm_score`。`lambda0`が大きいほど
/// 生成モデル（LM）を重視し、小さいほどCRFを重視します。
#[derive(Debug, Clone, Default)]
pub struct Model {
    /// CRFモデル
    pub crf: CrfParams,
    /// 言語モデル
    pub lm: LangModel,

    /// LM重み係数（Q8.8）
    pub lambda0: i16,
    /// 最大単語長（UTF-8コードポイント単位）
    pub max_word_len: u16,
    /// モデルフラグ（[`FLAG_LOSSLESS_WS`]など）
    pub flags: u32,
    /// 文字種分類設定
    pub cc: CharClassifier,
}

impl Model {
    /// lossless空白変換が有効なモデルかどうかを返します。
    #[inline(always)]
    pub fn lossless_ws(&self) -> bool {
        self.flags & FLAG_LOSSLESS_WS != 0
    }
}
