//! デコード用作業領域
//!
//! デコード中のヒープ確保を避けるため、必要なテーブルをすべて構築時に
//! 確保しておきます。作業領域は現在のデコード呼び出しが排他的に所有し、
//! スレッド間で共有できません（呼び出し毎のDP状態を保持するため）。

use crate::common::{PieceId, MAX_SENTENCE_CODEPOINTS, PIECE_ID_NONE};
use crate::errors::{MomijiError, Result};

/// ビタビデコード用の作業領域
///
/// 内部テーブル:
///
/// * `cp_off` - コードポイント→バイトオフセット
/// * `emit0`/`emit1` - ラベル0/1の放射スコア（事前計算、Q8.8）
/// * `pref_emit0` - emit0の累積和（区間和のO(1)計算用）
/// * `span_id`/`span_luni` - スパン`(終了位置, 長さ)`毎の単語ID・ユニグラムスコア
/// * `bp_prevlen` - バックポインタ（前単語の長さ）
/// * `dp_ring` - DPリングバッファ（`位置 mod (L+1)`の行 × 長さ`0..=L`の列）
pub struct Workspace {
    max_n_cp: usize,
    max_word_len: usize,

    pub(crate) cp_off: Vec<u16>,
    pub(crate) emit0: Vec<i16>,
    pub(crate) emit1: Vec<i16>,
    pub(crate) pref_emit0: Vec<i32>,
    pub(crate) span_id: Vec<PieceId>,
    pub(crate) span_luni: Vec<i16>,
    pub(crate) bp_prevlen: Vec<u8>,
    pub(crate) dp_ring: Vec<i32>,
}

impl Workspace {
    /// 作業領域を確保します。
    ///
    /// # 引数
    ///
    /// * `max_n_cp` - 1文あたりの最大コードポイント数
    /// * `max_word_len` - 最大単語長（コードポイント数）
    pub fn new(max_n_cp: usize, max_word_len: usize) -> Result<Self> {
        if max_n_cp == 0 || max_n_cp > MAX_SENTENCE_CODEPOINTS {
            return Err(MomijiError::invalid_argument(
                "max_n_cp",
                format!("must be in 1..={MAX_SENTENCE_CODEPOINTS}"),
            ));
        }
        if max_word_len == 0 || max_word_len > 255 {
            // bp_prevlenがu8のため255が上限
            return Err(MomijiError::invalid_argument(
                "max_word_len",
                "must be in 1..=255",
            ));
        }
        let ncp1 = max_n_cp + 1;
        let l1 = max_word_len + 1;
        let span_n = ncp1 * l1;
        Ok(Self {
            max_n_cp,
            max_word_len,
            cp_off: Vec::with_capacity(ncp1),
            emit0: vec![0; max_n_cp],
            emit1: vec![0; max_n_cp],
            pref_emit0: vec![0; ncp1],
            span_id: vec![PIECE_ID_NONE; span_n],
            span_luni: vec![0; span_n],
            bp_prevlen: vec![0; span_n],
            dp_ring: vec![0; l1 * l1],
        })
    }

    /// 最大コードポイント数を返します。
    #[inline(always)]
    pub fn max_n_cp(&self) -> usize {
        self.max_n_cp
    }

    /// 最大単語長を返します。
    #[inline(always)]
    pub fn max_word_len(&self) -> usize {
        self.max_word_len
    }

    /// 直近のデコードで構築されたオフセット配列を返します。
    ///
    /// 境界をコードポイント単位からバイト単位に変換する際に使用します。
    #[inline(always)]
    pub fn offsets(&self) -> &[u16] {
        &self.cp_off
    }

    /// スパンテーブルのインデックス（行優先: `end_pos * (L+1) + len`）
    #[inline(always)]
    pub(crate) fn span_index(&self, end_pos: usize, len: usize) -> usize {
        end_pos * (self.max_word_len + 1) + len
    }
}

/// FFBSサンプリング用の追加作業領域
///
/// 前向き対数分配関数`alpha[pos][k]`を`f64`で保持します。
pub struct SampleWorkspace {
    pub(crate) alpha: Vec<f64>,
    pub(crate) l1: usize,
}

impl SampleWorkspace {
    /// サンプリング用領域を確保します。
    ///
    /// 寸法は対応する[`Workspace`]と一致している必要があります。
    pub fn new(max_n_cp: usize, max_word_len: usize) -> Self {
        let l1 = max_word_len + 1;
        Self {
            alpha: vec![f64::NEG_INFINITY; (max_n_cp + 1) * l1],
            l1,
        }
    }

    #[inline(always)]
    pub(crate) fn at(&self, pos: usize, k: usize) -> f64 {
        self.alpha[pos * self.l1 + k]
    }
}

/// N-bestビタビ用の追加作業領域
///
/// 状態毎に長さ`nbest`の降順スコアリストと、(前単語長, 前ランク)の
/// バックポインタを保持します。
pub struct NbestWorkspace {
    pub(crate) nbest: usize,
    pub(crate) dp: Vec<i32>,
    pub(crate) bp_len: Vec<u8>,
    pub(crate) bp_rank: Vec<u8>,
}

impl NbestWorkspace {
    /// N-best用領域を確保します。
    ///
    /// `nbest`は[`crate::decoder::nbest::MAX_NBEST`]以下である必要があります。
    pub fn new(max_n_cp: usize, max_word_len: usize, nbest: usize) -> Result<Self> {
        if nbest == 0 || nbest > crate::decoder::nbest::MAX_NBEST {
            return Err(MomijiError::invalid_argument(
                "nbest",
                format!("must be in 1..={}", crate::decoder::nbest::MAX_NBEST),
            ));
        }
        let states = (max_n_cp + 1) * (max_word_len + 1);
        Ok(Self {
            nbest,
            dp: vec![0; states * nbest],
            bp_len: vec![0; states * nbest],
            bp_rank: vec![0; states * nbest],
        })
    }

    /// 構築時に指定した候補数を返します。
    #[inline(always)]
    pub fn nbest(&self) -> usize {
        self.nbest
    }
}
