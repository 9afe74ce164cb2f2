//! トークン化処理のためのルーチンを提供するモジュール。
//!
//! [`Tokenizer`]は凍結済みモデルを所有し、[`Worker`]がデコードに必要な
//! 内部バッファを保持・再利用します。モデルは不変参照で複数のワーカー
//! から共有できますが、ワーカー自体は呼び出し毎のDP状態を持つため
//! スレッド間で共有できません。

use crate::common::MAX_SENTENCE_CODEPOINTS;
use crate::decoder::sample::{decode_sample, XorShift32};
use crate::decoder::nbest::decode_nbest;
use crate::decoder::{
    boundaries_to_bytes, decode, NbestWorkspace, SampleWorkspace, Workspace,
};
use crate::errors::{MomijiError, Result};
use crate::model::Model;
use std::ops::Range;

/// ワークスペースの初期コードポイント容量
const INITIAL_MAX_N_CP: usize = 1024;

/// 統合モデルによるトークナイザー
pub struct Tokenizer {
    model: Model,
}

impl Tokenizer {
    /// モデルからトークナイザーを作成します。
    pub const fn new(model: Model) -> Self {
        Self { model }
    }

    /// モデルへの参照を返します。
    #[inline(always)]
    pub const fn model(&self) -> &Model {
        &self.model
    }

    /// 新しいワーカーを作成します。
    pub fn new_worker(&self) -> Worker<'_> {
        Worker::new(self)
    }
}

/// トークン化のための作業バッファを保持するワーカー
///
/// 内部の作業領域は入力に対して小さすぎた場合、上限
/// （[`MAX_SENTENCE_CODEPOINTS`]）まで倍々で自動拡張されます。
/// 上限を超える入力にはそのままエラーを返します。
///
/// # 例
///
/// ```ignore
/// let tokenizer = Tokenizer::new(model);
/// let mut worker = tokenizer.new_worker();
/// worker.tokenize("吾輩は猫である")?;
/// for i in 0..worker.num_tokens() {
///     println!("{:?}", worker.range_byte(i));
/// }
/// ```
pub struct Worker<'a> {
    tokenizer: &'a Tokenizer,
    ws: Workspace,
    sample_ws: Option<SampleWorkspace>,
    nbest_ws: Option<NbestWorkspace>,
    boundaries_cp: Vec<u16>,
    boundaries_byte: Vec<u16>,
    score: i32,
    nbest_paths: Vec<(Vec<u16>, i32)>,
}

impl<'a> Worker<'a> {
    fn new(tokenizer: &'a Tokenizer) -> Self {
        let max_word_len = usize::from(tokenizer.model.max_word_len.max(1)).min(255);
        Self {
            tokenizer,
            // 容量は検証済みの定数なので失敗しない
            ws: Workspace::new(INITIAL_MAX_N_CP, max_word_len)
                .expect("initial workspace size is valid"),
            sample_ws: None,
            nbest_ws: None,
            boundaries_cp: vec![],
            boundaries_byte: vec![],
            score: 0,
            nbest_paths: vec![],
        }
    }

    /// 作業領域を倍々で拡張します。上限に達している場合は元のエラーを返します。
    fn grow(&mut self, err: MomijiError) -> Result<()> {
        let cur = self.ws.max_n_cp();
        if cur >= MAX_SENTENCE_CODEPOINTS {
            return Err(err);
        }
        let next = (cur * 2).min(MAX_SENTENCE_CODEPOINTS);
        self.ws = Workspace::new(next, self.ws.max_word_len())?;
        // 追加領域は寸法が合わなくなるため破棄して作り直す
        self.sample_ws = None;
        if let Some(nw) = self.nbest_ws.take() {
            self.nbest_ws = Some(NbestWorkspace::new(
                next,
                self.ws.max_word_len(),
                nw.nbest(),
            )?);
        }
        Ok(())
    }

    /// 入力をトークン化し、境界を内部に保存します。
    ///
    /// # エラー
    ///
    /// * [`MomijiError::InvalidUtf8`] - 入力が正準UTF-8でない場合
    /// * [`MomijiError::NoCover`] - 分割が存在しない場合
    /// * [`MomijiError::WorkspaceTooSmall`] - 入力が上限を超える場合
    pub fn tokenize<B>(&mut self, input: B) -> Result<()>
    where
        B: AsRef<[u8]>,
    {
        let input = input.as_ref();
        loop {
            match decode(
                &self.tokenizer.model,
                input,
                &mut self.ws,
                &mut self.boundaries_cp,
            ) {
                Ok(score) => {
                    self.score = score;
                    boundaries_to_bytes(
                        self.ws.offsets(),
                        &self.boundaries_cp,
                        &mut self.boundaries_byte,
                    );
                    return Ok(());
                }
                Err(e @ MomijiError::WorkspaceTooSmall { .. }) => self.grow(e)?,
                Err(e) => return Err(e),
            }
        }
    }

    /// FFBSサンプリングで入力を確率的にトークン化します。
    pub fn tokenize_sample<B>(
        &mut self,
        input: B,
        temperature: f64,
        rng: &mut XorShift32,
    ) -> Result<()>
    where
        B: AsRef<[u8]>,
    {
        let input = input.as_ref();
        loop {
            if self.sample_ws.is_none() {
                self.sample_ws = Some(SampleWorkspace::new(
                    self.ws.max_n_cp(),
                    self.ws.max_word_len(),
                ));
            }
            let sw = self.sample_ws.as_mut().expect("created above");
            match decode_sample(
                &self.tokenizer.model,
                input,
                &mut self.ws,
                sw,
                temperature,
                rng,
                &mut self.boundaries_cp,
            ) {
                Ok(score) => {
                    self.score = score;
                    boundaries_to_bytes(
                        self.ws.offsets(),
                        &self.boundaries_cp,
                        &mut self.boundaries_byte,
                    );
                    return Ok(());
                }
                Err(e @ MomijiError::WorkspaceTooSmall { .. }) => self.grow(e)?,
                Err(e) => return Err(e),
            }
        }
    }

    /// 上位`nbest`個の分割候補を内部に保存します。
    ///
    /// 結果は[`Self::num_nbest_paths`]、[`Self::nbest_boundaries_cp`]、
    /// [`Self::path_score`]でアクセスできます。
    pub fn tokenize_nbest<B>(&mut self, input: B, nbest: usize) -> Result<()>
    where
        B: AsRef<[u8]>,
    {
        let input = input.as_ref();
        loop {
            let need_new = match &self.nbest_ws {
                Some(nw) => nw.nbest() != nbest,
                None => true,
            };
            if need_new {
                self.nbest_ws = Some(NbestWorkspace::new(
                    self.ws.max_n_cp(),
                    self.ws.max_word_len(),
                    nbest,
                )?);
            }
            let nw = self.nbest_ws.as_mut().expect("created above");
            match decode_nbest(&self.tokenizer.model, input, &mut self.ws, nw) {
                Ok(paths) => {
                    self.nbest_paths = paths;
                    return Ok(());
                }
                Err(e @ MomijiError::WorkspaceTooSmall { .. }) => self.grow(e)?,
                Err(e) => return Err(e),
            }
        }
    }

    /// 直近のトークン化のトークン数を返します。
    #[inline(always)]
    pub fn num_tokens(&self) -> usize {
        self.boundaries_cp.len().saturating_sub(1)
    }

    /// 直近のトークン化のスコア（Q8.8）を返します。
    #[inline(always)]
    pub const fn score(&self) -> i32 {
        self.score
    }

    /// `i`番目のトークンのバイト範囲を返します。
    #[inline]
    pub fn range_byte(&self, i: usize) -> Range<usize> {
        usize::from(self.boundaries_byte[i])..usize::from(self.boundaries_byte[i + 1])
    }

    /// `i`番目のトークンのコードポイント範囲を返します。
    #[inline]
    pub fn range_char(&self, i: usize) -> Range<usize> {
        usize::from(self.boundaries_cp[i])..usize::from(self.boundaries_cp[i + 1])
    }

    /// 直近のトークン化の境界配列（コードポイント単位）を返します。
    #[inline(always)]
    pub fn boundaries_cp(&self) -> &[u16] {
        &self.boundaries_cp
    }

    /// 直近のトークン化の境界配列（バイト単位）を返します。
    #[inline(always)]
    pub fn boundaries_byte(&self) -> &[u16] {
        &self.boundaries_byte
    }

    /// 見つかったN-bestパスの数を返します。
    #[inline(always)]
    pub fn num_nbest_paths(&self) -> usize {
        self.nbest_paths.len()
    }

    /// `path_idx`番目のN-bestパスの境界配列（コードポイント単位）を返します。
    pub fn nbest_boundaries_cp(&self, path_idx: usize) -> Option<&[u16]> {
        self.nbest_paths.get(path_idx).map(|(b, _)| b.as_slice())
    }

    /// `path_idx`番目のN-bestパスのスコアを返します。
    pub fn path_score(&self, path_idx: usize) -> Option<i32> {
        self.nbest_paths.get(path_idx).map(|&(_, s)| s)
    }

    /// 直近のデコードのオフセット配列を返します。
    #[inline(always)]
    pub fn offsets(&self) -> &[u16] {
        self.ws.offsets()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::toy_model;

    #[test]
    fn test_worker_tokenize_ranges() {
        let model = toy_model(&[("東", -2.0), ("京", -2.0), ("東京", -1.0)], 4);
        let tokenizer = Tokenizer::new(model);
        let mut worker = tokenizer.new_worker();
        worker.tokenize("東京".as_bytes()).unwrap();
        assert_eq!(worker.num_tokens(), 1);
        assert_eq!(worker.range_char(0), 0..2);
        assert_eq!(worker.range_byte(0), 0..6);
    }

    #[test]
    fn test_worker_auto_grow() {
        let model = toy_model(&[("a", -0.5)], 2);
        let tokenizer = Tokenizer::new(model);
        let mut worker = tokenizer.new_worker();
        // 初期容量1024を超える入力でも自動拡張で成功する
        let input = "a".repeat(3000);
        worker.tokenize(input.as_bytes()).unwrap();
        assert_eq!(worker.num_tokens(), 3000);
    }

    #[test]
    fn test_worker_nbest_matches_decode() {
        let model = toy_model(&[("a", -1.0), ("b", -1.0), ("ab", -1.5)], 3);
        let tokenizer = Tokenizer::new(model);
        let mut worker = tokenizer.new_worker();
        worker.tokenize(b"ab").unwrap();
        let best = worker.boundaries_cp().to_vec();
        worker.tokenize_nbest(b"ab", 4).unwrap();
        assert_eq!(worker.num_nbest_paths(), 2);
        assert_eq!(worker.nbest_boundaries_cp(0).unwrap(), best.as_slice());
    }

    #[test]
    fn test_worker_sample() {
        let model = toy_model(&[("a", -1.0), ("b", -1.0), ("ab", -0.2)], 3);
        let tokenizer = Tokenizer::new(model);
        let mut worker = tokenizer.new_worker();
        let mut rng = XorShift32::new(9);
        worker.tokenize_sample(b"ab", 0.01, &mut rng).unwrap();
        assert_eq!(worker.boundaries_cp(), &[0, 2]);
    }
}
