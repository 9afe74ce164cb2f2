//! コンパクトなダブル配列トライ (BASE/CHECK)
//!
//! キーはバイト列として扱います（UTF-8もバイト列のまま）。`check == 0`を
//! 空きスロットとして使用し、キー終端の遷移として明示的にコード0を
//! 使用します。語彙ピースIDは終端ノードのBASE値に`-(id + 1)`として
//! 格納されます。
//!
//! ルートノードのインデックスは1で、インデックス0は未使用です。

use crate::errors::{MomijiError, Result};

/// ルートノードのインデックス
pub const TRIE_ROOT: u32 = 1;

/// BASE/CHECK配列の容量上限
///
/// base探索・容量拡張はこの範囲で打ち切り、[`MomijiError::CapacityExceeded`]を
/// 返します。
const MAX_CAPACITY: usize = i32::MAX as usize;

/// トライスロットの内容
///
/// 終端ノードのBASEは負数エンコードされた値、非終端ノードのBASEは
/// 子ノード配置の基点です。フォーマット互換のため格納は単一の符号付き
/// 整数のままですが、読み出しはこのタグ付きの形で行います。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrieSlot {
    /// 空きスロット、または遷移先なし
    Vacant,
    /// 内部ノード（BASE値）
    Internal(i32),
    /// 終端ノード（デコード済みピースID）
    Terminal(u32),
}

/// 読み取り専用のダブル配列ビュー
///
/// 凍結済みモデルが所有するBASE/CHECK配列の上に構築され、推論時の
/// 検索に使用されます。
#[derive(Debug, Clone, Copy)]
pub struct TrieView<'a> {
    base: &'a [i32],
    check: &'a [i32],
}

impl<'a> TrieView<'a> {
    /// BASE/CHECK配列からビューを作成します。
    ///
    /// 両配列は同じ長さで、少なくともルートを含む必要があります。
    pub fn new(base: &'a [i32], check: &'a [i32]) -> Result<Self> {
        if base.len() != check.len() || base.len() <= TRIE_ROOT as usize {
            return Err(MomijiError::invalid_argument(
                "base/check",
                "arrays must have the same length and contain the root",
            ));
        }
        Ok(Self { base, check })
    }

    /// 配列の容量（要素数）を返します。
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.base.len()
    }

    /// `cur`からバイト`code`で遷移した次のノードを返します（失敗時0）。
    #[inline]
    pub fn next(&self, cur: u32, code: u8) -> u32 {
        if cur == 0 || cur as usize >= self.base.len() {
            return 0;
        }
        let b = self.base[cur as usize];
        if b <= 0 {
            return 0; // 負のBASEは終端値
        }
        let idx = b as usize + usize::from(code);
        if idx >= self.base.len() {
            return 0;
        }
        // ルートの自己ループを遷移として扱わない
        if idx == cur as usize {
            return 0;
        }
        if self.check[idx] == cur as i32 {
            idx as u32
        } else {
            0
        }
    }

    /// ノードのスロット内容をタグ付きで読み出します。
    #[inline]
    pub fn slot(&self, node: u32) -> TrieSlot {
        if node == 0 || node as usize >= self.base.len() {
            return TrieSlot::Vacant;
        }
        let v = self.base[node as usize];
        if v < 0 {
            // i64経由で符号反転し、i32::MINでも溢れないようにする
            let id = -(i64::from(v)) - 1;
            return TrieSlot::Terminal(id as u32);
        }
        TrieSlot::Internal(v)
    }

    /// `key`全体を消費した後のノードを返します（経路がなければ0）。
    pub fn search_prefix_bytes(&self, key: &[u8]) -> u32 {
        let mut cur = TRIE_ROOT;
        for &c in key {
            cur = self.next(cur, c);
            if cur == 0 {
                return 0;
            }
        }
        cur
    }

    /// `key`が挿入済みかどうかを返します。
    pub fn contains_bytes(&self, key: &[u8]) -> bool {
        let node = self.search_prefix_bytes(key);
        node != 0 && self.next(node, 0) != 0
    }

    /// ノード`node`に終端値（ピースID）があれば返します。
    ///
    /// ヌル文字(0)で終端ノードに遷移し、負数エンコードされたBASE値から
    /// IDを復元します。非負のBASEは終端値なしとして扱います。
    #[inline]
    pub fn term_value_at(&self, node: u32) -> Option<u32> {
        let term = self.next(node, 0);
        if term == 0 {
            return None;
        }
        match self.slot(term) {
            TrieSlot::Terminal(id) => Some(id),
            _ => None,
        }
    }

    /// `key`に対応する終端値（ピースID）を検索します。
    pub fn get_term_value(&self, key: &[u8]) -> Option<u32> {
        let node = self.search_prefix_bytes(key);
        if node == 0 {
            return None;
        }
        self.term_value_at(node)
    }
}

/// 書き込み可能なダブル配列トライ
///
/// 学習時の語彙構築に使用します。容量は必要に応じて2の累乗で拡張され、
/// BASE/CHECKは常に同時に拡張されるため途中失敗で不整合になることは
/// ありません。凍結後は[`Trie::view`]で読み取り専用ビューを取得します。
pub struct Trie {
    base: Vec<i32>,
    check: Vec<i32>,
}

impl Default for Trie {
    fn default() -> Self {
        Self::new()
    }
}

impl Trie {
    /// 空のトライを作成します。
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// 初期容量を指定してトライを作成します。
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(16);
        let mut t = Self {
            base: vec![0; capacity],
            check: vec![0; capacity],
        };
        t.clear();
        t
    }

    /// すべてのキーを削除し、ルートのみの状態に戻します（容量は保持）。
    pub fn clear(&mut self) {
        self.base.fill(0);
        self.check.fill(0);
        // ルートは占有済みにする
        self.base[TRIE_ROOT as usize] = 1;
        self.check[TRIE_ROOT as usize] = TRIE_ROOT as i32;
    }

    /// 現在の容量（要素数）を返します。
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.base.len()
    }

    /// BASE配列への参照を返します（モデル書き出し用）。
    #[inline(always)]
    pub fn base(&self) -> &[i32] {
        &self.base
    }

    /// CHECK配列への参照を返します（モデル書き出し用）。
    #[inline(always)]
    pub fn check(&self) -> &[i32] {
        &self.check
    }

    /// 読み取り専用ビューを取得します。
    #[inline(always)]
    pub fn view(&self) -> TrieView<'_> {
        TrieView {
            base: &self.base,
            check: &self.check,
        }
    }

    /// キーを挿入します。既に存在する場合は何もしません（冪等）。
    ///
    /// # エラー
    ///
    /// * [`MomijiError::InvalidArgument`] - 空キーの場合
    /// * [`MomijiError::CapacityExceeded`] - 配置可能なbaseが尽きた場合
    pub fn add_bytes(&mut self, key: &[u8]) -> Result<()> {
        // 空キー（長さ0）はルート自己ループと衝突しやすく、サポートしない
        if key.is_empty() {
            return Err(MomijiError::invalid_argument("key", "empty key"));
        }

        let mut cur = TRIE_ROOT;
        for &c in key {
            cur = self.ensure_transition(cur, c)?;
        }
        // キー終端マーカー (バイト0)
        self.ensure_transition(cur, 0)?;
        Ok(())
    }

    /// `key`が挿入済みかどうかを返します。
    pub fn contains_bytes(&self, key: &[u8]) -> bool {
        self.view().contains_bytes(key)
    }

    /// `key`全体を消費した後のノードを返します（経路がなければ0）。
    pub fn search_prefix_bytes(&self, key: &[u8]) -> u32 {
        self.view().search_prefix_bytes(key)
    }

    /// キーを挿入し、終端ノードにピースIDを設定します。
    ///
    /// 終端ノードのBASE値を`-(id + 1)`としてエンコードします。
    pub fn set_term_value(&mut self, key: &[u8], id: u32) -> Result<()> {
        if id >= i32::MAX as u32 {
            return Err(MomijiError::invalid_argument(
                "id",
                "terminal value does not fit the negated encoding",
            ));
        }
        self.add_bytes(key)?;

        let node = self.view().search_prefix_bytes(key);
        if node == 0 {
            return Err(MomijiError::invalid_state("trie lost key after insertion"));
        }
        let term = self.view().next(node, 0);
        if term == 0 {
            return Err(MomijiError::invalid_state(
                "trie lost terminal slot after insertion",
            ));
        }
        self.base[term as usize] = -(id as i32 + 1);
        Ok(())
    }

    /// `key`に対応する終端値（ピースID）を検索します。
    pub fn get_term_value(&self, key: &[u8]) -> Option<u32> {
        self.view().get_term_value(key)
    }

    /// 容量を`need`要素以上に拡張します。
    ///
    /// BASE/CHECKは同時に拡張します。旧実装（realloc 2回）では片方の失敗で
    /// トライが不整合になり得たため、ここでも「両方まとめて」を保ちます。
    fn reserve(&mut self, need: usize) -> Result<()> {
        if need <= self.base.len() {
            return Ok(());
        }
        if need > MAX_CAPACITY {
            return Err(MomijiError::CapacityExceeded("double-array capacity"));
        }
        let mut newcap = self.base.len().max(256);
        while newcap < need {
            newcap = newcap.saturating_mul(2).min(MAX_CAPACITY);
        }
        self.base.resize(newcap, 0);
        self.check.resize(newcap, 0);
        Ok(())
    }

    /// 親ノードの既存の子コードを収集します。
    fn collect_children_codes(&self, parent: u32, codes_out: &mut [u8; 256]) -> usize {
        let b = self.base[parent as usize];
        if b <= 0 {
            return 0;
        }
        let mut n = 0;
        for c in 0..256usize {
            let idx = b as usize + c;
            // 親自身を子ノードとして数えてはいけない（ルートの自己ループ防止）
            if idx == parent as usize {
                continue;
            }
            if idx < self.check.len() && self.check[idx] == parent as i32 {
                codes_out[n] = c as u8;
                n += 1;
            }
        }
        n
    }

    /// すべての`codes[i]`に対してスロット`(b + codes[i])`が利用可能な
    /// base値`b`を探します。
    ///
    /// この親が既に占有しているスロットは「利用可能」として扱います
    /// （再配置されるため）。
    fn find_base(&mut self, parent: u32, codes: &[u8]) -> Result<i32> {
        debug_assert!(!codes.is_empty());
        let maxc = codes.iter().copied().max().map_or(0, usize::from);

        // 1からスキャン: 低いインデックスを詰めた方が配列が小さくなる
        let mut b: i32 = 1;
        loop {
            let need = b as usize + maxc + 1;
            self.reserve(need)?;

            let mut ok = true;
            for &c in codes {
                let idx = b as usize + usize::from(c);
                // 親ノード自身のスロットを子に割り当てるのは禁止
                if idx == parent as usize {
                    ok = false;
                    break;
                }
                let chk = self.check[idx];
                if chk != 0 && chk != parent as i32 {
                    ok = false;
                    break;
                }
            }
            if ok {
                return Ok(b);
            }
            b = match b.checked_add(1) {
                Some(v) => v,
                None => return Err(MomijiError::CapacityExceeded("double-array base range")),
            };
        }
    }

    /// 親の既存の子をすべて現在のbaseから`new_base`へ再配置します。
    fn relocate_children(&mut self, parent: u32, new_base: i32) -> Result<()> {
        let mut codes = [0u8; 256];
        let n = self.collect_children_codes(parent, &mut codes);

        let old_base = self.base[parent as usize];

        // 移動前の状態を保存（移動先と移動元の範囲は重なり得る）
        let mut old_idx = [0i32; 256];
        let mut new_idx = [0i32; 256];
        let mut child_base = [0i32; 256];
        for i in 0..n {
            let o = old_base as usize + usize::from(codes[i]);
            let nn = new_base as usize + usize::from(codes[i]);
            self.reserve(nn + 1)?;
            old_idx[i] = o as i32;
            new_idx[i] = nn as i32;
            child_base[i] = self.base[o];
        }

        // 旧スロットをクリア
        for i in 0..n {
            let o = old_idx[i] as usize;
            self.base[o] = 0;
            self.check[o] = 0;
        }

        // 新スロットに書き込み
        for i in 0..n {
            let nn = new_idx[i] as usize;
            self.check[nn] = parent as i32;
            self.base[nn] = child_base[i];
        }

        // 孫ノードのcheckポインタを修正 (old_child -> new_child)。
        //
        // 1回の再配置で複数の子ノードを動かすと、new_childが別のold_childと
        // 同じ値になることがある。逐次更新すると「更新済みのcheck」が別の
        // old_childと誤一致して二重変換が起こるため、まず負数でマーキングし、
        // 全マッピング適用後に正へ戻す。
        for i in 0..n {
            let b = child_base[i];
            if b <= 0 {
                continue;
            }
            let old_child = old_idx[i];
            let new_child = new_idx[i];
            for c in 0..256usize {
                let g = b as usize + c;
                if g < self.check.len() && self.check[g] == old_child {
                    self.check[g] = -new_child;
                }
            }
        }
        for i in 0..n {
            let b = child_base[i];
            if b <= 0 {
                continue;
            }
            let new_child = new_idx[i];
            for c in 0..256usize {
                let g = b as usize + c;
                if g < self.check.len() && self.check[g] == -new_child {
                    self.check[g] = new_child;
                }
            }
        }

        self.base[parent as usize] = new_base;
        Ok(())
    }

    /// `parent --code-->`の遷移が存在することを保証します。
    fn ensure_transition(&mut self, parent: u32, code: u8) -> Result<u32> {
        debug_assert!(parent > 0 && (parent as usize) < self.base.len());

        let mut b = self.base[parent as usize];
        if b <= 0 {
            let new_base = self.find_base(parent, &[code])?;
            self.base[parent as usize] = new_base;
            b = new_base;
        }

        let idx = b as usize + usize::from(code);
        self.reserve(idx + 1)?;

        let chk = self.check[idx];
        if chk == parent as i32 {
            return Ok(idx as u32);
        }
        if chk == 0 {
            self.check[idx] = parent as i32;
            self.base[idx] = 0;
            return Ok(idx as u32);
        }

        // 衝突: 既存の子 + この新コードを再配置
        let mut codes = [0u8; 256];
        let mut n = self.collect_children_codes(parent, &mut codes);
        if !codes[..n].contains(&code) {
            codes[n] = code;
            n += 1;
        }

        let new_base = self.find_base(parent, &codes[..n])?;
        self.relocate_children(parent, new_base)?;

        let idx = new_base as usize + usize::from(code);
        self.reserve(idx + 1)?;
        if self.check[idx] != 0 {
            // find_baseが空きを保証しているので本来起こらない
            return Err(MomijiError::invalid_state(
                "relocated slot is still occupied",
            ));
        }
        self.check[idx] = parent as i32;
        self.base[idx] = 0;
        Ok(idx as u32)
    }
}
