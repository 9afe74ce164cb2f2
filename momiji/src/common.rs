//! 共通の型定義と定数

/// 語彙ピースの識別子（16ビット）
///
/// テーブルサイズ削減のため16ビットを使用します。
/// 最大65533語彙（[`PIECE_ID_NONE`]と[`PIECE_ID_BOS`]は予約）。
pub type PieceId = u16;

/// 未知語/OOV を示す特殊ID
pub const PIECE_ID_NONE: PieceId = 0xFFFF;

/// 文頭（BOS: Beginning Of Sentence）を示す特殊ID
pub const PIECE_ID_BOS: PieceId = 0xFFFE;

/// 1文あたりのコードポイント数の上限
///
/// 境界配列・オフセット配列が`u16`で表現されるため、これを超える文は
/// デコードできません。
pub const MAX_SENTENCE_CODEPOINTS: usize = 65530;

/// losslessエスケープ文字 ▀ (U+2580)
pub const META_ESCAPE: u32 = 0x2580;

/// losslessスペース文字 ▁ (U+2581)
pub const META_SPACE: u32 = 0x2581;

/// losslessタブ文字 ▂ (U+2582)
pub const META_TAB: u32 = 0x2582;

/// lossless LF文字 ▃ (U+2583)
pub const META_LF: u32 = 0x2583;

/// lossless CR文字 ▄ (U+2584)
pub const META_CR: u32 = 0x2584;

/// losslessメタ文字かどうかを判定します。
#[inline(always)]
pub const fn is_meta_codepoint(cp: u32) -> bool {
    cp >= META_ESCAPE && cp <= META_CR
}
