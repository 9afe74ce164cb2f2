//! 文字クラス分類
//!
//! コードポイントを小さなクラスIDへ写像します。クラスIDはCRF素性キーに
//! 直接埋め込まれるため、学習側と推論側で必ず一致している必要があります。
//! 互換性のため、BOS/EOSは250/251を予約します。

use std::io::{BufRead, BufReader, Read};

use crate::common::is_meta_codepoint;
use crate::errors::{MomijiError, Result};

/// その他
pub const CC_OTHER: u8 = 0;
/// 空白文字
pub const CC_SPACE: u8 = 1;
/// 数字
pub const CC_DIGIT: u8 = 2;
/// アルファベット
pub const CC_ALPHA: u8 = 3;
/// ひらがな
pub const CC_HIRAGANA: u8 = 4;
/// カタカナ
pub const CC_KATAKANA: u8 = 5;
/// 漢字（CJK統合漢字）
pub const CC_KANJI: u8 = 6;
/// 全角記号
pub const CC_FULLWIDTH: u8 = 7;
/// 記号（ASCII句読点等）
pub const CC_SYMBOL: u8 = 8;
/// 2バイト文字 (U+0080-U+07FF)（UTF8LENモード用）
pub const CC_UTF8_2BYTE: u8 = 9;
/// 3バイト文字 (U+0800-U+FFFF)（UTF8LENモード用）
pub const CC_UTF8_3BYTE: u8 = 10;
/// 4バイト文字 (U+10000-U+10FFFF)（UTF8LENモード用）
pub const CC_UTF8_4BYTE: u8 = 11;
/// 文頭（仮想クラス）
pub const CC_BOS: u8 = 250;
/// 文末（仮想クラス）
pub const CC_EOS: u8 = 251;

/// 文字クラス分類モード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CcMode {
    /// ASCIIのみ分類、非ASCIIはOTHER
    Ascii = 0,
    /// UTF-8バイト長でバケット分類
    Utf8Len = 1,
    /// ユーザ定義のUnicode範囲表
    Ranges = 2,
    /// 後方互換（日本語ハードコード）
    #[default]
    Compat = 3,
}

impl CcMode {
    /// モデルファイルの`cc_mode`バイトからモードを復元します。
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Ascii),
            1 => Ok(Self::Utf8Len),
            2 => Ok(Self::Ranges),
            3 => Ok(Self::Compat),
            _ => Err(MomijiError::invalid_format(
                "cc_mode",
                format!("unknown mode byte {v}"),
            )),
        }
    }
}

/// Unicode範囲→文字クラスIDのマッピング
///
/// `[lo, hi]`の範囲にあるコードポイントに`class_id`を割り当てます。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcRange {
    /// 範囲開始（inclusive）
    pub lo: u32,
    /// 範囲終了（inclusive）
    pub hi: u32,
    /// 文字クラスID
    pub class_id: u8,
}

/// 文字種分類設定
///
/// `mode`が[`CcMode::Ranges`]の場合、昇順ソート済み・非重複の範囲表と
/// フォールバックモード（ASCIIまたはUTF8LEN）を保持します。
#[derive(Debug, Clone, Default)]
pub struct CharClassifier {
    /// 分類モード
    pub mode: CcMode,
    /// RANGESモードで一致しない場合のフォールバック
    pub fallback: CcMode,
    /// Unicode範囲配列（loで昇順ソート済み）
    pub ranges: Vec<CcRange>,
}

/// ASCII範囲の文字クラス分類（全モード共通処理）
#[inline]
fn class_ascii(cp: u32) -> u8 {
    if cp == 0x20 || cp == 0x09 || cp == 0x0A || cp == 0x0D {
        return CC_SPACE;
    }
    if (0x30..=0x39).contains(&cp) {
        return CC_DIGIT;
    }
    if (0x41..=0x5A).contains(&cp) || (0x61..=0x7A).contains(&cp) {
        return CC_ALPHA;
    }
    CC_SYMBOL
}

/// UTF-8バイト長からクラスを返します。
#[inline]
fn class_utf8len(cp: u32) -> u8 {
    if cp <= 0x7F {
        class_ascii(cp)
    } else if cp <= 0x7FF {
        CC_UTF8_2BYTE
    } else if cp <= 0xFFFF {
        CC_UTF8_3BYTE
    } else {
        CC_UTF8_4BYTE
    }
}

/// 日本語ハードコード範囲（COMPATモード）
#[inline]
fn class_compat(cp: u32) -> u8 {
    if (0x3040..=0x309F).contains(&cp) {
        CC_HIRAGANA
    } else if (0x30A0..=0x30FF).contains(&cp) {
        CC_KATAKANA
    } else if (0x4E00..=0x9FFF).contains(&cp) {
        CC_KANJI
    } else if (0xFF00..=0xFFEF).contains(&cp) {
        CC_FULLWIDTH
    } else {
        CC_OTHER
    }
}

impl CharClassifier {
    /// COMPATモード（日本語ハードコード）の分類器を作成します。
    pub fn compat() -> Self {
        Self {
            mode: CcMode::Compat,
            fallback: CcMode::Utf8Len,
            ranges: vec![],
        }
    }

    /// 範囲表から分類器を作成します。
    ///
    /// 範囲はloで昇順ソートされ、ソート後に重複があればエラーになります。
    ///
    /// # 引数
    ///
    /// * `ranges` - Unicode範囲の配列
    /// * `fallback` - 一致しない場合のフォールバックモード
    pub fn from_ranges(mut ranges: Vec<CcRange>, fallback: CcMode) -> Result<Self> {
        ranges.sort_by_key(|r| r.lo);
        for w in ranges.windows(2) {
            if w[1].lo <= w[0].hi {
                return Err(MomijiError::invalid_argument(
                    "ranges",
                    format!(
                        "overlap detected: [{:#x}-{:#x}] and [{:#x}-{:#x}]",
                        w[0].lo, w[0].hi, w[1].lo, w[1].hi
                    ),
                ));
            }
        }
        Ok(Self {
            mode: CcMode::Ranges,
            fallback,
            ranges,
        })
    }

    /// cc_rangesテキストファイルを読み込んで分類器を作成します。
    ///
    /// 1行につき`start end class_id`。基数は自動判別（10進または`0x`接頭辞の
    /// 16進）。`#`以降はコメント、空行は無視されます。各値はUnicode範囲内
    /// （<= 0x10FFFF）、`class_id <= 255`、`start <= end`が必要です。
    pub fn from_ranges_reader<R>(rdr: R, fallback: CcMode) -> Result<Self>
    where
        R: Read,
    {
        let reader = BufReader::new(rdr);
        let mut ranges = vec![];
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let body = match line.split('#').next() {
                Some(s) => s.trim(),
                None => continue,
            };
            if body.is_empty() {
                continue;
            }
            let mut it = body.split_whitespace();
            let lo = parse_auto_base(it.next(), line_no + 1, "start")?;
            let hi = parse_auto_base(it.next(), line_no + 1, "end")?;
            let cid = parse_auto_base(it.next(), line_no + 1, "class_id")?;
            if lo > hi {
                return Err(MomijiError::invalid_format(
                    "cc_ranges",
                    format!("line {}: start ({lo:#x}) > end ({hi:#x})", line_no + 1),
                ));
            }
            if hi > 0x10FFFF {
                return Err(MomijiError::invalid_format(
                    "cc_ranges",
                    format!("line {}: value out of Unicode range", line_no + 1),
                ));
            }
            if cid > 255 {
                return Err(MomijiError::invalid_format(
                    "cc_ranges",
                    format!("line {}: class_id must be 0-255", line_no + 1),
                ));
            }
            ranges.push(CcRange {
                lo,
                hi,
                class_id: cid as u8,
            });
        }
        Self::from_ranges(ranges, fallback)
    }

    /// コードポイントの文字クラスを判定します。
    ///
    /// losslessメタ文字は常にSPACE、ASCII範囲は常に共通のASCII規則で
    /// 分類され、それ以外はモードに従います。
    pub fn classify(&self, cp: u32) -> u8 {
        if is_meta_codepoint(cp) {
            return CC_SPACE;
        }
        if cp <= 0x7F {
            return class_ascii(cp);
        }
        match self.mode {
            CcMode::Ascii => CC_OTHER,
            CcMode::Utf8Len => class_utf8len(cp),
            CcMode::Ranges => {
                let cls = self.class_from_ranges(cp);
                if cls != CC_OTHER {
                    return cls;
                }
                match self.fallback {
                    CcMode::Utf8Len => class_utf8len(cp),
                    _ => CC_OTHER,
                }
            }
            CcMode::Compat => class_compat(cp),
        }
    }

    fn class_from_ranges(&self, cp: u32) -> u8 {
        // 小さい表は線形探索の方が速い
        if self.ranges.len() <= 8 {
            for r in &self.ranges {
                if cp >= r.lo && cp <= r.hi {
                    return r.class_id;
                }
            }
            return CC_OTHER;
        }
        let mut lo = 0;
        let mut hi = self.ranges.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let r = &self.ranges[mid];
            if cp < r.lo {
                hi = mid;
            } else if cp > r.hi {
                lo = mid + 1;
            } else {
                return r.class_id;
            }
        }
        CC_OTHER
    }
}

fn parse_auto_base(tok: Option<&str>, line_no: usize, field: &str) -> Result<u32> {
    let tok = tok.ok_or_else(|| {
        MomijiError::invalid_format("cc_ranges", format!("line {line_no}: missing {field}"))
    })?;
    let parsed = if let Some(hex) = tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        tok.parse()
    };
    parsed.map_err(|_| {
        MomijiError::invalid_format("cc_ranges", format!("line {line_no}: invalid {field} value"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_rule_applies_in_all_modes() {
        for cls in [
            CharClassifier::compat(),
            CharClassifier {
                mode: CcMode::Ascii,
                ..Default::default()
            },
            CharClassifier {
                mode: CcMode::Utf8Len,
                ..Default::default()
            },
        ] {
            assert_eq!(cls.classify(u32::from(b' ')), CC_SPACE);
            assert_eq!(cls.classify(u32::from(b'\t')), CC_SPACE);
            assert_eq!(cls.classify(u32::from(b'7')), CC_DIGIT);
            assert_eq!(cls.classify(u32::from(b'a')), CC_ALPHA);
            assert_eq!(cls.classify(u32::from(b'Z')), CC_ALPHA);
            assert_eq!(cls.classify(u32::from(b'!')), CC_SYMBOL);
        }
    }

    #[test]
    fn test_meta_codepoints_are_space() {
        let cls = CharClassifier {
            mode: CcMode::Ascii,
            ..Default::default()
        };
        for cp in 0x2580..=0x2584 {
            assert_eq!(cls.classify(cp), CC_SPACE);
        }
    }

    #[test]
    fn test_compat_japanese_ranges() {
        let cls = CharClassifier::compat();
        assert_eq!(cls.classify(0x3042), CC_HIRAGANA); // あ
        assert_eq!(cls.classify(0x30A2), CC_KATAKANA); // ア
        assert_eq!(cls.classify(0x6771), CC_KANJI); // 東
        assert_eq!(cls.classify(0xFF01), CC_FULLWIDTH); // ！
        assert_eq!(cls.classify(0x0416), CC_OTHER); // Ж
    }

    #[test]
    fn test_utf8len_mode() {
        let cls = CharClassifier {
            mode: CcMode::Utf8Len,
            ..Default::default()
        };
        assert_eq!(cls.classify(0x00E9), CC_UTF8_2BYTE); // é
        assert_eq!(cls.classify(0x6771), CC_UTF8_3BYTE);
        assert_eq!(cls.classify(0x1F600), CC_UTF8_4BYTE);
    }

    #[test]
    fn test_ranges_mode_with_fallback() {
        let cls = CharClassifier::from_ranges(
            vec![CcRange {
                lo: 0x0400,
                hi: 0x04FF,
                class_id: CC_ALPHA,
            }],
            CcMode::Utf8Len,
        )
        .unwrap();
        assert_eq!(cls.classify(0x0416), CC_ALPHA);
        assert_eq!(cls.classify(0x6771), CC_UTF8_3BYTE); // フォールバック
    }

    #[test]
    fn test_ranges_binary_search_path() {
        let ranges: Vec<_> = (0..12u32)
            .map(|i| CcRange {
                lo: 0x1000 + i * 0x100,
                hi: 0x1000 + i * 0x100 + 0x7F,
                class_id: (i % 9) as u8,
            })
            .collect();
        let cls = CharClassifier::from_ranges(ranges, CcMode::Ascii).unwrap();
        assert_eq!(cls.classify(0x1230), 2);
        assert_eq!(cls.classify(0x12F0), CC_OTHER); // 隙間 + ASCIIフォールバック
    }

    #[test]
    fn test_ranges_overlap_rejected() {
        let e = CharClassifier::from_ranges(
            vec![
                CcRange {
                    lo: 0x100,
                    hi: 0x1FF,
                    class_id: 1,
                },
                CcRange {
                    lo: 0x1FF,
                    hi: 0x2FF,
                    class_id: 2,
                },
            ],
            CcMode::Ascii,
        );
        assert!(e.is_err());
    }

    #[test]
    fn test_ranges_reader() {
        let text = "# cyrillic\n0x400 0x4FF 3\n\n0x3040 0x309F 4  # hiragana\n";
        let cls = CharClassifier::from_ranges_reader(text.as_bytes(), CcMode::Utf8Len).unwrap();
        assert_eq!(cls.ranges.len(), 2);
        assert_eq!(cls.classify(0x0416), CC_ALPHA);
        assert_eq!(cls.classify(0x3042), CC_HIRAGANA);
    }

    #[test]
    fn test_ranges_reader_rejects_bad_values() {
        assert!(
            CharClassifier::from_ranges_reader("0x200000 0x200001 1".as_bytes(), CcMode::Ascii)
                .is_err()
        );
        assert!(
            CharClassifier::from_ranges_reader("0x20 0x10 1".as_bytes(), CcMode::Ascii).is_err()
        );
        assert!(
            CharClassifier::from_ranges_reader("0x20 0x30 999".as_bytes(), CcMode::Ascii).is_err()
        );
    }
}
