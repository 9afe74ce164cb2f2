//! 可逆トークナイズ（Lossless Tokenization）のための空白コーデック
//!
//! UTF-8バイト列上の全単射を提供します。空白文字を専用のメタ文字
//! （U+2580..U+2584）に写像することで、トークン列を空白区切りで出力しても
//! 元のテキストを完全に復元できるようにします。
//!
//! | メタ | U+   | 意味            |
//! |------|------|-----------------|
//! | ▀    | 2580 | エスケープ接頭辞 |
//! | ▁    | 2581 | スペース        |
//! | ▂    | 2582 | タブ            |
//! | ▃    | 2583 | LF              |
//! | ▄    | 2584 | CR              |
//!
//! 無効なUTF-8バイトはそのままコピーされます（不完全なコーパスを
//! 扱うための意図的な寛容さで、デコード側も同じバイトを保存します）。

use crate::common::{is_meta_codepoint, META_CR, META_ESCAPE, META_LF, META_SPACE, META_TAB};
use crate::utf8::{decode_cp, encode_cp};

/// バイト列をlossless形式にエンコードします。
///
/// スペース・タブ（および`include_newlines`の場合はLF/CR）をメタ文字に
/// 写像し、メタ文字自体は`▀`を前置してエスケープします。その他の
/// コードポイントはそのままコピーされます。
///
/// # 引数
///
/// * `src` - 入力バイト列
/// * `include_newlines` - LF/CRも変換するかどうか
/// * `dst` - 出力バッファ（クリアして再利用される）
pub fn encode(src: &[u8], include_newlines: bool, dst: &mut Vec<u8>) {
    dst.clear();
    let mut enc = [0u8; 4];

    let mut pos = 0;
    while pos < src.len() {
        let (cp, adv) = match decode_cp(src, pos) {
            Some(x) => x,
            None => {
                // 無効なUTF-8はそのままコピー
                dst.push(src[pos]);
                pos += 1;
                continue;
            }
        };

        let meta = match cp {
            0x20 => Some(META_SPACE),
            0x09 => Some(META_TAB),
            0x0A if include_newlines => Some(META_LF),
            0x0D if include_newlines => Some(META_CR),
            _ => None,
        };

        if let Some(meta) = meta {
            let n = encode_cp(meta, &mut enc);
            dst.extend_from_slice(&enc[..n]);
        } else if is_meta_codepoint(cp) {
            // メタ文字はエスケープ: ▀ + 元文字
            let n = encode_cp(META_ESCAPE, &mut enc);
            dst.extend_from_slice(&enc[..n]);
            let n = encode_cp(cp, &mut enc);
            dst.extend_from_slice(&enc[..n]);
        } else {
            dst.extend_from_slice(&src[pos..pos + adv]);
        }
        pos += adv;
    }
}

/// lossless形式のバイト列をデコードします（[`encode`]の逆変換）。
///
/// メタ文字は対応する空白文字に戻し、`▀`は直後のコードポイントを
/// そのまま出力します。末尾の孤立した`▀`は`▀`のまま出力されます。
///
/// # 引数
///
/// * `src` - lossless形式の入力バイト列
/// * `dst` - 出力バッファ（クリアして再利用される）
pub fn decode(src: &[u8], dst: &mut Vec<u8>) {
    dst.clear();
    let mut enc = [0u8; 4];

    let mut pos = 0;
    while pos < src.len() {
        let (cp, adv) = match decode_cp(src, pos) {
            Some(x) => x,
            None => {
                dst.push(src[pos]);
                pos += 1;
                continue;
            }
        };

        match cp {
            META_SPACE => dst.push(b' '),
            META_TAB => dst.push(b'\t'),
            META_LF => dst.push(b'\n'),
            META_CR => dst.push(b'\r'),
            META_ESCAPE => {
                // ▀ + X -> X (エスケープ解除)
                let next = pos + adv;
                match decode_cp(src, next) {
                    Some((next_cp, next_adv)) => {
                        let n = encode_cp(next_cp, &mut enc);
                        dst.extend_from_slice(&enc[..n]);
                        pos = next + next_adv;
                        continue;
                    }
                    None => {
                        // 末尾または無効バイト直前のエスケープはそのまま出力
                        let n = encode_cp(META_ESCAPE, &mut enc);
                        dst.extend_from_slice(&enc[..n]);
                    }
                }
            }
            _ => dst.extend_from_slice(&src[pos..pos + adv]),
        }
        pos += adv;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(s: &[u8], nl: bool) -> Vec<u8> {
        let mut out = vec![];
        encode(s, nl, &mut out);
        out
    }

    fn dec(s: &[u8]) -> Vec<u8> {
        let mut out = vec![];
        decode(s, &mut out);
        out
    }

    #[test]
    fn test_encode_space() {
        assert_eq!(enc(b" ", false), "▁".as_bytes());
        assert_eq!(enc(b" ", false), &[0xE2, 0x96, 0x81]);
        assert_eq!(enc(b"\t", false), "▂".as_bytes());
    }

    #[test]
    fn test_encode_newlines_mode() {
        assert_eq!(enc(b"a\nb", false), b"a\nb");
        assert_eq!(enc(b"a\nb", true), "a▃b".as_bytes());
        assert_eq!(enc(b"a\rb", true), "a▄b".as_bytes());
    }

    #[test]
    fn test_meta_escape() {
        assert_eq!(enc("▁".as_bytes(), false), "▀▁".as_bytes());
        assert_eq!(dec("▀▁".as_bytes()), "▁".as_bytes());
        assert_eq!(enc("▀".as_bytes(), false), "▀▀".as_bytes());
    }

    #[test]
    fn test_trailing_lone_escape() {
        assert_eq!(dec("a▀".as_bytes()), "a▀".as_bytes());
    }

    #[test]
    fn test_invalid_bytes_pass_through() {
        let src = [0x61, 0xFF, 0x20, 0xFE];
        let encoded = enc(&src, false);
        assert_eq!(dec(&encoded), &src);
    }

    #[test]
    fn test_roundtrip() {
        let cases: &[&str] = &[
            "",
            "hello world",
            "タブ\tと スペース",
            "メタ文字 ▁▂▃▄▀ を含む",
            "行1\n行2\r\n",
        ];
        for s in cases {
            for nl in [false, true] {
                let encoded = enc(s.as_bytes(), nl);
                assert_eq!(dec(&encoded), s.as_bytes(), "case {s:?} nl={nl}");
            }
        }
    }

    #[test]
    fn test_tokenize_detokenize_commutes() {
        // トークン区切りのスペースを落として結合しても元に戻る
        let s = "東京 タワー";
        let encoded = enc(s.as_bytes(), false);
        let pieces = [&encoded[..9], &encoded[9..]];
        let joined: Vec<u8> = pieces.concat();
        assert_eq!(dec(&joined), s.as_bytes());
    }
}
