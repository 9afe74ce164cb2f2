//! モデルファイルの読み書き
//!
//! 学習→保存→テストを繰り返すための簡易バイナリ形式です。すべて
//! little-endianで、長期互換を保証するものではないのでバージョンを
//! 確認してください。
//!
//! v1（`MMJPv1\0\0`）はflags, cc_mode, cc_fallback, cc_rangesを持たない
//! 旧形式で、読み込みのみサポートします。

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::charclass::{CcMode, CcRange, CharClassifier};
use crate::errors::{MomijiError, Result};
use crate::model::{CrfParams, LangModel, Model};

/// v2マジックバイト
pub const MODEL_MAGIC: &[u8; 8] = b"MMJPv2\0\0";
/// v2フォーマットバージョン
pub const MODEL_VERSION: u32 = 2;

/// v1マジックバイト（読み込みのみ）
pub const MODEL_MAGIC_V1: &[u8; 8] = b"MMJPv1\0\0";
/// v1フォーマットバージョン
pub const MODEL_VERSION_V1: u32 = 1;

/// base/checkの要素サイズ（バイト）
const DA_INDEX_BYTES: u32 = 4;

fn wr_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn wr_i32<W: Write>(w: &mut W, v: i32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn wr_i16<W: Write>(w: &mut W, v: i16) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn rd_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn rd_i32<R: Read>(r: &mut R) -> Result<i32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(i32::from_le_bytes(b))
}

fn rd_i16<R: Read>(r: &mut R) -> Result<i16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(i16::from_le_bytes(b))
}

impl Model {
    /// モデルをv2バイナリ形式で書き出します。
    pub fn write<W>(&self, wtr: W) -> Result<()>
    where
        W: Write,
    {
        if self.lm.da_base.len() != self.lm.da_check.len() || self.lm.da_base.len() < 2 {
            return Err(MomijiError::invalid_argument(
                "model",
                "double-array is empty or inconsistent",
            ));
        }
        if self.lm.logp_uni.is_empty() {
            return Err(MomijiError::invalid_argument("model", "empty vocabulary"));
        }
        if self.crf.feat_key.len() != self.crf.feat_w.len() {
            return Err(MomijiError::invalid_argument(
                "model",
                "feature key/weight length mismatch",
            ));
        }
        if self.lm.bigram_key.len() != self.lm.logp_bi.len() {
            return Err(MomijiError::invalid_argument(
                "model",
                "bigram key/logp length mismatch",
            ));
        }

        let mut w = BufWriter::new(wtr);

        // --- ヘッダ (v2) ---
        w.write_all(MODEL_MAGIC)?;
        wr_u32(&mut w, MODEL_VERSION)?;
        wr_u32(&mut w, DA_INDEX_BYTES)?;
        wr_u32(&mut w, self.lm.da_base.len() as u32)?;
        wr_u32(&mut w, self.lm.logp_uni.len() as u32)?;
        wr_u32(&mut w, u32::from(self.max_word_len))?;

        wr_i16(&mut w, self.lm.unk_base)?;
        wr_i16(&mut w, self.lm.unk_per_cp)?;
        wr_i16(&mut w, self.lambda0)?;

        wr_i16(&mut w, self.crf.trans00)?;
        wr_i16(&mut w, self.crf.trans01)?;
        wr_i16(&mut w, self.crf.trans10)?;
        wr_i16(&mut w, self.crf.trans11)?;
        wr_i16(&mut w, self.crf.bos_to1)?;

        wr_u32(&mut w, self.crf.feat_key.len() as u32)?;
        wr_u32(&mut w, self.lm.bigram_key.len() as u32)?;

        wr_u32(&mut w, self.flags)?;
        w.write_all(&[self.cc.mode as u8, self.cc.fallback as u8, 0, 0])?;
        wr_u32(&mut w, self.cc.ranges.len() as u32)?;

        // --- 配列 ---
        for &v in &self.lm.da_base {
            wr_i32(&mut w, v)?;
        }
        for &v in &self.lm.da_check {
            wr_i32(&mut w, v)?;
        }
        for &v in &self.lm.logp_uni {
            wr_i16(&mut w, v)?;
        }
        for &k in &self.lm.bigram_key {
            wr_u32(&mut w, k)?;
        }
        for &v in &self.lm.logp_bi {
            wr_i16(&mut w, v)?;
        }
        for &k in &self.crf.feat_key {
            wr_u32(&mut w, k)?;
        }
        for &v in &self.crf.feat_w {
            wr_i16(&mut w, v)?;
        }
        for r in &self.cc.ranges {
            wr_u32(&mut w, r.lo)?;
            wr_u32(&mut w, r.hi)?;
            w.write_all(&[r.class_id, 0, 0, 0])?;
        }

        w.flush()?;
        Ok(())
    }

    /// モデルをバイナリ形式から読み込みます（v1/v2）。
    pub fn read<R>(rdr: R) -> Result<Self>
    where
        R: Read,
    {
        let mut r = BufReader::new(rdr);

        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        let is_v1 = if &magic == MODEL_MAGIC {
            false
        } else if &magic == MODEL_MAGIC_V1 {
            true
        } else {
            return Err(MomijiError::invalid_format("model", "unknown magic bytes"));
        };

        let version = rd_u32(&mut r)?;
        let expected = if is_v1 { MODEL_VERSION_V1 } else { MODEL_VERSION };
        if version != expected {
            return Err(MomijiError::invalid_format(
                "model",
                format!("unsupported version {version} (expected {expected})"),
            ));
        }
        let da_index_bytes = rd_u32(&mut r)?;
        if da_index_bytes != DA_INDEX_BYTES {
            return Err(MomijiError::invalid_format(
                "model",
                format!("unsupported da_index_bytes {da_index_bytes}"),
            ));
        }
        let da_cap = rd_u32(&mut r)? as usize;
        let vocab = rd_u32(&mut r)? as usize;
        let max_word_len = rd_u32(&mut r)?;
        if da_cap < 2 || vocab == 0 || max_word_len == 0 || max_word_len > 0xFFFF {
            return Err(MomijiError::invalid_format(
                "model",
                "header fields out of range",
            ));
        }

        let unk_base = rd_i16(&mut r)?;
        let unk_per_cp = rd_i16(&mut r)?;
        let lambda0 = rd_i16(&mut r)?;

        let trans00 = rd_i16(&mut r)?;
        let trans01 = rd_i16(&mut r)?;
        let trans10 = rd_i16(&mut r)?;
        let trans11 = rd_i16(&mut r)?;
        let bos_to1 = rd_i16(&mut r)?;

        let feat_count = rd_u32(&mut r)? as usize;
        let bigram_size = rd_u32(&mut r)? as usize;

        // v2: flags, cc_mode, cc_fallback, cc_range_count
        let mut flags = 0u32;
        let mut cc_mode = CcMode::Utf8Len;
        let mut cc_fallback = CcMode::Ascii;
        let mut cc_range_count = 0usize;
        if !is_v1 {
            flags = rd_u32(&mut r)?;
            let mut buf4 = [0u8; 4];
            r.read_exact(&mut buf4)?;
            // buf4[2], buf4[3] はパディング
            cc_mode = CcMode::from_u8(buf4[0])?;
            cc_fallback = CcMode::from_u8(buf4[1])?;
            cc_range_count = rd_u32(&mut r)? as usize;
        }

        // --- 配列 ---
        let mut da_base = vec![0i32; da_cap];
        for v in da_base.iter_mut() {
            *v = rd_i32(&mut r)?;
        }
        let mut da_check = vec![0i32; da_cap];
        for v in da_check.iter_mut() {
            *v = rd_i32(&mut r)?;
        }
        let mut logp_uni = vec![0i16; vocab];
        for v in logp_uni.iter_mut() {
            *v = rd_i16(&mut r)?;
        }

        let mut bigram_key = vec![0u32; bigram_size];
        for v in bigram_key.iter_mut() {
            *v = rd_u32(&mut r)?;
        }
        let mut logp_bi = vec![0i16; bigram_size];
        for v in logp_bi.iter_mut() {
            *v = rd_i16(&mut r)?;
        }

        let mut feat_key = vec![0u32; feat_count];
        for v in feat_key.iter_mut() {
            *v = rd_u32(&mut r)?;
        }
        let mut feat_w = vec![0i16; feat_count];
        for v in feat_w.iter_mut() {
            *v = rd_i16(&mut r)?;
        }

        let mut ranges = Vec::with_capacity(cc_range_count);
        for _ in 0..cc_range_count {
            let lo = rd_u32(&mut r)?;
            let hi = rd_u32(&mut r)?;
            let mut buf4 = [0u8; 4];
            r.read_exact(&mut buf4)?;
            ranges.push(CcRange {
                lo,
                hi,
                class_id: buf4[0],
            });
        }

        let cc = if cc_mode == CcMode::Ranges {
            CharClassifier::from_ranges(ranges, cc_fallback)?
        } else {
            CharClassifier {
                mode: cc_mode,
                fallback: cc_fallback,
                ranges,
            }
        };

        Ok(Model {
            crf: CrfParams {
                trans00,
                trans01,
                trans10,
                trans11,
                bos_to1,
                feat_key,
                feat_w,
            },
            lm: LangModel {
                da_base,
                da_check,
                logp_uni,
                bigram_key,
                logp_bi,
                unk_base,
                unk_per_cp,
            },
            lambda0,
            max_word_len: max_word_len as u16,
            flags,
            cc,
        })
    }

    /// ファイルにモデルを保存します。
    pub fn save<P>(&self, path: P) -> Result<()>
    where
        P: AsRef<Path>,
    {
        self.write(File::create(path)?)
    }

    /// ファイルからモデルを読み込みます。
    pub fn from_path<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        Self::read(File::open(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{feat_key, FLAG_CC_RANGES, FLAG_LOSSLESS_WS};
    use crate::trie::Trie;

    fn sample_model() -> Model {
        let mut t = Trie::new();
        t.set_term_value("a".as_bytes(), 0).unwrap();
        t.set_term_value("ab".as_bytes(), 1).unwrap();

        Model {
            crf: CrfParams {
                trans00: 51,
                trans01: -102,
                trans10: 0,
                trans11: -153,
                bos_to1: 128,
                feat_key: vec![feat_key(0, 1, 3, 0), feat_key(1, 1, 250, 0)],
                feat_w: vec![300, 512],
            },
            lm: LangModel {
                da_base: t.base().to_vec(),
                da_check: t.check().to_vec(),
                logp_uni: vec![-256, -312],
                bigram_key: vec![(0u32 << 16) | 1],
                logp_bi: vec![-40],
                unk_base: -1280,
                unk_per_cp: -256,
            },
            lambda0: 256,
            max_word_len: 8,
            flags: FLAG_LOSSLESS_WS | FLAG_CC_RANGES,
            cc: CharClassifier::from_ranges(
                vec![CcRange {
                    lo: 0x3040,
                    hi: 0x309F,
                    class_id: 4,
                }],
                CcMode::Utf8Len,
            )
            .unwrap(),
        }
    }

    #[test]
    fn test_v2_roundtrip() {
        let m = sample_model();
        let mut buf = vec![];
        m.write(&mut buf).unwrap();

        let r = Model::read(buf.as_slice()).unwrap();
        assert_eq!(r.crf.trans00, m.crf.trans00);
        assert_eq!(r.crf.trans01, m.crf.trans01);
        assert_eq!(r.crf.trans10, m.crf.trans10);
        assert_eq!(r.crf.trans11, m.crf.trans11);
        assert_eq!(r.crf.bos_to1, m.crf.bos_to1);
        assert_eq!(r.crf.feat_key, m.crf.feat_key);
        assert_eq!(r.crf.feat_w, m.crf.feat_w);
        assert_eq!(r.lm.da_base, m.lm.da_base);
        assert_eq!(r.lm.da_check, m.lm.da_check);
        assert_eq!(r.lm.logp_uni, m.lm.logp_uni);
        assert_eq!(r.lm.bigram_key, m.lm.bigram_key);
        assert_eq!(r.lm.logp_bi, m.lm.logp_bi);
        assert_eq!(r.lm.unk_base, m.lm.unk_base);
        assert_eq!(r.lm.unk_per_cp, m.lm.unk_per_cp);
        assert_eq!(r.lambda0, m.lambda0);
        assert_eq!(r.max_word_len, m.max_word_len);
        assert_eq!(r.flags, m.flags);
        assert_eq!(r.cc.mode, CcMode::Ranges);
        assert_eq!(r.cc.fallback, CcMode::Utf8Len);
        assert_eq!(r.cc.ranges, m.cc.ranges);
        // トライも引き続き機能する
        assert_eq!(r.lm.trie().get_term_value(b"ab"), Some(1));
    }

    #[test]
    fn test_header_layout_offsets() {
        let m = sample_model();
        let mut buf = vec![];
        m.write(&mut buf).unwrap();

        assert_eq!(&buf[0..8], b"MMJPv2\0\0");
        assert_eq!(u32::from_le_bytes(buf[8..12].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(buf[12..16].try_into().unwrap()), 4);
        // da_capacity / vocab / max_word_len
        let da_cap = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        assert_eq!(da_cap as usize, m.lm.da_base.len());
        assert_eq!(u32::from_le_bytes(buf[20..24].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(buf[24..28].try_into().unwrap()), 8);
        // Q8.8スカラー群
        assert_eq!(i16::from_le_bytes(buf[28..30].try_into().unwrap()), -1280);
        assert_eq!(i16::from_le_bytes(buf[30..32].try_into().unwrap()), -256);
        assert_eq!(i16::from_le_bytes(buf[32..34].try_into().unwrap()), 256);
        assert_eq!(i16::from_le_bytes(buf[34..36].try_into().unwrap()), 51);
        assert_eq!(i16::from_le_bytes(buf[42..44].try_into().unwrap()), 128);
        // feat_count / bigram_size / flags
        assert_eq!(u32::from_le_bytes(buf[44..48].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(buf[48..52].try_into().unwrap()), 1);
        assert_eq!(
            u32::from_le_bytes(buf[52..56].try_into().unwrap()),
            FLAG_LOSSLESS_WS | FLAG_CC_RANGES
        );
        // cc_mode / cc_fallback / padding / range_count
        assert_eq!(buf[56], 2);
        assert_eq!(buf[57], 1);
        assert_eq!(&buf[58..60], &[0, 0]);
        assert_eq!(u32::from_le_bytes(buf[60..64].try_into().unwrap()), 1);
        // 配列本体はオフセット64から
        let base0 = i32::from_le_bytes(buf[64..68].try_into().unwrap());
        assert_eq!(base0, m.lm.da_base[0]);
    }

    #[test]
    fn test_v1_load_defaults() {
        // v1ヘッダを手書きで構築（flags以降のフィールドを持たない）
        let mut buf = vec![];
        buf.extend_from_slice(b"MMJPv1\0\0");
        buf.extend_from_slice(&1u32.to_le_bytes()); // version
        buf.extend_from_slice(&4u32.to_le_bytes()); // da_index_bytes
        buf.extend_from_slice(&2u32.to_le_bytes()); // da_capacity
        buf.extend_from_slice(&1u32.to_le_bytes()); // vocab
        buf.extend_from_slice(&4u32.to_le_bytes()); // max_word_len
        for v in [-1280i16, -256, 256, 0, 0, 0, 0, 0] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&0u32.to_le_bytes()); // feat_count
        buf.extend_from_slice(&0u32.to_le_bytes()); // bigram_size
        // base/check (cap=2) + logp_uni (1)
        for v in [0i32, 1, 0, 1] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&(-100i16).to_le_bytes());

        let m = Model::read(buf.as_slice()).unwrap();
        assert_eq!(m.flags, 0);
        assert_eq!(m.cc.mode, CcMode::Utf8Len);
        assert_eq!(m.cc.fallback, CcMode::Ascii);
        assert!(m.cc.ranges.is_empty());
        assert_eq!(m.max_word_len, 4);
        assert_eq!(m.lm.logp_uni, vec![-100]);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let buf = b"NOTAMODL\0\0\0\0".to_vec();
        assert!(Model::read(buf.as_slice()).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        let m = sample_model();
        let mut buf = vec![];
        m.write(&mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(Model::read(buf.as_slice()).is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let m = sample_model();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        m.save(&path).unwrap();
        let r = Model::from_path(&path).unwrap();
        assert_eq!(r.lm.logp_uni, m.lm.logp_uni);
        assert_eq!(r.flags, m.flags);
    }
}
