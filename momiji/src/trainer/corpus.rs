//! 行単位のコーパスイテレータ
//!
//! EM学習は反復毎にコーパスを読み直すため、シーク可能なリーダの上に
//! 巻き戻し可能な行イテレータを提供します。低頻度文字をフォールバック
//! 文字に置換するマッピング（UniLM学習の安定化用）と、行長制限による
//! スキップもここで行います。

use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};

use hashbrown::{HashMap, HashSet};

use crate::errors::Result;
use crate::trainer::CorpusIter;
use crate::utf8;

/// 行末のCR・空白・タブを取り除きます。
pub fn trim_line(line: &mut Vec<u8>) {
    while let Some(&b) = line.last() {
        if b == b'\r' || b == b' ' || b == b'\t' {
            line.pop();
        } else {
            break;
        }
    }
}

/// 行スキップの統計
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipStats {
    /// バイト長制限でスキップした行数
    pub skipped_long_bytes: usize,
    /// コードポイント数制限でスキップした行数
    pub skipped_long_cp: usize,
}

/// ファイル（シーク可能なリーダ）上の行コーパス
///
/// 読み出した各行に対して次の処理を順に適用します:
///
/// 1. `max_line_bytes`を超える行は丸ごと破棄
/// 2. 行末のCR/空白/タブを除去
/// 3. `lossless_eol`が有効なら行末にメタLF（▃）を付加
/// 4. keep-charセットが設定されていれば、セット外・不正UTF-8・不正
///    スカラー値のコードポイントをフォールバック文字に置換し、
///    セット内の文字は正準形で再エンコード
/// 5. `max_sentence_cp`を超える行は丸ごと破棄
pub struct LineCorpus<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    mapped: Vec<u8>,

    max_line_bytes: usize,
    max_sentence_cp: usize,
    skip_long_cp: bool,
    append_eol: bool,

    keep_chars: Option<HashSet<u32>>,
    fallback_cp: u32,

    /// スキップ統計（反復毎に呼び出し側でリセット可能）
    pub stats: SkipStats,
}

impl<R> LineCorpus<R>
where
    R: Read + Seek,
{
    /// リーダから行コーパスを作成します。
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: vec![],
            mapped: vec![],
            max_line_bytes: 0,
            max_sentence_cp: 0,
            skip_long_cp: true,
            append_eol: false,
            keep_chars: None,
            fallback_cp: u32::from(b'?'),
            stats: SkipStats::default(),
        }
    }

    /// 行のバイト長上限を設定します（0 = 無制限）。
    pub fn max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit;
        self
    }

    /// 行のコードポイント数上限を設定します（0 = 無制限）。
    pub fn max_sentence_cp(mut self, limit: usize, skip_long: bool) -> Self {
        self.max_sentence_cp = limit;
        self.skip_long_cp = skip_long;
        self
    }

    /// 行末にメタLF（▃）を付加するかどうかを設定します。
    pub fn append_eol(mut self, enable: bool) -> Self {
        self.append_eol = enable;
        self
    }

    /// keep-charセットとフォールバック文字を設定します。
    ///
    /// セットが設定されると、以後の行はマッピングを通して返されます。
    pub fn set_keep_chars(&mut self, keep: HashSet<u32>, fallback_cp: u32) {
        self.keep_chars = Some(keep);
        self.fallback_cp = fallback_cp;
    }

    /// スキップ統計をリセットします。
    pub fn reset_stats(&mut self) {
        self.stats = SkipStats::default();
    }

    /// 1行読み出します。戻り値は「行があったかどうか」です。
    ///
    /// スキップされた行は`buf`/`mapped`が空のまま`true`を返します。
    fn read_line(&mut self) -> Result<bool> {
        self.buf.clear();
        self.mapped.clear();

        let n = self.reader.read_until(b'\n', &mut self.buf)?;
        if n == 0 {
            return Ok(false); // EOF
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
        }

        if self.max_line_bytes > 0 && self.buf.len() > self.max_line_bytes {
            self.buf.clear();
            self.stats.skipped_long_bytes += 1;
            return Ok(true);
        }

        trim_line(&mut self.buf);
        if self.buf.is_empty() {
            return Ok(true);
        }

        if self.append_eol {
            // ▃ (U+2583) = 0xE2 0x96 0x83
            self.buf.extend_from_slice(&[0xE2, 0x96, 0x83]);
        }

        if self.keep_chars.is_some() {
            if !self.map_line() {
                // コードポイント数制限超過
                self.buf.clear();
                self.mapped.clear();
                self.stats.skipped_long_cp += 1;
            }
        } else if self.skip_long_cp
            && self.max_sentence_cp > 0
            && utf8::count_codepoints(&self.buf) > self.max_sentence_cp
        {
            self.buf.clear();
            self.stats.skipped_long_cp += 1;
        }

        Ok(true)
    }

    /// keep-charマッピングを適用します。長さ超過なら`false`を返します。
    fn map_line(&mut self) -> bool {
        let keep = self.keep_chars.as_ref().expect("checked by caller");
        let mut enc = [0u8; 4];
        let fb_len = utf8::encode_cp(self.fallback_cp, &mut enc);
        let fb = [enc[0], enc[1], enc[2], enc[3]];

        self.mapped.clear();
        let mut pos = 0;
        let mut cp_count = 0usize;
        while pos < self.buf.len() {
            cp_count += 1;
            if self.skip_long_cp && self.max_sentence_cp > 0 && cp_count > self.max_sentence_cp {
                return false;
            }
            match utf8::decode_cp(&self.buf, pos) {
                Some((cp, adv)) => {
                    if keep.contains(&cp) {
                        // 正準UTF-8で再エンコード（オーバーロング排除）
                        let n = utf8::encode_cp(cp, &mut enc);
                        self.mapped.extend_from_slice(&enc[..n]);
                    } else {
                        self.mapped.extend_from_slice(&fb[..fb_len]);
                    }
                    pos += adv;
                }
                None => {
                    // 不正なバイト列は常にフォールバックに落とす
                    self.mapped.extend_from_slice(&fb[..fb_len]);
                    pos += 1;
                }
            }
        }
        true
    }
}

impl<R> CorpusIter for LineCorpus<R>
where
    R: Read + Seek,
{
    fn reset(&mut self) -> Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn next_sentence(&mut self) -> Result<Option<&[u8]>> {
        loop {
            if !self.read_line()? {
                return Ok(None);
            }
            if self.buf.is_empty() {
                continue; // 空行またはスキップされた行
            }
            if self.keep_chars.is_some() {
                if self.mapped.is_empty() {
                    continue;
                }
                return Ok(Some(&self.mapped));
            }
            return Ok(Some(&self.buf));
        }
    }
}

/// コーパス1パス目: コードポイント頻度を数えます。
///
/// 不正なバイト列は学習側ではraw byteとして扱わず、フォールバック文字に
/// 畳み込んで数えます。
pub fn count_codepoint_freqs(
    corpus: &mut dyn CorpusIter,
    fallback_cp: u32,
) -> Result<HashMap<u32, u64>> {
    let mut freqs = HashMap::new();
    corpus.reset()?;
    while let Some(sent) = corpus.next_sentence()? {
        let mut pos = 0;
        while pos < sent.len() {
            match utf8::decode_cp(sent, pos) {
                Some((cp, adv)) => {
                    *freqs.entry(cp).or_insert(0) += 1;
                    pos += adv;
                }
                None => {
                    *freqs.entry(fallback_cp).or_insert(0) += 1;
                    pos += 1;
                }
            }
        }
    }
    Ok(freqs)
}

/// 頻度マップからkeep-charセットを構築します。
///
/// フォールバック文字とASCII印字可能文字は常に保持し、残りを頻度順に
/// `char_vocab`まで追加します。改行・CR・タブは分かち書き対象に
/// しないため除外します。
pub fn build_keep_set(
    freqs: &HashMap<u32, u64>,
    char_vocab: usize,
    fallback_cp: u32,
) -> HashSet<u32> {
    let mut keep = HashSet::new();
    keep.insert(fallback_cp);
    // ASCII printableは常に保持（ログ/デバッグ/数値などで役立つ）
    for cp in 0x20..=0x7Eu32 {
        keep.insert(cp);
    }

    let mut pairs: Vec<(u32, u64)> = freqs
        .iter()
        .filter(|&(&cp, _)| cp != u32::from(b'\n') && cp != u32::from(b'\r') && cp != u32::from(b'\t'))
        .map(|(&cp, &cnt)| (cp, cnt))
        .collect();
    // 頻度降順、同数はコードポイント昇順で決定的に
    pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    for (cp, _) in pairs {
        if keep.len() >= char_vocab {
            break;
        }
        keep.insert(cp);
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_trim_line() {
        let mut l = b"abc \t\r".to_vec();
        trim_line(&mut l);
        assert_eq!(l, b"abc");
    }

    #[test]
    fn test_line_corpus_reset() {
        let data = "one\ntwo\n\nthree\n";
        let mut c = LineCorpus::new(Cursor::new(data.as_bytes().to_vec()));
        let mut collected = vec![];
        while let Some(s) = c.next_sentence().unwrap() {
            collected.push(s.to_vec());
        }
        assert_eq!(collected, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);

        c.reset().unwrap();
        assert_eq!(c.next_sentence().unwrap(), Some(&b"one"[..]));
    }

    #[test]
    fn test_line_corpus_skips_long_lines() {
        let data = "short\naveryveryverylongline\nok\n";
        let mut c = LineCorpus::new(Cursor::new(data.as_bytes().to_vec())).max_line_bytes(10);
        let mut collected = vec![];
        while let Some(s) = c.next_sentence().unwrap() {
            collected.push(s.to_vec());
        }
        assert_eq!(collected, vec![b"short".to_vec(), b"ok".to_vec()]);
        assert_eq!(c.stats.skipped_long_bytes, 1);
    }

    #[test]
    fn test_line_corpus_cp_limit() {
        let data = "abcdef\nab\n";
        let mut c =
            LineCorpus::new(Cursor::new(data.as_bytes().to_vec())).max_sentence_cp(3, true);
        let mut collected = vec![];
        while let Some(s) = c.next_sentence().unwrap() {
            collected.push(s.to_vec());
        }
        assert_eq!(collected, vec![b"ab".to_vec()]);
        assert_eq!(c.stats.skipped_long_cp, 1);
    }

    #[test]
    fn test_keep_char_mapping() {
        let data = "ab東x\n";
        let mut c = LineCorpus::new(Cursor::new(data.as_bytes().to_vec()));
        let mut keep = HashSet::new();
        keep.insert(u32::from(b'a'));
        keep.insert(u32::from(b'b'));
        keep.insert(u32::from(b'?'));
        c.set_keep_chars(keep, u32::from(b'?'));
        assert_eq!(c.next_sentence().unwrap(), Some(&b"ab??"[..]));
    }

    #[test]
    fn test_keep_char_mapping_invalid_bytes() {
        let mut data = b"a".to_vec();
        data.push(0xFF);
        data.push(b'\n');
        let mut c = LineCorpus::new(Cursor::new(data));
        let mut keep = HashSet::new();
        keep.insert(u32::from(b'a'));
        keep.insert(u32::from(b'?'));
        c.set_keep_chars(keep, u32::from(b'?'));
        assert_eq!(c.next_sentence().unwrap(), Some(&b"a?"[..]));
    }

    #[test]
    fn test_append_eol() {
        let data = "ab\n";
        let mut c = LineCorpus::new(Cursor::new(data.as_bytes().to_vec())).append_eol(true);
        let s = c.next_sentence().unwrap().unwrap();
        assert_eq!(s, "ab▃".as_bytes());
    }

    #[test]
    fn test_build_keep_set() {
        let mut freqs = HashMap::new();
        freqs.insert(0x6771, 100u64); // 東
        freqs.insert(0x4EAC, 50); // 京
        freqs.insert(0x90FD, 1); // 都
        freqs.insert(u32::from(b'\n'), 999);
        let keep = build_keep_set(&freqs, 97, u32::from(b'?'));
        // ASCII printable 95文字 + fallbackは既に含まれる + 上位2
        assert!(keep.contains(&0x6771));
        assert!(keep.contains(&0x4EAC));
        assert!(!keep.contains(&0x90FD));
        assert!(!keep.contains(&u32::from(b'\n')));
        assert!(keep.contains(&u32::from(b' ')));
        assert!(keep.contains(&u32::from(b'~')));
    }
}
