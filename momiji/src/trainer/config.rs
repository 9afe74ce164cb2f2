//! CRF素性プリセットと設定ファイル
//!
//! 素性テーブルはテンプレート0〜4のキーを具象文字クラス集合の直積で
//! 展開した固定集合です。初期重みはごく少数の単項素性のみ非ゼロで、
//! 残りは教師あり学習（SGD/L-BFGS）または設定ファイルで与えます。
//!
//! 設定ファイルは空白に寛容なテキスト形式です:
//!
//! ```text
//! # コメント（; でも可）
//! trans00 = 0.2
//! bos_to1 = 0.5
//! feat 0 1 1 0 = 1.5
//! feat 3 1 250 6 0.8     # '=' は省略可
//! ```
//!
//! 未知の素性キーは警告して無視します。行の順序に意味はありません。

use std::io::{BufRead, BufReader, Read};

use log::warn;

use crate::charclass::{
    CC_ALPHA, CC_BOS, CC_DIGIT, CC_EOS, CC_FULLWIDTH, CC_HIRAGANA, CC_KANJI, CC_KATAKANA,
    CC_OTHER, CC_SPACE, CC_SYMBOL,
};
use crate::errors::Result;
use crate::model::feat_key;
use crate::trainer::crf::{CrfWeights, FeatureTable};

/// 現在位置に出現しうる具象クラス（BOS/EOSを除く）
const CUR_CLASSES: [u8; 9] = [
    CC_OTHER,
    CC_SPACE,
    CC_DIGIT,
    CC_ALPHA,
    CC_HIRAGANA,
    CC_KATAKANA,
    CC_KANJI,
    CC_FULLWIDTH,
    CC_SYMBOL,
];

/// 既定のCRF遷移重み
pub const DEFAULT_TRANS00: f64 = 0.2;
/// 既定のCRF遷移重み
pub const DEFAULT_TRANS01: f64 = -0.4;
/// 既定のCRF遷移重み
pub const DEFAULT_TRANS10: f64 = 0.0;
/// 既定のCRF遷移重み
pub const DEFAULT_TRANS11: f64 = -0.6;
/// 既定のBOS遷移重み
pub const DEFAULT_BOS_TO1: f64 = 0.5;

/// 基本素性テーブルを構築します。
///
/// クラス集合:
///
/// * cur: 具象クラス（BOS/EOSを除く）
/// * prev: BOS + 具象クラス
/// * next: 具象クラス + EOS
///
/// テンプレート0〜4 × ラベル0/1の全組み合わせをキー昇順で返します。
pub fn basic_feature_table() -> FeatureTable {
    let prev_classes: Vec<u8> = std::iter::once(CC_BOS).chain(CUR_CLASSES).collect();
    let next_classes: Vec<u8> = CUR_CLASSES.iter().copied().chain([CC_EOS]).collect();

    let mut keys = vec![];
    for label in 0..=1u8 {
        for &c in &CUR_CLASSES {
            keys.push(feat_key(0, label, c, 0));
        }
        for &p in &prev_classes {
            keys.push(feat_key(1, label, p, 0));
        }
        for &nx in &next_classes {
            keys.push(feat_key(2, label, nx, 0));
        }
        for &p in &prev_classes {
            for &c in &CUR_CLASSES {
                keys.push(feat_key(3, label, p, c));
            }
        }
        for &c in &CUR_CLASSES {
            for &nx in &next_classes {
                keys.push(feat_key(4, label, c, nx));
            }
        }
    }
    FeatureTable::new(keys)
}

/// 基本素性テーブルに対する初期重みを構築します。
///
/// 従来の小さなヒューリスティックを保つため、少数の単項素性にだけ
/// 非ゼロ重みを与えます。残りは0で、学習または設定で上書きします。
pub fn basic_initial_weights(tbl: &FeatureTable) -> CrfWeights {
    let mut w = CrfWeights::zeros(tbl.len());
    w.trans00 = DEFAULT_TRANS00;
    w.trans01 = DEFAULT_TRANS01;
    w.trans10 = DEFAULT_TRANS10;
    w.trans11 = DEFAULT_TRANS11;
    w.bos_to1 = DEFAULT_BOS_TO1;

    let init: [(u8, u8, u8, u8, f64); 15] = [
        // 前クラス -> 開始
        (1, 1, CC_BOS, 0, 2.0),
        (1, 1, CC_SPACE, 0, 1.5),
        (1, 1, CC_SYMBOL, 0, 1.2),
        (1, 1, CC_FULLWIDTH, 0, 1.2),
        // 現クラス -> 開始
        (0, 1, CC_SPACE, 0, 1.5),
        (0, 1, CC_SYMBOL, 0, 1.5),
        (0, 1, CC_FULLWIDTH, 0, 1.5),
        // 現クラス -> 内部
        (0, 0, CC_SPACE, 0, -2.0),
        (0, 0, CC_SYMBOL, 0, -2.0),
        (0, 0, CC_FULLWIDTH, 0, -2.0),
        (0, 0, CC_KANJI, 0, 0.4),
        (0, 0, CC_KATAKANA, 0, 0.4),
        (0, 0, CC_ALPHA, 0, 0.2),
        (0, 0, CC_DIGIT, 0, 0.2),
        (0, 0, CC_HIRAGANA, 0, 0.1),
    ];
    for &(tid, label, v1, v2, weight) in &init {
        if let Some(i) = tbl.find(feat_key(tid, label, v1, v2)) {
            w.feat_w[i] = weight;
        }
    }
    w
}

/// CRF設定ファイルを読み込み、重みを上書きします。
///
/// 認識される形式:
///
/// * `trans00 = <float>`（trans01, trans10, trans11, bos_to1も同様）
/// * `feat <tid> <label> <v1> <v2> = <weight>`（`=`は省略可）
///
/// 未知の素性キーは警告して無視し、解釈できない行も警告して読み飛ばします。
pub fn apply_config_reader<R>(
    rdr: R,
    tbl: &FeatureTable,
    weights: &mut CrfWeights,
) -> Result<()>
where
    R: Read,
{
    let reader = BufReader::new(rdr);
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        // '='は空白と同様に扱う（"trans00=0.2" と "trans00 = 0.2" の両対応）
        let normalized = trimmed.replace('=', " ");
        let tokens: Vec<&str> = normalized.split_whitespace().collect();

        let parsed = match tokens.as_slice() {
            [name, value] => match value.parse::<f64>() {
                Ok(v) => {
                    let slot = match *name {
                        "trans00" => Some(&mut weights.trans00),
                        "trans01" => Some(&mut weights.trans01),
                        "trans10" => Some(&mut weights.trans10),
                        "trans11" => Some(&mut weights.trans11),
                        "bos_to1" => Some(&mut weights.bos_to1),
                        _ => None,
                    };
                    match slot {
                        Some(s) => {
                            *s = v;
                            true
                        }
                        None => false,
                    }
                }
                Err(_) => false,
            },
            ["feat", tid, label, v1, v2, value] => {
                let parsed = (
                    tid.parse::<u8>(),
                    label.parse::<u8>(),
                    v1.parse::<u8>(),
                    v2.parse::<u8>(),
                    value.parse::<f64>(),
                );
                if let (Ok(tid), Ok(label), Ok(v1), Ok(v2), Ok(v)) = parsed {
                    let key = feat_key(tid, label, v1, v2);
                    match tbl.find(key) {
                        Some(i) => {
                            weights.feat_w[i] = v;
                        }
                        None => {
                            warn!(
                                "crf config: unknown feature (tid={tid} label={label} v1={v1} v2={v2})"
                            );
                        }
                    }
                    true
                } else {
                    false
                }
            }
            _ => false,
        };

        if !parsed {
            warn!("crf config: ignored line: {trimmed}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_table_sorted_and_complete() {
        let tbl = basic_feature_table();
        // 2 * (9 + 10 + 10) + 2 * (10*9) + 2 * (9*10) = 418
        assert_eq!(tbl.len(), 418);
        for w in tbl.keys().windows(2) {
            assert!(w[0] < w[1]);
        }
        // 代表的なキーの存在
        assert!(tbl.find(feat_key(0, 1, CC_KANJI, 0)).is_some());
        assert!(tbl.find(feat_key(1, 0, CC_BOS, 0)).is_some());
        assert!(tbl.find(feat_key(2, 1, CC_EOS, 0)).is_some());
        assert!(tbl.find(feat_key(3, 0, CC_BOS, CC_KANJI)).is_some());
        assert!(tbl.find(feat_key(4, 1, CC_KANJI, CC_EOS)).is_some());
        // テンプレートに存在しない組み合わせ
        assert!(tbl.find(feat_key(3, 0, CC_EOS, CC_KANJI)).is_none());
    }

    #[test]
    fn test_initial_weights() {
        let tbl = basic_feature_table();
        let w = basic_initial_weights(&tbl);
        assert_eq!(w.trans00, DEFAULT_TRANS00);
        assert_eq!(w.bos_to1, DEFAULT_BOS_TO1);
        let i = tbl.find(feat_key(1, 1, CC_BOS, 0)).unwrap();
        assert_eq!(w.feat_w[i], 2.0);
        let j = tbl.find(feat_key(0, 0, CC_SPACE, 0)).unwrap();
        assert_eq!(w.feat_w[j], -2.0);
    }

    #[test]
    fn test_apply_config() {
        let tbl = basic_feature_table();
        let mut w = basic_initial_weights(&tbl);
        let cfg = "# comment\n; also comment\ntrans00 = 0.9\ntrans11=-1.25\n\
                   feat 0 1 1 0 = 3.5\nfeat 2 0 251 0 1.5\nbos_to1 = 0.125\n";
        apply_config_reader(cfg.as_bytes(), &tbl, &mut w).unwrap();
        assert_eq!(w.trans00, 0.9);
        assert_eq!(w.trans11, -1.25);
        assert_eq!(w.bos_to1, 0.125);
        let i = tbl.find(feat_key(0, 1, CC_SPACE, 0)).unwrap();
        assert_eq!(w.feat_w[i], 3.5);
        let j = tbl.find(feat_key(2, 0, CC_EOS, 0)).unwrap();
        assert_eq!(w.feat_w[j], 1.5);
    }

    #[test]
    fn test_apply_config_ignores_unknown() {
        let tbl = basic_feature_table();
        let mut w = basic_initial_weights(&tbl);
        let before = w.feat_w.clone();
        // 未知キーと不正行は無視される
        let cfg = "feat 7 1 1 0 = 3.5\nnonsense line\ntrans99 = 1.0\n";
        apply_config_reader(cfg.as_bytes(), &tbl, &mut w).unwrap();
        assert_eq!(w.feat_w, before);
    }
}
