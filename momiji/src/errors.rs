//! エラー型の定義
//!
//! このモジュールは、Momijiライブラリで使用されるすべてのエラー型を定義します。

use std::error::Error;
use std::fmt;

/// Momiji専用のResult型
///
/// エラー型としてデフォルトで[`MomijiError`]を使用します。
pub type Result<T, E = MomijiError> = std::result::Result<T, E>;

/// Momijiのエラー型
///
/// このライブラリで発生する可能性のあるすべてのエラーを表現します。
#[derive(Debug, thiserror::Error)]
pub enum MomijiError {
    /// 無効な引数エラー
    ///
    /// [`InvalidArgumentError`]のエラーバリアント。
    #[error(transparent)]
    InvalidArgument(InvalidArgumentError),

    /// 無効なフォーマットエラー
    ///
    /// モデルファイルや設定ファイルの内容が不正な場合に発生します。
    #[error(transparent)]
    InvalidFormat(InvalidFormatError),

    /// 内部状態の不整合エラー
    ///
    /// バックポインタ破損やトライ不整合など、本来到達しない状態を表します。
    #[error(transparent)]
    InvalidState(InvalidStateError),

    /// 無効なUTF-8入力
    ///
    /// 入力バイト列が正準UTF-8として解釈できない場合に発生します。
    #[error("InvalidUtf8Error: invalid UTF-8 sequence at byte {offset}")]
    InvalidUtf8 {
        /// 解釈に失敗したバイト位置
        offset: usize,
    },

    /// 語彙で入力をカバーできないエラー
    ///
    /// 最大単語長の範囲で終端状態に到達できない場合（デコード）、
    /// または文の分配関数がゼロになる場合（E-step）に発生します。
    #[error("NoCoverError: {0}")]
    NoCover(String),

    /// ワークスペース/出力バッファ不足
    ///
    /// この入力に対して作業領域または出力バッファが小さすぎる場合に発生します。
    #[error("WorkspaceTooSmallError: {msg}: required {required}")]
    WorkspaceTooSmall {
        /// 不足した領域の説明
        msg: &'static str,
        /// 必要な要素数
        required: usize,
    },

    /// 静的容量の枯渇
    ///
    /// トライのbase探索範囲や語彙容量が尽きた場合に発生します。
    #[error("CapacityError: {0}")]
    CapacityExceeded(&'static str),

    /// I/Oエラー
    ///
    /// [`std::io::Error`]のエラーバリアント。
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MomijiError {
    /// 無効な引数エラーを生成します
    ///
    /// # 引数
    ///
    /// * `arg` - 引数の名前
    /// * `msg` - エラーメッセージ
    pub(crate) fn invalid_argument<S>(arg: &'static str, msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::InvalidArgument(InvalidArgumentError {
            arg,
            msg: msg.into(),
        })
    }

    /// 無効なフォーマットエラーを生成します
    pub(crate) fn invalid_format<S>(arg: &'static str, msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::InvalidFormat(InvalidFormatError {
            arg,
            msg: msg.into(),
        })
    }

    /// 内部状態エラーを生成します
    pub(crate) fn invalid_state<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::InvalidState(InvalidStateError { msg: msg.into() })
    }
}

/// 引数が無効な場合に使用されるエラー
#[derive(Debug)]
pub struct InvalidArgumentError {
    /// 引数の名前
    pub(crate) arg: &'static str,

    /// エラーメッセージ
    pub(crate) msg: String,
}

impl fmt::Display for InvalidArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InvalidArgumentError: {}: {}", self.arg, self.msg)
    }
}

impl Error for InvalidArgumentError {}

/// 入力フォーマットが無効な場合に使用されるエラー
#[derive(Debug)]
pub struct InvalidFormatError {
    /// フォーマットの名前
    pub(crate) arg: &'static str,

    /// エラーメッセージ
    pub(crate) msg: String,
}

impl fmt::Display for InvalidFormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InvalidFormatError: {}: {}", self.arg, self.msg)
    }
}

impl Error for InvalidFormatError {}

/// 内部状態が無効な場合に使用されるエラー
#[derive(Debug)]
pub struct InvalidStateError {
    /// エラーメッセージ
    pub(crate) msg: String,
}

impl fmt::Display for InvalidStateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InvalidStateError: {}", self.msg)
    }
}

impl Error for InvalidStateError {}
