//! Error types for the training driver
//!
//! データ破損とチェックポイント異常はいずれも致命的エラーとして呼び出し元へ返す。

use std::path::PathBuf;

/// ブロック圧縮配列の展開エラー
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// deflate ストリームの展開に失敗
    #[error("failed to inflate block {block}: {source}")]
    Inflate {
        block: usize,
        #[source]
        source: std::io::Error,
    },

    /// 展開後のサイズが行数×幅と一致しない
    #[error("block {block} decoded to {actual} bytes, expected {expected}")]
    BlockSize {
        block: usize,
        expected: usize,
        actual: usize,
    },

    /// 位置ラベルが UTF-8 でない
    #[error("block {block} contains a non UTF-8 position label")]
    InvalidLabel { block: usize },
}

/// Training driver errors
#[derive(thiserror::Error, Debug)]
pub enum TrainError {
    /// 特徴量配列とラベル配列の展開結果が食い違った（データ破損）
    #[error(
        "inconsistency between decompressed arrays at cursor {cursor}: \
         features {feature_count}/{feature_end}, labels {label_count}/{label_end}"
    )]
    DecodeInconsistency {
        cursor: usize,
        feature_count: usize,
        label_count: usize,
        feature_end: bool,
        label_end: bool,
    },

    /// チェックポイントが存在しない
    #[error("checkpoint not found: {}", path.display())]
    CheckpointNotFound { path: PathBuf },

    /// チェックポイントが壊れている
    #[error("checkpoint {} is corrupt: {reason}", path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    /// ブロック展開エラー
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// データセットのバイナリ形式が不正
    #[error("invalid dataset: {0}")]
    DatasetFormat(String),

    /// 設定値が不正
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// モデルステップのワーカースレッドが panic した
    #[error("model step worker panicked")]
    WorkerPanicked,

    /// File I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for training operations
pub type TrainResult<T> = Result<T, TrainError>;
