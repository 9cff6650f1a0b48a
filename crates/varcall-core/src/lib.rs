//! # varcall-core
//!
//! 多ヘッドのバリアントコール分類器を学習させるためのドライバ。
//!
//! ## モジュール構成
//!
//! - `codec` / `dataset`: ブロック圧縮配列とデータセットのバイナリ形式
//! - `source`: カーソル位置からのバッチ展開（Batch Source）
//! - `prefetch`: 次バッチ展開とモデルステップを重ねる2段パイプライン
//! - `epoch`: 学習/検証区間の分割とエポックループ
//! - `schedule`: 検証損失のジグザグ検出による学習率減衰
//! - `checkpoint`: エポック番号付きチェックポイントの保存と復元
//! - `eval`: 全件推論による精度・混同行列の集計
//! - `model`: モデル契約と参照実装
//! - `driver`: 上記をつなぐ学習・評価の入口

pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod dataset;
pub mod driver;
pub mod epoch;
pub mod error;
pub mod eval;
pub mod logging;
pub mod model;
pub mod prefetch;
pub mod schedule;
pub mod source;

pub use config::TrainConfig;
pub use dataset::Dataset;
pub use driver::{TrainingRun, train_and_evaluate};
pub use error::{CodecError, TrainError, TrainResult};
pub use model::{Model, SoftmaxHeads};
