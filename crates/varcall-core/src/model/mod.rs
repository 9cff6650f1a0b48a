//! モデル契約
//!
//! 学習ドライバはモデルの内部構造に依存せず、この trait 越しにのみ操作する。
//!
//! # 構成
//! - `Model`: 学習・検証損失・推論・ハイパーパラメータ・保存/復元の契約
//! - `Head`: 4つの出力ヘッドとラベル列の対応
//! - `softmax`: 契約を満たす参照実装（線形 + ヘッド毎 softmax）

pub mod softmax;

use std::ops::Range;
use std::path::Path;

use serde::Serialize;

use crate::error::TrainResult;
use crate::source::{Batch, Matrix};

pub use softmax::SoftmaxHeads;

/// ラベル1件あたりの列数（4 + 2 + 4 + 6）
pub const LABEL_WIDTH: usize = 16;

/// 出力ヘッド
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Head {
    /// 塩基置換の分布
    Base,
    /// 接合性の分布
    Zygosity,
    /// バリアント種別の分布
    VariantType,
    /// indel 長の分布
    IndelLength,
}

impl Head {
    pub const ALL: [Head; 4] = [Head::Base, Head::Zygosity, Head::VariantType, Head::IndelLength];

    /// クラス数
    pub const fn classes(self) -> usize {
        match self {
            Head::Base => 4,
            Head::Zygosity => 2,
            Head::VariantType => 4,
            Head::IndelLength => 6,
        }
    }

    /// ラベル行の中でこのヘッドが占める列範囲
    pub const fn label_range(self) -> Range<usize> {
        match self {
            Head::Base => 0..4,
            Head::Zygosity => 4..6,
            Head::VariantType => 6..10,
            Head::IndelLength => 10..16,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Head::Base => "base change",
            Head::Zygosity => "zygosity",
            Head::VariantType => "variant type",
            Head::IndelLength => "indel length",
        }
    }
}

/// 4ヘッド分の推論結果（行は入力と同順）
#[derive(Debug, Clone, PartialEq)]
pub struct HeadOutputs {
    pub base: Matrix,
    pub zygosity: Matrix,
    pub variant_type: Matrix,
    pub indel_length: Matrix,
}

impl HeadOutputs {
    pub fn empty() -> Self {
        Self {
            base: Matrix::empty(Head::Base.classes()),
            zygosity: Matrix::empty(Head::Zygosity.classes()),
            variant_type: Matrix::empty(Head::VariantType.classes()),
            indel_length: Matrix::empty(Head::IndelLength.classes()),
        }
    }

    /// 件数
    pub fn len(&self) -> usize {
        self.base.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn head(&self, head: Head) -> &Matrix {
        match head {
            Head::Base => &self.base,
            Head::Zygosity => &self.zygosity,
            Head::VariantType => &self.variant_type,
            Head::IndelLength => &self.indel_length,
        }
    }

    /// 別バッチの結果を末尾に連結
    pub fn append(&mut self, other: &HeadOutputs) {
        self.base.extend_rows(&other.base);
        self.zygosity.extend_rows(&other.zygosity);
        self.variant_type.extend_rows(&other.variant_type);
        self.indel_length.extend_rows(&other.indel_length);
    }
}

/// 学習ステップのサマリ（構造化ログへ出力する）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSummary {
    pub examples: usize,
    pub loss: f64,
    pub learning_rate: f64,
    pub regularization_weight: f64,
}

/// 学習ステップの結果
#[derive(Debug, Clone, PartialEq)]
pub struct TrainStepOutput {
    /// バッチ内の損失の総和
    pub loss: f64,
    pub summary: StepSummary,
}

/// モデル契約
///
/// 1回の学習につき1インスタンスをドライバが排他的に所有する。
/// 学習・検証ステップはワーカースレッドで実行されるため `Send` が必要。
pub trait Model: Send {
    /// 1バッチで学習し、損失の総和を返す
    fn train_step(&mut self, batch: &Batch) -> TrainStepOutput;

    /// 1バッチの検証損失の総和
    fn validation_loss(&self, batch: &Batch) -> f64;

    /// 推論
    fn predict(&self, features: &Matrix) -> HeadOutputs;

    /// 学習率を設定して現在値を返す（`None` の場合はモデル自身の方針で減衰）
    fn set_learning_rate(&mut self, value: Option<f64>) -> f64;

    /// 正則化係数を設定して現在値を返す（`None` の場合はモデル自身の方針で減衰）
    fn set_regularization_weight(&mut self, value: Option<f64>) -> f64;

    /// パラメータを保存
    fn save_parameters(&self, path: &Path) -> TrainResult<()>;

    /// パラメータを復元
    fn restore_parameters(&mut self, path: &Path) -> TrainResult<()>;
}
