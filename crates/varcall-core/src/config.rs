//! 学習設定
//!
//! TOML ファイルから読み込み、CLI 側で個別に上書きする。

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};

/// 学習設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    /// 初期学習率
    pub learning_rate: f64,
    /// 初期 L2 正則化係数
    pub regularization_weight: f64,
    /// 学習フェーズのバッチサイズ
    pub train_batch_size: usize,
    /// 検証・推論フェーズのバッチサイズ
    pub predict_batch_size: usize,
    /// エポック番号の上限（この値未満のエポックのみ実行）
    pub max_epoch: usize,
    /// 学習率減衰の最大回数
    pub max_decays: u32,
    /// 学習に使う先頭側の割合
    pub training_fraction: f64,
    /// チェックポイント名のエポック桁数
    pub checkpoint_width: usize,
    /// 減衰時に学習率・正則化係数へ掛ける倍率（参照モデル用）
    pub decay_factor: f64,
    /// モデル初期化のシード値
    pub seed: u64,
    /// 再開元チェックポイント
    pub resume_from: Option<PathBuf>,
    /// チェックポイント出力のプレフィックス
    pub checkpoint_prefix: Option<PathBuf>,
    /// 学習ステップ毎の JSONL サマリ出力先（"-" で stdout）
    pub summary_log: Option<String>,
    /// 評価レポートの JSON 出力先
    pub report_json: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            regularization_weight: 5e-3,
            train_batch_size: 10_000,
            predict_batch_size: 10_000,
            max_epoch: 10_000,
            max_decays: 3,
            training_fraction: 0.9,
            checkpoint_width: 6,
            decay_factor: 0.5,
            seed: 42,
            resume_from: None,
            checkpoint_prefix: None,
            summary_log: None,
            report_json: None,
        }
    }
}

impl TrainConfig {
    /// TOML ファイルから読み込む（未指定キーはデフォルト値）
    pub fn load<P: AsRef<Path>>(path: P) -> TrainResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| TrainError::InvalidConfig(format!("{}: {e}", path.display())))
    }

    /// TOML 文字列から読み込む
    pub fn from_toml_str(text: &str) -> TrainResult<Self> {
        toml::from_str(text).map_err(|e| TrainError::InvalidConfig(e.to_string()))
    }

    /// 値の整合性を検証
    pub fn validate(&self) -> TrainResult<()> {
        if self.train_batch_size == 0 || self.predict_batch_size == 0 {
            return Err(TrainError::InvalidConfig("batch sizes must be positive".to_string()));
        }
        if !(self.training_fraction > 0.0 && self.training_fraction <= 1.0) {
            return Err(TrainError::InvalidConfig(format!(
                "training_fraction must be in (0, 1], got {}",
                self.training_fraction
            )));
        }
        if self.max_epoch == 0 {
            return Err(TrainError::InvalidConfig("max_epoch must be positive".to_string()));
        }
        if self.max_decays == 0 {
            return Err(TrainError::InvalidConfig("max_decays must be at least 1".to_string()));
        }
        if self.checkpoint_width == 0 {
            return Err(TrainError::InvalidConfig("checkpoint_width must be positive".to_string()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(TrainError::InvalidConfig(format!(
                "learning_rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        if !self.regularization_weight.is_finite() || self.regularization_weight < 0.0 {
            return Err(TrainError::InvalidConfig(format!(
                "regularization_weight must be non-negative, got {}",
                self.regularization_weight
            )));
        }
        if !(self.decay_factor > 0.0 && self.decay_factor <= 1.0) {
            return Err(TrainError::InvalidConfig(format!(
                "decay_factor must be in (0, 1], got {}",
                self.decay_factor
            )));
        }
        Ok(())
    }
}
