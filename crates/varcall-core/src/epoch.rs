//! Epoch Controller
//!
//! データセットを先頭の学習区間と末尾の検証区間に分け、プリフェッチ付きで
//! バッチを回しながら損失を集計する。データセット末尾に達したらエポック終了処理
//! （追加検証・ログ・履歴追加・チェックポイント・減衰判定）を行い、次のエポックへ進む。
//!
//! # バッチサイズ規則
//! 判定には「現バッチの直後のカーソル」（次の展開開始位置）を使う。
//! - 学習区間: `train_batch_size`。ただし検証境界をまたがないよう最後のバッチは短くする
//! - 検証区間: `predict_batch_size`。カーソルが倍数でなければ次の倍数まで短くする

use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;

use crate::checkpoint::CheckpointManager;
use crate::error::TrainResult;
use crate::logging::StructuredLogger;
use crate::model::Model;
use crate::prefetch::{PrefetchPipeline, StepKind, StepLoss};
use crate::schedule::{AdaptiveSchedule, ScheduleDecision};

/// 学習・検証区間の分割
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    pub total: usize,
    pub training_count: usize,
    /// 検証区間の先頭カーソル
    pub validation_start: usize,
    pub validation_count: usize,
}

impl Split {
    /// `training_count = floor(total * fraction)`
    pub fn new(total: usize, training_fraction: f64) -> Self {
        let training_count = ((total as f64 * training_fraction).floor() as usize).min(total);
        Self {
            total,
            training_count,
            validation_start: training_count,
            validation_count: total - training_count,
        }
    }

    #[inline]
    pub fn is_training(&self, cursor: usize) -> bool {
        cursor < self.validation_start
    }

    /// 1エポックで学習ステップに回る件数
    ///
    /// 種別は現バッチ直後のカーソルで決まるため、学習区間の最後のバッチは
    /// 検証として評価される。
    pub fn trained_examples(&self, train_batch_size: usize) -> usize {
        if self.training_count == 0 || train_batch_size == 0 {
            return 0;
        }
        let last = match self.training_count % train_batch_size {
            0 => train_batch_size,
            rest => rest,
        };
        self.training_count - last
    }
}

/// `cursor` から展開する次バッチのサイズ
pub fn next_batch_size(
    cursor: usize,
    split: &Split,
    train_batch_size: usize,
    predict_batch_size: usize,
) -> usize {
    if split.is_training(cursor) {
        (split.validation_start - cursor).min(train_batch_size)
    } else if cursor % predict_batch_size != 0 {
        predict_batch_size - cursor % predict_batch_size
    } else {
        predict_batch_size
    }
}

/// エポック毎の検証損失
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValidationRecord {
    /// 検証損失の総和
    pub loss_sum: f64,
    pub epoch: usize,
}

/// エポック内の状態（エポック番号以外は毎エポック初期化）
#[derive(Debug, Clone)]
pub struct RunState {
    /// 次の展開開始位置
    pub cursor: usize,
    pub batch_size: usize,
    pub epoch: usize,
    pub train_loss_sum: f64,
    pub validation_loss_sum: f64,
    pub epoch_start: Instant,
}

impl RunState {
    pub fn new(epoch: usize, batch_size: usize) -> Self {
        Self {
            cursor: 0,
            batch_size,
            epoch,
            train_loss_sum: 0.0,
            validation_loss_sum: 0.0,
            epoch_start: Instant::now(),
        }
    }

    fn reset(&mut self, epoch: usize, batch_size: usize) {
        *self = Self::new(epoch, batch_size);
    }
}

/// 学習ループの終了理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// エポック上限に到達
    MaxEpoch,
    /// 減衰回数を使い切った
    DecayBudgetExhausted,
}

/// 学習ループの結果
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub history: Vec<ValidationRecord>,
    pub stop_reason: StopReason,
    pub decays_applied: u32,
    pub elapsed: Duration,
}

impl TrainingOutcome {
    /// 検証損失が最小のエポック（同値なら若いエポック）
    pub fn best(&self) -> Option<ValidationRecord> {
        let mut sorted = self.history.clone();
        sorted.sort_by(|a, b| a.loss_sum.total_cmp(&b.loss_sum).then(a.epoch.cmp(&b.epoch)));
        sorted.first().copied()
    }

    /// 最後に完了したエポック
    pub fn last_epoch(&self) -> Option<usize> {
        self.history.last().map(|r| r.epoch)
    }
}

/// ループ制御の設定値
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSettings {
    pub train_batch_size: usize,
    pub predict_batch_size: usize,
    /// この値未満のエポックのみ実行
    pub max_epoch: usize,
    pub max_decays: u32,
    /// 初期学習率
    pub learning_rate: f64,
    /// 初期正則化係数
    pub regularization_weight: f64,
}

fn average(sum: f64, count: usize) -> f64 {
    if count == 0 { 0.0 } else { sum / count as f64 }
}

/// Epoch Controller
pub struct EpochController<'a, M: Model> {
    model: &'a mut M,
    pipeline: PrefetchPipeline<'a>,
    split: Split,
    settings: EpochSettings,
    schedule: AdaptiveSchedule,
    checkpoints: Option<CheckpointManager>,
    summary: Option<&'a StructuredLogger>,
    history: Vec<ValidationRecord>,
    learning_rate: f64,
    regularization_weight: f64,
}

impl<'a, M: Model> EpochController<'a, M> {
    pub fn new(
        model: &'a mut M,
        pipeline: PrefetchPipeline<'a>,
        split: Split,
        settings: EpochSettings,
    ) -> Self {
        let learning_rate = model.set_learning_rate(Some(settings.learning_rate));
        let regularization_weight =
            model.set_regularization_weight(Some(settings.regularization_weight));
        Self {
            model,
            pipeline,
            split,
            settings,
            schedule: AdaptiveSchedule::new(settings.max_decays),
            checkpoints: None,
            summary: None,
            history: Vec::new(),
            learning_rate,
            regularization_weight,
        }
    }

    /// エポック終了毎にチェックポイントを保存する
    pub fn with_checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    /// JSONL サマリを出力する
    pub fn with_summary(mut self, logger: &'a StructuredLogger) -> Self {
        self.summary = Some(logger);
        self
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn regularization_weight(&self) -> f64 {
        self.regularization_weight
    }

    /// `start_epoch` から学習ループを回す
    pub fn run(&mut self, start_epoch: usize) -> TrainResult<TrainingOutcome> {
        let training_start = Instant::now();
        let mut stop_reason = StopReason::MaxEpoch;
        let settings = self.settings;

        if start_epoch >= settings.max_epoch {
            log::warn!(
                "start epoch {start_epoch} is not below max_epoch {}, skipping training",
                settings.max_epoch
            );
        }

        let first_batch_size = next_batch_size(
            0,
            &self.split,
            settings.train_batch_size,
            settings.predict_batch_size,
        );
        if self.split.training_count > 0
            && self.split.trained_examples(settings.train_batch_size) == 0
        {
            log::warn!(
                "train_batch_size {} covers the whole training range ({} examples); \
                 no training step will run",
                settings.train_batch_size,
                self.split.training_count
            );
        }

        let mut state = RunState::new(start_epoch, first_batch_size);
        let mut current = self.pipeline.prime(state.cursor, state.batch_size)?;
        state.cursor += current.count;

        while state.epoch < settings.max_epoch {
            let kind = if self.split.is_training(state.cursor) {
                StepKind::Train
            } else {
                StepKind::Validate
            };
            state.batch_size = next_batch_size(
                state.cursor,
                &self.split,
                settings.train_batch_size,
                settings.predict_batch_size,
            );

            let step =
                self.pipeline.step(&mut *self.model, &current, kind, state.cursor, state.batch_size)?;
            log::debug!(
                "epoch {} cursor {}: {:?} on {} examples, waited {:?}",
                state.epoch,
                state.cursor,
                kind,
                current.count,
                step.wait
            );
            match &step.loss {
                StepLoss::Train(out) => {
                    state.train_loss_sum += out.loss;
                    if let Some(logger) = self.summary {
                        let mut fields = serde_json::to_value(&out.summary)?;
                        fields["epoch"] = json!(state.epoch);
                        logger.event("train_step", fields);
                    }
                }
                StepLoss::Validation(loss) => state.validation_loss_sum += loss,
            }
            state.cursor += step.next.count;
            current = step.next;

            if current.reached_end {
                // 末尾に残ったバッチも検証損失に加える
                state.validation_loss_sum += self.model.validation_loss(&current);
                if self.finish_epoch(&state)? == ScheduleDecision::Exhausted {
                    stop_reason = StopReason::DecayBudgetExhausted;
                    break;
                }
                state.reset(state.epoch + 1, first_batch_size);
                current = self.pipeline.prime(state.cursor, state.batch_size)?;
                state.cursor += current.count;
            }
        }

        let elapsed = training_start.elapsed();
        log::info!("Training time elapsed: {:.2} s", elapsed.as_secs_f64());
        if let Some(logger) = self.summary {
            logger.event(
                "finished",
                json!({
                    "stop_reason": stop_reason,
                    "epochs": self.history.len(),
                    "decays_applied": self.schedule.decays_applied(),
                    "elapsed_sec": elapsed.as_secs_f64(),
                }),
            );
        }
        Ok(TrainingOutcome {
            history: self.history.clone(),
            stop_reason,
            decays_applied: self.schedule.decays_applied(),
            elapsed,
        })
    }

    /// エポック終了処理
    fn finish_epoch(&mut self, state: &RunState) -> TrainResult<ScheduleDecision> {
        let train_loss = average(state.train_loss_sum, self.split.training_count);
        let validation_loss = average(state.validation_loss_sum, self.split.validation_count);
        let elapsed = state.epoch_start.elapsed().as_secs_f64();
        log::info!(
            "{} Training loss: {} Validation loss: {}",
            state.epoch,
            train_loss,
            validation_loss
        );
        log::info!("Epoch time elapsed: {elapsed:.2} s");

        let record = ValidationRecord {
            loss_sum: state.validation_loss_sum,
            epoch: state.epoch,
        };
        self.history.push(record);
        if let Some(logger) = self.summary {
            let mut fields = serde_json::to_value(record)?;
            fields["train_loss"] = json!(train_loss);
            fields["validation_loss"] = json!(validation_loss);
            fields["elapsed_sec"] = json!(elapsed);
            logger.event("epoch", fields);
        }

        if let Some(manager) = &self.checkpoints {
            manager.save(&*self.model, state.epoch, self.learning_rate, self.regularization_weight)?;
        }

        let decision = self.schedule.on_epoch_done(&self.history);
        match decision {
            ScheduleDecision::Continue => {}
            ScheduleDecision::Decay => {
                self.learning_rate = self.model.set_learning_rate(None);
                self.regularization_weight = self.model.set_regularization_weight(None);
                log::info!("New learning rate: {:.2e}", self.learning_rate);
                log::info!("New L2 regularization lambda: {:.2e}", self.regularization_weight);
                if let Some(logger) = self.summary {
                    logger.event(
                        "decay",
                        json!({
                            "epoch": state.epoch,
                            "learning_rate": self.learning_rate,
                            "regularization_weight": self.regularization_weight,
                            "remaining": self.schedule.remaining(),
                        }),
                    );
                }
            }
            ScheduleDecision::Exhausted => {
                log::info!("Learning rate decay budget exhausted at epoch {}", state.epoch);
            }
        }
        Ok(decision)
    }
}
