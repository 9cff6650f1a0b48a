//! 学習ドライバ
//!
//! 設定検証 → チェックポイント復元 → 学習ループ → 最良エポック報告 → 全件評価 を順に行う。

use std::path::PathBuf;

use crate::checkpoint::{self, CheckpointManager, ResumePoint};
use crate::config::TrainConfig;
use crate::dataset::Dataset;
use crate::epoch::{EpochController, EpochSettings, Split, TrainingOutcome};
use crate::error::TrainResult;
use crate::eval::{self, EvaluationReport};
use crate::logging::StructuredLogger;
use crate::model::Model;
use crate::prefetch::PrefetchPipeline;
use crate::source::BatchSource;

/// 1回の学習の結果
#[derive(Debug, Clone)]
pub struct TrainingRun {
    pub outcome: TrainingOutcome,
    pub report: EvaluationReport,
    pub resumed_from: Option<ResumePoint>,
    /// 最後に保存したチェックポイント
    pub last_checkpoint: Option<PathBuf>,
}

/// 学習して評価する
pub fn train_and_evaluate<M: Model>(
    config: &TrainConfig,
    dataset: &Dataset,
    model: &mut M,
) -> TrainResult<TrainingRun> {
    config.validate()?;

    let resumed_from = match &config.resume_from {
        Some(path) => {
            let resume = checkpoint::restore(model, path, config.checkpoint_width)?;
            if let Some(meta) = &resume.meta {
                log::info!(
                    "Checkpoint was saved with learning rate {:.2e}, L2 lambda {:.2e}",
                    meta.learning_rate,
                    meta.regularization_weight
                );
            }
            Some(resume)
        }
        None => None,
    };
    let start_epoch = resumed_from.as_ref().map_or(1, |r| r.next_epoch);

    let summary = config.summary_log.as_deref().map(StructuredLogger::new).transpose()?;
    let source = BatchSource::new(dataset);
    let split = Split::new(dataset.total(), config.training_fraction);
    let settings = EpochSettings {
        train_batch_size: config.train_batch_size,
        predict_batch_size: config.predict_batch_size,
        max_epoch: config.max_epoch,
        max_decays: config.max_decays,
        learning_rate: config.learning_rate,
        regularization_weight: config.regularization_weight,
    };
    let checkpoints = config
        .checkpoint_prefix
        .as_ref()
        .map(|prefix| CheckpointManager::new(prefix.clone(), config.checkpoint_width));

    log::info!("Start training ...");
    log::info!(
        "{} examples: {} training, {} validation",
        split.total,
        split.training_count,
        split.validation_count
    );

    let outcome = {
        let mut controller =
            EpochController::new(&mut *model, PrefetchPipeline::new(source), split, settings);
        log::info!("Learning rate: {:.2e}", controller.learning_rate());
        log::info!("L2 regularization lambda: {:.2e}", controller.regularization_weight());
        if let Some(manager) = checkpoints.clone() {
            controller = controller.with_checkpoints(manager);
        }
        if let Some(logger) = &summary {
            controller = controller.with_summary(logger);
        }
        controller.run(start_epoch)?
    };
    if let Some(logger) = &summary {
        logger.flush()?;
    }

    match outcome.best() {
        Some(best) => log::info!("Best validation loss at epoch: {}", best.epoch),
        None => log::warn!("No epoch completed, nothing to compare"),
    }
    let last_checkpoint = checkpoints
        .as_ref()
        .zip(outcome.last_epoch())
        .map(|(manager, epoch)| manager.path_for(epoch));

    let report = eval::evaluate(&*model, &source, config.predict_batch_size)?;
    report.log();
    if let Some(path) = &config.report_json {
        report.save_json(path)?;
        log::info!("Evaluation report written to {}", path.display());
    }

    Ok(TrainingRun {
        outcome,
        report,
        resumed_from,
        last_checkpoint,
    })
}
