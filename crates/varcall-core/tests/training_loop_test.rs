//! 学習ループの結合テスト（減衰スケジュール・終了条件・再開）

use std::path::Path;

use varcall_core::checkpoint::{CheckpointManager, sidecar_path};
use varcall_core::epoch::{EpochController, EpochSettings, Split, StopReason};
use varcall_core::model::{HeadOutputs, LABEL_WIDTH, StepSummary, TrainStepOutput};
use varcall_core::prefetch::PrefetchPipeline;
use varcall_core::source::{Batch, BatchSource, Matrix};
use varcall_core::{Dataset, Model, SoftmaxHeads, TrainConfig, TrainResult, train_and_evaluate};

/// エポック毎の検証損失を台本どおりに返すモデル
///
/// 4件・学習割合 0.5・学習バッチ 1・検証バッチ 2 の構成では、1エポックあたり
/// 学習ステップ1回と検証呼び出し2回が起きるので、検証損失の総和は台本の2倍になる。
struct Scripted {
    script: Vec<f64>,
    train_calls: usize,
    learning_rate: f64,
    decays: usize,
}

impl Scripted {
    fn new(script: &[f64]) -> Self {
        Self {
            script: script.to_vec(),
            train_calls: 0,
            learning_rate: 0.0,
            decays: 0,
        }
    }
}

impl Model for Scripted {
    fn train_step(&mut self, batch: &Batch) -> TrainStepOutput {
        self.train_calls += 1;
        TrainStepOutput {
            loss: 1.0,
            summary: StepSummary {
                examples: batch.count,
                loss: 1.0,
                learning_rate: self.learning_rate,
                regularization_weight: 0.0,
            },
        }
    }

    fn validation_loss(&self, _batch: &Batch) -> f64 {
        let epoch = self.train_calls.saturating_sub(1).min(self.script.len() - 1);
        self.script[epoch]
    }

    fn predict(&self, features: &Matrix) -> HeadOutputs {
        let mut out = HeadOutputs::empty();
        for _ in 0..features.rows() {
            out.append(&HeadOutputs {
                base: Matrix::new(vec![1.0, 0.0, 0.0, 0.0], 4),
                zygosity: Matrix::new(vec![1.0, 0.0], 2),
                variant_type: Matrix::new(vec![1.0, 0.0, 0.0, 0.0], 4),
                indel_length: Matrix::new(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0], 6),
            });
        }
        out
    }

    fn set_learning_rate(&mut self, value: Option<f64>) -> f64 {
        match value {
            Some(v) => self.learning_rate = v,
            None => {
                self.learning_rate /= 2.0;
                self.decays += 1;
            }
        }
        self.learning_rate
    }

    fn set_regularization_weight(&mut self, value: Option<f64>) -> f64 {
        value.unwrap_or(0.0)
    }

    fn save_parameters(&self, path: &Path) -> TrainResult<()> {
        std::fs::write(path, b"scripted")?;
        Ok(())
    }

    fn restore_parameters(&mut self, _path: &Path) -> TrainResult<()> {
        Ok(())
    }
}

fn four_example_dataset() -> Dataset {
    let features = vec![0.0f32; 4];
    let labels = vec![0.0f32; 4 * LABEL_WIDTH];
    let positions = ["chr1:1", "chr1:2", "chr1:3", "chr1:4"];
    Dataset::from_rows(&features, 1, &labels, &positions, 2).unwrap()
}

fn settings(max_epoch: usize, max_decays: u32) -> EpochSettings {
    EpochSettings {
        train_batch_size: 1,
        predict_batch_size: 2,
        max_epoch,
        max_decays,
        learning_rate: 1.0,
        regularization_weight: 0.0,
    }
}

#[test]
fn test_zigzag_with_budget_one_stops_training() {
    let dataset = four_example_dataset();
    let pipeline = PrefetchPipeline::new(BatchSource::new(&dataset));
    let mut model = Scripted::new(&[10.0, 8.0, 9.0, 7.0, 9.0, 6.0, 5.0]);

    let outcome = EpochController::new(&mut model, pipeline, Split::new(4, 0.5), settings(100, 1))
        .run(1)
        .unwrap();

    assert_eq!(outcome.stop_reason, StopReason::DecayBudgetExhausted);
    assert_eq!(outcome.last_epoch(), Some(6));
    let losses: Vec<f64> = outcome.history.iter().map(|r| r.loss_sum).collect();
    assert_eq!(losses, vec![20.0, 16.0, 18.0, 14.0, 18.0, 12.0]);
    assert_eq!(model.decays, 0);
}

#[test]
fn test_zigzag_decays_then_continues() {
    let dataset = four_example_dataset();
    let pipeline = PrefetchPipeline::new(BatchSource::new(&dataset));
    let mut model =
        Scripted::new(&[10.0, 8.0, 9.0, 7.0, 9.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 0.5, 0.25]);

    let mut controller =
        EpochController::new(&mut model, pipeline, Split::new(4, 0.5), settings(12, 3));
    let outcome = controller.run(1).unwrap();

    assert_eq!(outcome.stop_reason, StopReason::MaxEpoch);
    assert_eq!(outcome.last_epoch(), Some(11));
    assert_eq!(outcome.decays_applied, 1);
    assert_eq!(controller.learning_rate(), 0.5);
    assert_eq!(outcome.best().map(|r| r.epoch), Some(11));
    drop(controller);
    assert_eq!(model.decays, 1);
}

#[test]
fn test_monotonic_losses_never_decay() {
    let dataset = four_example_dataset();
    let pipeline = PrefetchPipeline::new(BatchSource::new(&dataset));
    let script: Vec<f64> = (0..10).map(|i| 10.0 - i as f64).collect();
    let mut model = Scripted::new(&script);

    let outcome = EpochController::new(&mut model, pipeline, Split::new(4, 0.5), settings(11, 1))
        .run(1)
        .unwrap();

    assert_eq!(outcome.stop_reason, StopReason::MaxEpoch);
    assert_eq!(outcome.history.len(), 10);
    assert_eq!(model.decays, 0);
}

#[test]
fn test_checkpoint_written_before_budget_exhaustion() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = four_example_dataset();
    let pipeline = PrefetchPipeline::new(BatchSource::new(&dataset));
    let mut model = Scripted::new(&[10.0, 8.0, 9.0, 7.0, 9.0, 6.0]);
    let manager = CheckpointManager::new(dir.path().join("run"), 4);

    let outcome = EpochController::new(&mut model, pipeline, Split::new(4, 0.5), settings(100, 1))
        .with_checkpoints(manager)
        .run(1)
        .unwrap();

    assert_eq!(outcome.stop_reason, StopReason::DecayBudgetExhausted);
    for epoch in 1..=6 {
        let path = dir.path().join(format!("run-{epoch:04}"));
        assert!(path.exists(), "missing {}", path.display());
        assert!(sidecar_path(&path).exists());
    }
    assert!(!dir.path().join("run-0007").exists());
}

#[test]
fn test_resume_from_epoch_twelve_starts_at_thirteen() {
    let dir = tempfile::tempdir().unwrap();
    let total = 12;
    let features: Vec<f32> = (0..total * 2).map(|v| (v % 5) as f32 * 0.1).collect();
    let mut labels = vec![0.0f32; total * LABEL_WIDTH];
    for i in 0..total {
        for start in [0, 4, 6, 10] {
            labels[i * LABEL_WIDTH + start] = 1.0;
        }
    }
    let positions: Vec<String> = (0..total).map(|i| format!("chr3:{i}")).collect();
    let dataset = Dataset::from_rows(&features, 2, &labels, &positions, 5).unwrap();

    let manager = CheckpointManager::new(dir.path().join("run"), 4);
    let saved = manager.save(&SoftmaxHeads::new(2, 0.5), 12, 1e-3, 5e-3).unwrap();
    assert!(saved.ends_with("run-0012"));

    let config = TrainConfig {
        train_batch_size: 4,
        predict_batch_size: 4,
        max_epoch: 15,
        checkpoint_width: 4,
        resume_from: Some(saved),
        checkpoint_prefix: Some(dir.path().join("run")),
        ..Default::default()
    };
    let mut model = SoftmaxHeads::new(2, 0.5);
    let run = train_and_evaluate(&config, &dataset, &mut model).unwrap();

    assert_eq!(run.resumed_from.map(|r| r.next_epoch), Some(13));
    let epochs: Vec<usize> = run.outcome.history.iter().map(|r| r.epoch).collect();
    assert_eq!(epochs, vec![13, 14]);
    assert!(dir.path().join("run-0014").exists());
}
