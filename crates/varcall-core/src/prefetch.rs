//! Prefetch Pipeline
//!
//! 現バッチのモデルステップをワーカースレッドで走らせている間に、
//! 制御スレッドで次バッチを展開する2段パイプライン。
//! ワーカーは1ステップにつき1本だけ起動し、次バッチの結果を使う前に必ず join する。

use std::thread;
use std::time::{Duration, Instant};

use crate::error::{TrainError, TrainResult};
use crate::model::{Model, TrainStepOutput};
use crate::source::{Batch, BatchSource};

/// 現バッチに対して実行するステップ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Train,
    Validate,
}

/// ワーカーが返す損失
#[derive(Debug, Clone, PartialEq)]
pub enum StepLoss {
    Train(TrainStepOutput),
    Validation(f64),
}

impl StepLoss {
    /// バッチ内損失の総和
    pub fn loss(&self) -> f64 {
        match self {
            StepLoss::Train(out) => out.loss,
            StepLoss::Validation(loss) => *loss,
        }
    }
}

/// 1ステップの結果
#[derive(Debug)]
pub struct StepResult {
    /// 現バッチの損失（join 後に確定）
    pub loss: StepLoss,
    /// 次バッチ
    pub next: Batch,
    /// 展開完了後にワーカーを待った時間
    pub wait: Duration,
}

/// 2段パイプライン
#[derive(Clone, Copy)]
pub struct PrefetchPipeline<'a> {
    source: BatchSource<'a>,
}

impl<'a> PrefetchPipeline<'a> {
    pub fn new(source: BatchSource<'a>) -> Self {
        Self { source }
    }

    pub fn source(&self) -> BatchSource<'a> {
        self.source
    }

    /// エポック先頭のバッチを同期的に展開
    pub fn prime(&self, cursor: usize, size: usize) -> TrainResult<Batch> {
        self.source.decode(cursor, size)
    }

    /// `current` のモデルステップと `next_cursor` からの展開を重ねて実行
    ///
    /// 展開に失敗した場合もワーカーを join してからエラーを返す。
    pub fn step<M: Model>(
        &self,
        model: &mut M,
        current: &Batch,
        kind: StepKind,
        next_cursor: usize,
        next_size: usize,
    ) -> TrainResult<StepResult> {
        let source = self.source;
        thread::scope(|s| -> TrainResult<StepResult> {
            let worker = thread::Builder::new()
                .name("model-step".to_string())
                .spawn_scoped(s, move || match kind {
                    StepKind::Train => StepLoss::Train(model.train_step(current)),
                    StepKind::Validate => StepLoss::Validation(model.validation_loss(current)),
                })?;

            let next = source.decode(next_cursor, next_size);

            let t0 = Instant::now();
            let loss = worker.join().map_err(|_| TrainError::WorkerPanicked)?;
            let wait = t0.elapsed();

            Ok(StepResult {
                loss,
                next: next?,
                wait,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ArrayDecoder, CompressedArray, Decoded};
    use crate::error::CodecError;
    use crate::model::{HeadOutputs, StepSummary};
    use crate::source::Matrix;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// 呼び出し履歴を記録するモデル
    #[derive(Default)]
    struct Recorder {
        trained: Vec<usize>,
        validated: Vec<usize>,
        panic_on_train: bool,
    }

    impl Model for Recorder {
        fn train_step(&mut self, batch: &Batch) -> TrainStepOutput {
            if self.panic_on_train {
                panic!("boom");
            }
            self.trained.push(batch.count);
            TrainStepOutput {
                loss: batch.count as f64,
                summary: StepSummary {
                    examples: batch.count,
                    loss: batch.count as f64,
                    learning_rate: 0.0,
                    regularization_weight: 0.0,
                },
            }
        }
        fn validation_loss(&self, batch: &Batch) -> f64 {
            batch.count as f64 * 0.5
        }
        fn predict(&self, _features: &Matrix) -> HeadOutputs {
            HeadOutputs::empty()
        }
        fn set_learning_rate(&mut self, value: Option<f64>) -> f64 {
            value.unwrap_or(0.0)
        }
        fn set_regularization_weight(&mut self, value: Option<f64>) -> f64 {
            value.unwrap_or(0.0)
        }
        fn save_parameters(&self, _path: &Path) -> TrainResult<()> {
            Ok(())
        }
        fn restore_parameters(&mut self, _path: &Path) -> TrainResult<()> {
            Ok(())
        }
    }

    /// 展開時にワーカーの完了状態を覗き見るデコーダ
    struct Observing {
        inner: CompressedArray,
        fail_at: Option<usize>,
        seen_running: Arc<AtomicBool>,
    }

    impl ArrayDecoder for Observing {
        fn width(&self) -> usize {
            self.inner.width()
        }
        fn rows(&self) -> usize {
            self.inner.rows()
        }
        fn decompress(&self, cursor: usize, requested: usize) -> Result<Decoded, CodecError> {
            self.seen_running.store(true, Ordering::SeqCst);
            if self.fail_at == Some(cursor) {
                return Err(CodecError::InvalidLabel { block: 0 });
            }
            self.inner.decompress(cursor, requested)
        }
    }

    fn arrays(rows: usize) -> (CompressedArray, CompressedArray) {
        (
            CompressedArray::compress(&vec![1.0; rows * 2], 2, 4).unwrap(),
            CompressedArray::compress(&vec![0.0; rows * 3], 3, 4).unwrap(),
        )
    }

    #[test]
    fn test_step_returns_loss_and_next_batch() {
        let (x, y) = arrays(10);
        let pipeline = PrefetchPipeline::new(BatchSource::from_decoders(&x, &y, 10));
        let mut model = Recorder::default();

        let first = pipeline.prime(0, 4).unwrap();
        let r = pipeline.step(&mut model, &first, StepKind::Train, 4, 4).unwrap();
        assert_eq!(r.loss.loss(), 4.0);
        assert!(matches!(r.loss, StepLoss::Train(_)));
        assert_eq!(r.next.count, 4);

        let r = pipeline.step(&mut model, &r.next, StepKind::Validate, 8, 4).unwrap();
        assert_eq!(r.loss, StepLoss::Validation(2.0));
        assert_eq!(r.next.count, 2);
        assert!(r.next.reached_end);
        assert_eq!(model.trained, vec![4]);
    }

    #[test]
    fn test_decode_error_surfaces_after_join() {
        let (x, y) = arrays(10);
        let seen = Arc::new(AtomicBool::new(false));
        let broken = Observing {
            inner: x,
            fail_at: Some(4),
            seen_running: seen.clone(),
        };
        let pipeline = PrefetchPipeline::new(BatchSource::from_decoders(&broken, &y, 10));
        let mut model = Recorder::default();

        let first = pipeline.prime(0, 4).unwrap();
        let err = pipeline.step(&mut model, &first, StepKind::Train, 4, 4).unwrap_err();
        assert!(matches!(err, TrainError::Codec(_)));
        assert!(seen.load(Ordering::SeqCst));
        // ワーカーは完了している
        assert_eq!(model.trained, vec![4]);
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let (x, y) = arrays(8);
        let pipeline = PrefetchPipeline::new(BatchSource::from_decoders(&x, &y, 8));
        let mut model = Recorder {
            panic_on_train: true,
            ..Default::default()
        };
        let first = pipeline.prime(0, 4).unwrap();
        let err = pipeline.step(&mut model, &first, StepKind::Train, 4, 4).unwrap_err();
        assert!(matches!(err, TrainError::WorkerPanicked));
    }

    /// `from` 以降のカーソルで1行欠落させるデコーダ
    struct Truncating {
        inner: CompressedArray,
        from: usize,
    }

    impl ArrayDecoder for Truncating {
        fn width(&self) -> usize {
            self.inner.width()
        }
        fn rows(&self) -> usize {
            self.inner.rows()
        }
        fn decompress(&self, cursor: usize, requested: usize) -> Result<Decoded, CodecError> {
            let mut d = self.inner.decompress(cursor, requested)?;
            if cursor >= self.from && d.count > 0 {
                d.count -= 1;
                d.values.truncate(d.count * self.inner.width());
            }
            Ok(d)
        }
    }

    #[test]
    fn test_inconsistent_next_batch_is_fatal() {
        let (x, y) = arrays(10);
        let labels = Truncating { inner: y, from: 4 };
        let pipeline = PrefetchPipeline::new(BatchSource::from_decoders(&x, &labels, 10));
        let mut model = Recorder::default();

        let first = pipeline.prime(0, 4).unwrap();
        let err = pipeline.step(&mut model, &first, StepKind::Train, 4, 4).unwrap_err();
        assert!(matches!(
            err,
            TrainError::DecodeInconsistency { cursor: 4, feature_count: 4, label_count: 3, .. }
        ));
        assert_eq!(model.trained, vec![4]);
    }

    #[test]
    fn test_inconsistency_aborts_training_run() {
        use crate::epoch::{EpochController, EpochSettings, Split};

        let (x, y) = arrays(10);
        let labels = Truncating { inner: y, from: 6 };
        let pipeline = PrefetchPipeline::new(BatchSource::from_decoders(&x, &labels, 10));
        let mut model = Recorder::default();
        let settings = EpochSettings {
            train_batch_size: 2,
            predict_batch_size: 4,
            max_epoch: 5,
            max_decays: 3,
            learning_rate: 1e-3,
            regularization_weight: 0.0,
        };
        let err = EpochController::new(&mut model, pipeline, Split::new(10, 0.5), settings)
            .run(1)
            .unwrap_err();
        assert!(matches!(err, TrainError::DecodeInconsistency { cursor: 8, .. }));
        assert_eq!(model.trained, vec![2, 2]);
    }
}
