//! Evaluation Reporter
//!
//! 学習終了後にデータセット全体を先頭から推論し、塩基置換ヘッドの top-1/top-2 精度と
//! 残り3ヘッドの混同行列を求める。結果は観察用で、学習にはフィードバックしない。

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use serde::Serialize;

use crate::error::{TrainError, TrainResult};
use crate::model::{Head, HeadOutputs, Model};
use crate::source::{BatchSource, Matrix};

/// 最初の最大値の位置
fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// スコア降順のクラス順位（同点は後ろのクラスが先）
fn rank_descending(values: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    order.reverse();
    order
}

/// 正方混同行列（行 = 正解, 列 = 予測）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    pub classes: usize,
    pub cells: Vec<Vec<u64>>,
}

impl ConfusionMatrix {
    pub fn new(classes: usize) -> Self {
        Self {
            classes,
            cells: vec![vec![0; classes]; classes],
        }
    }

    pub fn record(&mut self, truth: usize, predicted: usize) {
        self.cells[truth][predicted] += 1;
    }

    pub fn total(&self) -> u64 {
        self.cells.iter().flatten().sum()
    }

    /// 対角成分の合計
    pub fn correct(&self) -> u64 {
        (0..self.classes).map(|i| self.cells[i][i]).sum()
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, row) in self.cells.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            let line: Vec<String> = row.iter().map(|c| c.to_string()).collect();
            write!(f, "{}", line.join("\t"))?;
        }
        Ok(())
    }
}

/// top-k 精度の集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TopKAccuracy {
    pub total: u64,
    pub top1: u64,
    pub top2: u64,
}

impl TopKAccuracy {
    pub fn record(&mut self, truth: usize, predicted: &[f32]) {
        self.total += 1;
        let ranked = rank_descending(predicted);
        if ranked.first() == Some(&truth) {
            self.top1 += 1;
            self.top2 += 1;
        } else if ranked.get(1) == Some(&truth) {
            self.top2 += 1;
        }
    }

    pub fn top1_percent(&self) -> f64 {
        percent(self.top1, self.total)
    }

    pub fn top2_percent(&self) -> f64 {
        percent(self.top2, self.total)
    }
}

fn percent(count: u64, total: u64) -> f64 {
    if total == 0 { 0.0 } else { count as f64 / total as f64 * 100.0 }
}

/// 評価レポート
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub examples: usize,
    pub base: TopKAccuracy,
    pub zygosity: ConfusionMatrix,
    pub variant_type: ConfusionMatrix,
    pub indel_length: ConfusionMatrix,
}

impl EvaluationReport {
    /// 推論結果と正解ラベル（16列）から集計
    pub fn compute(outputs: &HeadOutputs, labels: &Matrix) -> Self {
        let examples = outputs.len().min(labels.rows());
        if outputs.len() != labels.rows() {
            log::warn!(
                "{} predictions for {} labels, scoring the first {examples}",
                outputs.len(),
                labels.rows()
            );
        }

        let mut base = TopKAccuracy::default();
        let mut zygosity = ConfusionMatrix::new(Head::Zygosity.classes());
        let mut variant_type = ConfusionMatrix::new(Head::VariantType.classes());
        let mut indel_length = ConfusionMatrix::new(Head::IndelLength.classes());

        for i in 0..examples {
            let label = labels.row(i);
            base.record(argmax(&label[Head::Base.label_range()]), outputs.base.row(i));
            for (head, matrix) in [
                (Head::Zygosity, &mut zygosity),
                (Head::VariantType, &mut variant_type),
                (Head::IndelLength, &mut indel_length),
            ] {
                let truth = argmax(&label[head.label_range()]);
                let predicted = argmax(outputs.head(head).row(i));
                matrix.record(truth, predicted);
            }
        }

        Self {
            examples,
            base,
            zygosity,
            variant_type,
            indel_length,
        }
    }

    /// `info` レベルでレポートを出力
    pub fn log(&self) {
        log::info!("Evaluation on base change:");
        log::info!(
            "all/top1/top2/top1p/top2p: {}/{}/{}/{:.2}/{:.2}",
            self.base.total,
            self.base.top1,
            self.base.top2,
            self.base.top1_percent(),
            self.base.top2_percent()
        );
        for (head, matrix) in [
            (Head::Zygosity, &self.zygosity),
            (Head::VariantType, &self.variant_type),
            (Head::IndelLength, &self.indel_length),
        ] {
            log::info!("Evaluation on {}:", head.name());
            for line in matrix.to_string().lines() {
                log::info!("{line}");
            }
        }
    }

    /// JSON で保存
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> TrainResult<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

/// データセット全体を `batch_size` 件ずつ推論して連結
pub fn predict_all<M: Model + ?Sized>(
    model: &M,
    source: &BatchSource<'_>,
    batch_size: usize,
) -> TrainResult<HeadOutputs> {
    if batch_size == 0 {
        return Err(TrainError::InvalidConfig("predict batch size must be positive".into()));
    }
    let mut outputs = HeadOutputs::empty();
    let mut cursor = 0;
    loop {
        let (features, decoded) = source.decode_features(cursor, batch_size)?;
        if decoded.count > 0 {
            outputs.append(&model.predict(&features));
        }
        cursor += decoded.count;
        if decoded.reached_end {
            break;
        }
    }
    Ok(outputs)
}

/// 推論と集計をまとめて行う
pub fn evaluate<M: Model + ?Sized>(
    model: &M,
    source: &BatchSource<'_>,
    batch_size: usize,
) -> TrainResult<EvaluationReport> {
    log::info!("Testing on the training and validation dataset ...");
    let predict_start = Instant::now();
    let outputs = predict_all(model, source, batch_size)?;
    log::info!("Prediction time elapsed: {:.2} s", predict_start.elapsed().as_secs_f64());

    let labels = source.decode_labels(0, source.total())?;
    Ok(EvaluationReport::compute(&outputs, &labels))
}
