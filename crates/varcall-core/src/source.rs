//! バッチ供給
//!
//! 特徴量配列とラベル配列をカーソル位置から同時に展開し、学習用バッチを作る。

use crate::codec::{ArrayDecoder, Decoded};
use crate::dataset::Dataset;
use crate::error::{TrainError, TrainResult};

/// 行優先の密行列
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Matrix {
    data: Vec<f32>,
    cols: usize,
}

impl Matrix {
    pub fn new(data: Vec<f32>, cols: usize) -> Self {
        debug_assert!(cols > 0 && data.len() % cols == 0, "ragged matrix");
        Self { data, cols }
    }

    /// 列数だけ決まった空行列
    pub fn empty(cols: usize) -> Self {
        Self {
            data: Vec::new(),
            cols,
        }
    }

    pub fn rows(&self) -> usize {
        if self.cols == 0 { 0 } else { self.data.len() / self.cols }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> + '_ {
        self.data.chunks_exact(self.cols.max(1))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// 行を末尾に連結
    pub fn extend_rows(&mut self, other: &Matrix) {
        debug_assert_eq!(self.cols, other.cols);
        self.data.extend_from_slice(&other.data);
    }
}

/// データセットから切り出した連続区間
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub features: Matrix,
    pub labels: Matrix,
    /// 実際の件数（末尾付近では要求より少ない）
    pub count: usize,
    /// この区間がデータセット末尾まで届いているか
    pub reached_end: bool,
}

/// 2配列の展開結果が一致することを確認
pub fn check_consistency(cursor: usize, features: &Decoded, labels: &Decoded) -> TrainResult<()> {
    if features.count != labels.count || features.reached_end != labels.reached_end {
        return Err(TrainError::DecodeInconsistency {
            cursor,
            feature_count: features.count,
            label_count: labels.count,
            feature_end: features.reached_end,
            label_end: labels.reached_end,
        });
    }
    Ok(())
}

/// Batch Source
///
/// 参照のみを保持するのでコピーして各段に渡せる。
#[derive(Clone, Copy)]
pub struct BatchSource<'a> {
    features: &'a dyn ArrayDecoder,
    labels: &'a dyn ArrayDecoder,
    total: usize,
}

impl<'a> BatchSource<'a> {
    pub fn new(dataset: &'a Dataset) -> Self {
        Self {
            features: dataset.features(),
            labels: dataset.labels(),
            total: dataset.total(),
        }
    }

    /// 任意のデコーダ組から作成
    pub fn from_decoders(
        features: &'a dyn ArrayDecoder,
        labels: &'a dyn ArrayDecoder,
        total: usize,
    ) -> Self {
        Self {
            features,
            labels,
            total,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// `cursor` から最大 `requested` 件のバッチを展開
    pub fn decode(&self, cursor: usize, requested: usize) -> TrainResult<Batch> {
        let x = self.features.decompress(cursor, requested)?;
        let y = self.labels.decompress(cursor, requested)?;
        check_consistency(cursor, &x, &y)?;
        log::debug!("decoded {} examples at {cursor} (end={})", x.count, x.reached_end);
        Ok(Batch {
            features: Matrix::new(x.values, self.features.width()),
            labels: Matrix::new(y.values, self.labels.width()),
            count: x.count,
            reached_end: x.reached_end,
        })
    }

    /// 特徴量のみを展開（推論用）
    pub fn decode_features(&self, cursor: usize, requested: usize) -> TrainResult<(Matrix, Decoded)> {
        let mut x = self.features.decompress(cursor, requested)?;
        let values = std::mem::take(&mut x.values);
        Ok((Matrix::new(values, self.features.width()), x))
    }

    /// ラベルのみを展開（評価用）
    pub fn decode_labels(&self, cursor: usize, requested: usize) -> TrainResult<Matrix> {
        let y = self.labels.decompress(cursor, requested)?;
        Ok(Matrix::new(y.values, self.labels.width()))
    }
}
