//! 参照モデル: 線形層 + ヘッド毎 softmax
//!
//! 特徴量 → 16 ロジットの1層だけを持ち、ロジットを4ヘッドに分けて softmax を取る。
//! 損失はヘッド毎の（ソフトターゲット）交差エントロピーの和、更新は L2 付き SGD。

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;

use super::{Head, HeadOutputs, LABEL_WIDTH, Model, StepSummary, TrainStepOutput};
use crate::error::{TrainError, TrainResult};
use crate::source::{Batch, Matrix};

/// パラメータファイルのマジック
const PARAMS_MAGIC: &[u8; 4] = b"VCSM";
const PARAMS_VERSION: u32 = 1;

/// log(0) 回避用の下限
const PROB_EPS: f32 = 1e-7;

/// 線形 softmax 多ヘッド分類器
#[derive(Clone, Debug)]
pub struct SoftmaxHeads {
    input_dim: usize,
    /// 重み [LABEL_WIDTH][input_dim]
    weights: Vec<f32>,
    /// バイアス [LABEL_WIDTH]
    biases: Vec<f32>,
    weight_grads: Vec<f32>,
    bias_grads: Vec<f32>,
    learning_rate: f64,
    regularization_weight: f64,
    /// `set_*(None)` で掛ける減衰率
    decay_factor: f64,
}

impl SoftmaxHeads {
    /// ゼロ初期化で作成
    pub fn new(input_dim: usize, decay_factor: f64) -> Self {
        Self {
            input_dim,
            weights: vec![0.0; LABEL_WIDTH * input_dim],
            biases: vec![0.0; LABEL_WIDTH],
            weight_grads: vec![0.0; LABEL_WIDTH * input_dim],
            bias_grads: vec![0.0; LABEL_WIDTH],
            learning_rate: 1e-3,
            regularization_weight: 0.0,
            decay_factor,
        }
    }

    /// 一様分布 [-1/sqrt(n), 1/sqrt(n)) で重みを初期化
    pub fn init_random<R: Rng>(&mut self, rng: &mut R) {
        let bound = 1.0 / (self.input_dim.max(1) as f32).sqrt();
        for w in &mut self.weights {
            *w = rng.random::<f32>() * 2.0 * bound - bound;
        }
        self.biases.fill(0.0);
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// パラメータ数
    pub fn param_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    /// 1件分の確率（ヘッド毎に正規化済み）
    fn probabilities(&self, input: &[f32]) -> [f32; LABEL_WIDTH] {
        debug_assert_eq!(input.len(), self.input_dim);
        let mut out = [0.0f32; LABEL_WIDTH];
        for (j, o) in out.iter_mut().enumerate() {
            let row = &self.weights[j * self.input_dim..(j + 1) * self.input_dim];
            *o = self.biases[j] + row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>();
        }
        for head in Head::ALL {
            let logits = &mut out[head.label_range()];
            let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for l in logits.iter_mut() {
                *l = (*l - max).exp();
                sum += *l;
            }
            for l in logits.iter_mut() {
                *l /= sum;
            }
        }
        out
    }

    fn example_loss(probs: &[f32; LABEL_WIDTH], label: &[f32]) -> f64 {
        probs
            .iter()
            .zip(label)
            .filter(|(_, t)| **t > 0.0)
            .map(|(p, t)| -(*t as f64) * (p.max(PROB_EPS) as f64).ln())
            .sum()
    }

    /// 勾配を累積（softmax + 交差エントロピーの出力勾配は p * Σt - t）
    fn accumulate_grads(&mut self, input: &[f32], probs: &[f32; LABEL_WIDTH], label: &[f32]) {
        for head in Head::ALL {
            let range = head.label_range();
            let mass: f32 = label[range.clone()].iter().sum();
            for j in range {
                let grad = probs[j] * mass - label[j];
                self.bias_grads[j] += grad;
                let grads = &mut self.weight_grads[j * self.input_dim..(j + 1) * self.input_dim];
                for (g, x) in grads.iter_mut().zip(input) {
                    *g += grad * x;
                }
            }
        }
    }

    fn zero_grad(&mut self) {
        self.weight_grads.fill(0.0);
        self.bias_grads.fill(0.0);
    }

    /// 平均勾配 + L2 で SGD 更新
    fn sgd_step(&mut self, batch_len: usize) {
        let lr = self.learning_rate as f32;
        let l2 = self.regularization_weight as f32;
        let scale = 1.0 / batch_len as f32;
        for (w, g) in self.weights.iter_mut().zip(&self.weight_grads) {
            *w -= lr * (g * scale + l2 * *w);
        }
        for (b, g) in self.biases.iter_mut().zip(&self.bias_grads) {
            *b -= lr * g * scale;
        }
    }

    fn summary(&self, examples: usize, loss: f64) -> StepSummary {
        StepSummary {
            examples,
            loss,
            learning_rate: self.learning_rate,
            regularization_weight: self.regularization_weight,
        }
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(PARAMS_MAGIC)?;
        writer.write_u32::<LittleEndian>(PARAMS_VERSION)?;
        writer.write_u32::<LittleEndian>(self.input_dim as u32)?;
        writer.write_u32::<LittleEndian>(LABEL_WIDTH as u32)?;
        for &b in &self.biases {
            writer.write_f32::<LittleEndian>(b)?;
        }
        for &w in &self.weights {
            writer.write_f32::<LittleEndian>(w)?;
        }
        Ok(())
    }

    /// パラメータを読み込む（形状が一致しない場合はエラー文字列）
    fn load_into<R: Read>(&mut self, reader: &mut R) -> Result<(), String> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(|e| e.to_string())?;
        if &magic != PARAMS_MAGIC {
            return Err("bad magic".to_string());
        }
        let version = reader.read_u32::<LittleEndian>().map_err(|e| e.to_string())?;
        if version != PARAMS_VERSION {
            return Err(format!("unsupported version {version}"));
        }
        let input_dim = reader.read_u32::<LittleEndian>().map_err(|e| e.to_string())? as usize;
        let outputs = reader.read_u32::<LittleEndian>().map_err(|e| e.to_string())? as usize;
        if input_dim != self.input_dim || outputs != LABEL_WIDTH {
            return Err(format!(
                "shape {outputs}x{input_dim} does not match model {LABEL_WIDTH}x{}",
                self.input_dim
            ));
        }
        let mut biases = vec![0.0f32; LABEL_WIDTH];
        reader.read_f32_into::<LittleEndian>(&mut biases).map_err(|e| e.to_string())?;
        let mut weights = vec![0.0f32; LABEL_WIDTH * input_dim];
        reader.read_f32_into::<LittleEndian>(&mut weights).map_err(|e| e.to_string())?;
        self.biases = biases;
        self.weights = weights;
        Ok(())
    }
}

impl Model for SoftmaxHeads {
    fn train_step(&mut self, batch: &Batch) -> TrainStepOutput {
        if batch.count == 0 {
            return TrainStepOutput {
                loss: 0.0,
                summary: self.summary(0, 0.0),
            };
        }
        self.zero_grad();
        let mut loss = 0.0;
        for (input, label) in batch.features.iter_rows().zip(batch.labels.iter_rows()) {
            let probs = self.probabilities(input);
            loss += Self::example_loss(&probs, label);
            self.accumulate_grads(input, &probs, label);
        }
        self.sgd_step(batch.count);
        TrainStepOutput {
            loss,
            summary: self.summary(batch.count, loss),
        }
    }

    fn validation_loss(&self, batch: &Batch) -> f64 {
        batch
            .features
            .iter_rows()
            .zip(batch.labels.iter_rows())
            .map(|(input, label)| Self::example_loss(&self.probabilities(input), label))
            .sum()
    }

    fn predict(&self, features: &Matrix) -> HeadOutputs {
        let mut out = HeadOutputs::empty();
        let mut heads: [Vec<f32>; 4] = Default::default();
        for input in features.iter_rows() {
            let probs = self.probabilities(input);
            for (buf, head) in heads.iter_mut().zip(Head::ALL) {
                buf.extend_from_slice(&probs[head.label_range()]);
            }
        }
        let [base, zygosity, variant_type, indel_length] = heads;
        out.base.extend_rows(&Matrix::new(base, Head::Base.classes()));
        out.zygosity.extend_rows(&Matrix::new(zygosity, Head::Zygosity.classes()));
        out.variant_type.extend_rows(&Matrix::new(variant_type, Head::VariantType.classes()));
        out.indel_length.extend_rows(&Matrix::new(indel_length, Head::IndelLength.classes()));
        out
    }

    fn set_learning_rate(&mut self, value: Option<f64>) -> f64 {
        self.learning_rate = value.unwrap_or(self.learning_rate * self.decay_factor);
        self.learning_rate
    }

    fn set_regularization_weight(&mut self, value: Option<f64>) -> f64 {
        self.regularization_weight = value.unwrap_or(self.regularization_weight * self.decay_factor);
        self.regularization_weight
    }

    fn save_parameters(&self, path: &Path) -> TrainResult<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.save(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    fn restore_parameters(&mut self, path: &Path) -> TrainResult<()> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TrainError::CheckpointNotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        self.load_into(&mut reader).map_err(|reason| TrainError::CheckpointCorrupt {
            path: path.to_path_buf(),
            reason,
        })
    }
}
