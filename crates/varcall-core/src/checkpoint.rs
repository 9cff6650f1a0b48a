//! Checkpoint Manager
//!
//! パラメータ本体の形式はモデル側が所有する。ここではパス規則
//! `<prefix>-<エポック番号(ゼロ埋め固定幅)>` と、再開エポックを明示的に保持する
//! サイドカー `<path>.json` を扱う。

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};
use crate::model::Model;

/// サイドカーに保存するメタデータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// 保存時のエポック番号
    pub epoch: usize,
    pub learning_rate: f64,
    pub regularization_weight: f64,
    /// 保存時刻 (RFC 3339)
    #[serde(default)]
    pub saved_at: Option<String>,
}

/// 再開位置
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    /// チェックポイントを保存したエポック
    pub checkpoint_epoch: usize,
    /// 再開後に最初に実行するエポック
    pub next_epoch: usize,
    /// サイドカーがあればその内容
    pub meta: Option<CheckpointMeta>,
}

/// `<path>.json`
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".json");
    PathBuf::from(name)
}

/// エポック毎のチェックポイント出力
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    prefix: PathBuf,
    width: usize,
}

impl CheckpointManager {
    pub fn new<P: Into<PathBuf>>(prefix: P, width: usize) -> Self {
        Self {
            prefix: prefix.into(),
            width,
        }
    }

    /// エポック番号に対応する出力パス
    pub fn path_for(&self, epoch: usize) -> PathBuf {
        let mut name = OsString::from(self.prefix.as_os_str());
        name.push(format!("-{epoch:0width$}", width = self.width));
        PathBuf::from(name)
    }

    /// パラメータとサイドカーを保存し、パラメータのパスを返す
    pub fn save<M: Model + ?Sized>(
        &self,
        model: &M,
        epoch: usize,
        learning_rate: f64,
        regularization_weight: f64,
    ) -> TrainResult<PathBuf> {
        let path = self.path_for(epoch);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        model.save_parameters(&path)?;

        let meta = CheckpointMeta {
            epoch,
            learning_rate,
            regularization_weight,
            saved_at: Some(chrono::Local::now().to_rfc3339()),
        };
        let mut writer = BufWriter::new(File::create(sidecar_path(&path))?);
        serde_json::to_writer_pretty(&mut writer, &meta)?;
        writer.flush()?;

        log::info!("Saved checkpoint: {}", path.display());
        Ok(path)
    }
}

/// ファイル名末尾の固定幅数字からエポック番号を取り出す
pub fn parse_epoch_suffix(path: &Path, width: usize) -> TrainResult<usize> {
    let corrupt = |reason: String| TrainError::CheckpointCorrupt {
        path: path.to_path_buf(),
        reason,
    };
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| corrupt("file name is not valid UTF-8".to_string()))?;
    if width == 0 || name.len() < width {
        return Err(corrupt(format!("file name shorter than the {width}-digit epoch suffix")));
    }
    let suffix = &name.as_bytes()[name.len() - width..];
    if !suffix.iter().all(u8::is_ascii_digit) {
        return Err(corrupt(format!("file name does not end with a {width}-digit epoch")));
    }
    // ASCII 数字のみなので UTF-8 境界は保たれている
    name[name.len() - width..]
        .parse()
        .map_err(|e| corrupt(format!("bad epoch suffix: {e}")))
}

fn read_sidecar(path: &Path) -> TrainResult<Option<CheckpointMeta>> {
    let sidecar = sidecar_path(path);
    if !sidecar.exists() {
        return Ok(None);
    }
    let reader = BufReader::new(File::open(&sidecar)?);
    let meta = serde_json::from_reader(reader).map_err(|e| TrainError::CheckpointCorrupt {
        path: sidecar.clone(),
        reason: e.to_string(),
    })?;
    Ok(Some(meta))
}

/// チェックポイントを復元して再開位置を返す
///
/// 再開エポックはサイドカーを優先し、無ければファイル名の数字から求める。
pub fn restore<M: Model + ?Sized>(model: &mut M, path: &Path, width: usize) -> TrainResult<ResumePoint> {
    if !path.exists() {
        return Err(TrainError::CheckpointNotFound {
            path: path.to_path_buf(),
        });
    }
    let meta = read_sidecar(path)?;
    let checkpoint_epoch = match &meta {
        Some(m) => m.epoch,
        None => {
            log::warn!("no sidecar for {}, reading epoch from file name", path.display());
            parse_epoch_suffix(path, width)?
        }
    };
    model.restore_parameters(path)?;
    log::info!("Restored checkpoint {} (epoch {checkpoint_epoch})", path.display());
    Ok(ResumePoint {
        checkpoint_epoch,
        next_epoch: checkpoint_epoch + 1,
        meta,
    })
}
