//! ブロック圧縮配列
//!
//! 行列を固定行数のブロックに分け、ブロック毎に deflate 圧縮して保持する。
//! 展開は要求範囲に重なるブロックだけを対象にするため、カーソル位置からの
//! 部分展開が安価に行える。

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use crate::error::{CodecError, TrainError, TrainResult};

/// 1ブロックあたりの既定行数
pub const DEFAULT_BLOCK_ROWS: usize = 500;

/// 位置ラベルの区切り文字
const LABEL_SEPARATOR: u8 = b'\n';

/// 部分展開の結果
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// 行優先の値（`count * width` 要素）
    pub values: Vec<f32>,
    /// 実際に展開した行数
    pub count: usize,
    /// 配列末尾に到達したか
    pub reached_end: bool,
}

/// カーソル位置から行を展開するデコーダ
///
/// 読み取り専用なので、制御スレッドとワーカーから同時に呼び出してよい。
pub trait ArrayDecoder: Sync {
    /// 1行あたりの要素数
    fn width(&self) -> usize;

    /// 総行数
    fn rows(&self) -> usize;

    /// `cursor` から最大 `requested` 行を展開
    fn decompress(&self, cursor: usize, requested: usize) -> Result<Decoded, CodecError>;
}

/// 要求範囲を実際の行数にクリップし、(行数, 末尾到達) を返す
#[inline]
fn clip_range(rows: usize, cursor: usize, requested: usize) -> (usize, bool) {
    let count = requested.min(rows.saturating_sub(cursor));
    (count, cursor + count >= rows)
}

fn deflate(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
    enc.write_all(bytes)?;
    enc.finish()
}

fn inflate(block: usize, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    DeflateDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|source| CodecError::Inflate { block, source })?;
    Ok(out)
}

/// 圧縮済み f32 行列
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedArray {
    rows: usize,
    width: usize,
    block_rows: usize,
    blocks: Vec<Vec<u8>>,
}

impl CompressedArray {
    /// 行優先の値を圧縮
    pub fn compress(values: &[f32], width: usize, block_rows: usize) -> TrainResult<Self> {
        if width == 0 || block_rows == 0 {
            return Err(TrainError::DatasetFormat(
                "array width and block size must be positive".to_string(),
            ));
        }
        if values.len() % width != 0 {
            return Err(TrainError::DatasetFormat(format!(
                "{} values do not form rows of width {width}",
                values.len()
            )));
        }

        let rows = values.len() / width;
        let mut blocks = Vec::with_capacity(rows.div_ceil(block_rows));
        let mut raw = Vec::new();
        for chunk in values.chunks(block_rows * width) {
            raw.resize(chunk.len() * 4, 0);
            LittleEndian::write_f32_into(chunk, &mut raw);
            blocks.push(deflate(&raw)?);
        }

        Ok(Self {
            rows,
            width,
            block_rows,
            blocks,
        })
    }

    /// 読み込み済みのブロック列から復元
    pub fn from_blocks(
        rows: usize,
        width: usize,
        block_rows: usize,
        blocks: Vec<Vec<u8>>,
    ) -> TrainResult<Self> {
        if width == 0 || block_rows == 0 {
            return Err(TrainError::DatasetFormat(
                "array width and block size must be positive".to_string(),
            ));
        }
        if blocks.len() != rows.div_ceil(block_rows) {
            return Err(TrainError::DatasetFormat(format!(
                "{} blocks cannot hold {rows} rows of block size {block_rows}",
                blocks.len()
            )));
        }
        Ok(Self {
            rows,
            width,
            block_rows,
            blocks,
        })
    }

    pub fn block_rows(&self) -> usize {
        self.block_rows
    }

    pub fn blocks(&self) -> &[Vec<u8>] {
        &self.blocks
    }

    fn inflate_block(&self, block: usize) -> Result<Vec<f32>, CodecError> {
        let rows_in_block = self.block_rows.min(self.rows - block * self.block_rows);
        let expected = rows_in_block * self.width * 4;
        let raw = inflate(block, &self.blocks[block])?;
        if raw.len() != expected {
            return Err(CodecError::BlockSize {
                block,
                expected,
                actual: raw.len(),
            });
        }
        let mut values = vec![0.0f32; rows_in_block * self.width];
        LittleEndian::read_f32_into(&raw, &mut values);
        Ok(values)
    }
}

impl ArrayDecoder for CompressedArray {
    fn width(&self) -> usize {
        self.width
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn decompress(&self, cursor: usize, requested: usize) -> Result<Decoded, CodecError> {
        let (count, reached_end) = clip_range(self.rows, cursor, requested);
        let mut values = Vec::with_capacity(count * self.width);
        if count > 0 {
            let end = cursor + count;
            for block in cursor / self.block_rows..=(end - 1) / self.block_rows {
                let block_start = block * self.block_rows;
                let data = self.inflate_block(block)?;
                let lo = cursor.max(block_start) - block_start;
                let hi = end.min(block_start + self.block_rows) - block_start;
                values.extend_from_slice(&data[lo * self.width..hi * self.width]);
            }
        }
        Ok(Decoded {
            values,
            count,
            reached_end,
        })
    }
}

/// 圧縮済みの位置ラベル列（`"chr:pos"` 等）
#[derive(Debug, Clone, PartialEq)]
pub struct PositionArray {
    rows: usize,
    block_rows: usize,
    blocks: Vec<Vec<u8>>,
}

impl PositionArray {
    /// ラベル列を圧縮（改行を含むラベルは不可）
    pub fn compress<S: AsRef<str>>(labels: &[S], block_rows: usize) -> TrainResult<Self> {
        if block_rows == 0 {
            return Err(TrainError::DatasetFormat("block size must be positive".to_string()));
        }
        let mut blocks = Vec::with_capacity(labels.len().div_ceil(block_rows));
        for chunk in labels.chunks(block_rows) {
            let mut raw = Vec::new();
            for (i, label) in chunk.iter().enumerate() {
                let label = label.as_ref();
                if label.as_bytes().contains(&LABEL_SEPARATOR) {
                    return Err(TrainError::DatasetFormat(format!(
                        "position label {label:?} contains a newline"
                    )));
                }
                if i > 0 {
                    raw.push(LABEL_SEPARATOR);
                }
                raw.extend_from_slice(label.as_bytes());
            }
            blocks.push(deflate(&raw)?);
        }
        Ok(Self {
            rows: labels.len(),
            block_rows,
            blocks,
        })
    }

    /// 読み込み済みのブロック列から復元
    pub fn from_blocks(rows: usize, block_rows: usize, blocks: Vec<Vec<u8>>) -> TrainResult<Self> {
        if block_rows == 0 || blocks.len() != rows.div_ceil(block_rows) {
            return Err(TrainError::DatasetFormat(format!(
                "{} position blocks cannot hold {rows} rows of block size {block_rows}",
                blocks.len()
            )));
        }
        Ok(Self {
            rows,
            block_rows,
            blocks,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn block_rows(&self) -> usize {
        self.block_rows
    }

    pub fn blocks(&self) -> &[Vec<u8>] {
        &self.blocks
    }

    /// `cursor` から最大 `requested` 個のラベルを展開
    pub fn decompress(&self, cursor: usize, requested: usize) -> Result<Vec<String>, CodecError> {
        let (count, _) = clip_range(self.rows, cursor, requested);
        let mut labels = Vec::with_capacity(count);
        if count == 0 {
            return Ok(labels);
        }
        let end = cursor + count;
        for block in cursor / self.block_rows..=(end - 1) / self.block_rows {
            let block_start = block * self.block_rows;
            let rows_in_block = self.block_rows.min(self.rows - block_start);
            let raw = inflate(block, &self.blocks[block])?;
            let text = std::str::from_utf8(&raw).map_err(|_| CodecError::InvalidLabel { block })?;
            let parts: Vec<&str> = text.split(LABEL_SEPARATOR as char).collect();
            if parts.len() != rows_in_block {
                return Err(CodecError::BlockSize {
                    block,
                    expected: rows_in_block,
                    actual: parts.len(),
                });
            }
            let lo = cursor.max(block_start) - block_start;
            let hi = end.min(block_start + self.block_rows) - block_start;
            labels.extend(parts[lo..hi].iter().map(|s| s.to_string()));
        }
        Ok(labels)
    }
}
