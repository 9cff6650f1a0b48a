//! 学習データセット
//!
//! 特徴量 (X)・ラベル (Y)・位置 (pos) の3配列を同じ行数で保持する。
//! 実行中は読み取り専用。
//!
//! # バイナリ形式（リトルエンディアン）
//! ```text
//! magic "VCDS" | version u32 | total u64
//! features: width u32 | block_rows u32 | block_count u32 | (len u32, bytes)*
//! labels:   width u32 | block_rows u32 | block_count u32 | (len u32, bytes)*
//! positions:            block_rows u32 | block_count u32 | (len u32, bytes)*
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::codec::{ArrayDecoder, CompressedArray, PositionArray};
use crate::error::{TrainError, TrainResult};
use crate::model::LABEL_WIDTH;

const MAGIC: &[u8; 4] = b"VCDS";
const FORMAT_VERSION: u32 = 1;
/// 1ブロックの圧縮サイズ上限（壊れたファイルで巨大確保しないため）
const MAX_BLOCK_BYTES: u32 = 1 << 30;

/// 学習データセット
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    total: usize,
    features: CompressedArray,
    labels: CompressedArray,
    positions: PositionArray,
}

impl Dataset {
    /// 3配列からデータセットを構築（行数とラベル幅を検証）
    pub fn new(
        features: CompressedArray,
        labels: CompressedArray,
        positions: PositionArray,
    ) -> TrainResult<Self> {
        let total = features.rows();
        if labels.rows() != total || positions.rows() != total {
            return Err(TrainError::DatasetFormat(format!(
                "array lengths differ: features {total}, labels {}, positions {}",
                labels.rows(),
                positions.rows()
            )));
        }
        if labels.width() != LABEL_WIDTH {
            return Err(TrainError::DatasetFormat(format!(
                "label width must be {LABEL_WIDTH}, got {}",
                labels.width()
            )));
        }
        Ok(Self {
            total,
            features,
            labels,
            positions,
        })
    }

    /// 非圧縮の行列から構築
    pub fn from_rows<S: AsRef<str>>(
        features: &[f32],
        feature_width: usize,
        labels: &[f32],
        positions: &[S],
        block_rows: usize,
    ) -> TrainResult<Self> {
        Self::new(
            CompressedArray::compress(features, feature_width, block_rows)?,
            CompressedArray::compress(labels, LABEL_WIDTH, block_rows)?,
            PositionArray::compress(positions, block_rows)?,
        )
    }

    /// 総件数
    pub fn total(&self) -> usize {
        self.total
    }

    /// 1件あたりの特徴量数
    pub fn feature_width(&self) -> usize {
        self.features.width()
    }

    pub fn features(&self) -> &CompressedArray {
        &self.features
    }

    pub fn labels(&self) -> &CompressedArray {
        &self.labels
    }

    /// 位置ラベルを展開
    pub fn positions(&self, cursor: usize, requested: usize) -> TrainResult<Vec<String>> {
        Ok(self.positions.decompress(cursor, requested)?)
    }

    /// ファイルから読み込み
    pub fn load<P: AsRef<Path>>(path: P) -> TrainResult<Self> {
        let file = File::open(path.as_ref())?;
        Self::read_from(&mut BufReader::new(file))
    }

    /// ファイルへ保存
    pub fn save<P: AsRef<Path>>(&self, path: P) -> TrainResult<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> TrainResult<()> {
        writer.write_all(MAGIC)?;
        writer.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        writer.write_u64::<LittleEndian>(self.total as u64)?;
        for array in [&self.features, &self.labels] {
            writer.write_u32::<LittleEndian>(array.width() as u32)?;
            write_blocks(writer, array.block_rows(), array.blocks())?;
        }
        write_blocks(writer, self.positions.block_rows(), self.positions.blocks())?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> TrainResult<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(truncated)?;
        if &magic != MAGIC {
            return Err(TrainError::DatasetFormat("bad magic, not a dataset blob".to_string()));
        }
        let version = reader.read_u32::<LittleEndian>().map_err(truncated)?;
        if version != FORMAT_VERSION {
            return Err(TrainError::DatasetFormat(format!("unsupported version {version}")));
        }
        let total = reader.read_u64::<LittleEndian>().map_err(truncated)? as usize;

        let mut arrays = Vec::with_capacity(2);
        for _ in 0..2 {
            let width = reader.read_u32::<LittleEndian>().map_err(truncated)? as usize;
            let (block_rows, blocks) = read_blocks(reader)?;
            arrays.push(CompressedArray::from_blocks(total, width, block_rows, blocks)?);
        }
        let (block_rows, blocks) = read_blocks(reader)?;
        let positions = PositionArray::from_blocks(total, block_rows, blocks)?;

        let labels = arrays.pop().ok_or_else(|| TrainError::DatasetFormat("missing labels".into()))?;
        let features =
            arrays.pop().ok_or_else(|| TrainError::DatasetFormat("missing features".into()))?;
        Self::new(features, labels, positions)
    }
}

fn truncated(e: std::io::Error) -> TrainError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TrainError::DatasetFormat("unexpected end of dataset blob".to_string())
    } else {
        TrainError::Io(e)
    }
}

fn write_blocks<W: Write>(writer: &mut W, block_rows: usize, blocks: &[Vec<u8>]) -> TrainResult<()> {
    writer.write_u32::<LittleEndian>(block_rows as u32)?;
    writer.write_u32::<LittleEndian>(blocks.len() as u32)?;
    for block in blocks {
        writer.write_u32::<LittleEndian>(block.len() as u32)?;
        writer.write_all(block)?;
    }
    Ok(())
}

fn read_blocks<R: Read>(reader: &mut R) -> TrainResult<(usize, Vec<Vec<u8>>)> {
    let block_rows = reader.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let count = reader.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let mut blocks = Vec::with_capacity(count.min(1 << 16));
    for i in 0..count {
        let len = reader.read_u32::<LittleEndian>().map_err(truncated)?;
        if len > MAX_BLOCK_BYTES {
            return Err(TrainError::DatasetFormat(format!("block {i} claims {len} bytes")));
        }
        let mut block = vec![0u8; len as usize];
        reader.read_exact(&mut block).map_err(truncated)?;
        blocks.push(block);
    }
    Ok((block_rows, blocks))
}
