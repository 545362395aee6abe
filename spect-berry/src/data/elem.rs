//! 原始数据文件的元素类型, 以及张量的持久化读写.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;

use ndarray::ArrayD;
use thiserror::Error;

use super::{Tensor, TensorError};

/// 闭合枚举 (元素类型、文件格式、迭代器等) 的解析错误.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseKindError {
    /// 无法识别的名称.
    #[error("unknown {kind} `{value}`")]
    Name {
        /// 枚举的种类.
        kind: &'static str,
        /// 输入的名称.
        value: String,
    },

    /// 无法识别的持久化标签.
    #[error("unknown {kind} tag {tag}")]
    Tag {
        /// 枚举的种类.
        kind: &'static str,
        /// 输入的标签.
        tag: u8,
    },
}

/// 原始文件中的数值元素类型. 文件均按小端序存储.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum ElemType {
    /// 单精度浮点数.
    #[default]
    Float32,

    /// 双精度浮点数.
    Float64,
}

impl ElemType {
    /// 单个元素的字节数.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    /// 显示名称.
    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }

    /// 任务文件中的持久化标签.
    #[inline]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Float32 => 0,
            Self::Float64 => 1,
        }
    }

    /// 由持久化标签还原.
    pub fn from_tag(tag: u8) -> Result<Self, ParseKindError> {
        match tag {
            0 => Ok(Self::Float32),
            1 => Ok(Self::Float64),
            tag => Err(ParseKindError::Tag {
                kind: "element type",
                tag,
            }),
        }
    }

    /// 将小端字节流解码为 `f64` 序列. 末尾不足一个元素的字节被忽略.
    fn decode(self, bytes: &[u8]) -> Vec<f64> {
        match self {
            Self::Float32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            Self::Float64 => bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        }
    }

    fn encode_into<W: Write>(self, v: f64, w: &mut W) -> std::io::Result<()> {
        match self {
            Self::Float32 => w.write_all(&(v as f32).to_le_bytes()),
            Self::Float64 => w.write_all(&v.to_le_bytes()),
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElemType {
    type Err = ParseKindError;

    /// 大小写不敏感. 同时接受 `f32`/`f64` 简写.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float32" | "f32" => Ok(Self::Float32),
            "float64" | "f64" | "double" => Ok(Self::Float64),
            _ => Err(ParseKindError::Name {
                kind: "element type",
                value: s.to_owned(),
            }),
        }
    }
}

/// 从 `path` 读取恰好 `count` 个 `elem` 类型的元素. 文件多余的部分被忽略.
fn read_raw(path: &Path, count: usize, elem: ElemType) -> Result<Vec<f64>, TensorError> {
    let expected = count.saturating_mul(elem.size());
    let file = File::open(path).map_err(|source| TensorError::CannotOpenFile {
        path: path.to_owned(),
        source,
    })?;
    let mut buf = Vec::with_capacity(expected);
    BufReader::new(file)
        .take(expected as u64)
        .read_to_end(&mut buf)?;
    if buf.len() < expected {
        return Err(TensorError::FileLength {
            path: path.to_owned(),
            expected,
            actual: buf.len(),
        });
    }
    Ok(elem.decode(&buf))
}

/// 持久化读写.
impl Tensor {
    /// 从原始二进制文件读取张量. 文件必须至少包含 `product(shape) * elem.size()` 字节.
    ///
    /// # 错误
    ///
    /// - 文件无法打开: [`TensorError::CannotOpenFile`];
    /// - 文件过短: [`TensorError::FileLength`];
    /// - 形状非法: [`TensorError::InvalidShape`].
    pub fn from_raw_file<P: AsRef<Path>>(
        path: P,
        shape: &[usize],
        elem: ElemType,
    ) -> Result<Self, TensorError> {
        let count = super::check_shape(shape)?;
        let data = read_raw(path.as_ref(), count, elem)?;
        Self::from_shape_vec(shape, data)
    }

    /// 按行优先序将张量以 `elem` 类型写入原始二进制文件 (小端).
    pub fn write_raw<P: AsRef<Path>>(&self, path: P, elem: ElemType) -> Result<(), TensorError> {
        let mut w = BufWriter::new(File::create(path.as_ref())?);
        for &v in self.iter() {
            elem.encode_into(v, &mut w)?;
        }
        w.flush()?;
        Ok(())
    }

    /// 以 `.npy` 格式保存.
    pub fn write_npy<P: AsRef<Path>>(&self, path: P) -> Result<(), TensorError> {
        ndarray_npy::write_npy(path, &self.data)?;
        Ok(())
    }

    /// 读取 `.npy` 格式的 `f64` 数组.
    pub fn read_npy<P: AsRef<Path>>(path: P) -> Result<Self, TensorError> {
        let data: ArrayD<f64> = ndarray_npy::read_npy(path)?;
        Self::from_array(data)
    }
}
