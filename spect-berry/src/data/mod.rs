use std::fmt::Write as _;
use std::ops::{Index, IndexMut};
use std::path::PathBuf;

use ndarray::{ArrayD, ArrayViewD, Axis, Dimension, IxDyn, Slice};
use thiserror::Error;

use crate::consts::EPSILON;

mod acquisition;
mod elem;
mod preview;

pub use acquisition::{window_start, Acquisition, SINOGRAM_TO_PROJECTION};
pub use elem::{ElemType, ParseKindError};

/// 张量操作错误.
#[derive(Debug, Error)]
pub enum TensorError {
    /// 原始数据文件无法打开.
    #[error("cannot open file `{}`: {source}", path.display())]
    CannotOpenFile {
        /// 文件路径.
        path: PathBuf,
        /// 底层 I/O 错误.
        source: std::io::Error,
    },

    /// 文件长度不足以填满声明的形状.
    #[error("file `{}` holds {actual} bytes, {expected} required", path.display())]
    FileLength {
        /// 文件路径.
        path: PathBuf,
        /// 需要的字节数.
        expected: usize,
        /// 实际读到的字节数.
        actual: usize,
    },

    /// 缓冲区长度与形状不符.
    #[error("shape {shape:?} needs {expected} elements, buffer holds {actual}")]
    InconsistentShape {
        /// 声明的形状.
        shape: Vec<usize>,
        /// 形状对应的元素个数.
        expected: usize,
        /// 缓冲区实际元素个数.
        actual: usize,
    },

    /// 形状非法: 秩为 0, 存在为 0 的维度, 或元素个数溢出.
    #[error("invalid shape {0:?}")]
    InvalidShape(Vec<usize>),

    /// 轴置换向量长度不符或不是 `[0, rank)` 的排列.
    #[error("{perm:?} is not a permutation of 0..{rank}")]
    InvalidPermutation {
        /// 置换向量.
        perm: Vec<usize>,
        /// 张量的秩.
        rank: usize,
    },

    /// 该操作要求特定的秩.
    #[error("rank {expected} required, got {actual}")]
    RankMismatch {
        /// 要求的秩.
        expected: usize,
        /// 实际的秩.
        actual: usize,
    },

    /// 索引越界.
    #[error("index {index} out of range for axis of length {len}")]
    IndexOutOfRange {
        /// 请求的索引 (允许为负, 代表从末尾计数).
        index: isize,
        /// 轴长度.
        len: usize,
    },

    /// 读写过程中的其它 I/O 错误.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// npy 写入错误.
    #[error(transparent)]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    /// npy 读取错误.
    #[error(transparent)]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    /// 图像保存错误.
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// 行优先存储的 `f64` 张量.
///
/// 形状的每一维都为正整数, 且秩至少为 1. 底层数据始终是标准 (C) 布局,
/// 因此 [`Tensor::into_raw_vec`] 得到的就是逻辑上的行优先序列.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: ArrayD<f64>,
}

/// 检查形状合法性, 返回元素个数.
fn check_shape(shape: &[usize]) -> Result<usize, TensorError> {
    if shape.is_empty() || shape.contains(&0) {
        return Err(TensorError::InvalidShape(shape.to_vec()));
    }
    shape
        .iter()
        .try_fold(1usize, |acc, &s| acc.checked_mul(s))
        .ok_or_else(|| TensorError::InvalidShape(shape.to_vec()))
}

/// `p` 是否是 `[0, rank)` 的一个排列.
fn is_permutation(p: &[usize], rank: usize) -> bool {
    if p.len() != rank {
        return false;
    }
    let mut seen = vec![false; rank];
    for &axis in p {
        match seen.get_mut(axis) {
            Some(s) if !*s => *s = true,
            _ => return false,
        }
    }
    true
}

/// 求置换 `p` 的逆置换. 满足 `inv[p[k]] == k`.
///
/// 调用者需保证 `p` 是合法排列, 否则结果无意义.
pub fn inverse_permutation(p: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; p.len()];
    for (k, &axis) in p.iter().enumerate() {
        if let Some(slot) = inv.get_mut(axis) {
            *slot = k;
        }
    }
    inv
}

impl Tensor {
    /// 按形状创建全零张量.
    pub fn zeros(shape: &[usize]) -> Result<Self, TensorError> {
        check_shape(shape)?;
        Ok(Self {
            data: ArrayD::zeros(IxDyn(shape)),
        })
    }

    /// 由形状与行优先缓冲区创建张量.
    ///
    /// 若 `data.len()` 与形状的元素个数不符, 返回 [`TensorError::InconsistentShape`].
    pub fn from_shape_vec(shape: &[usize], data: Vec<f64>) -> Result<Self, TensorError> {
        let expected = check_shape(shape)?;
        if expected != data.len() {
            return Err(TensorError::InconsistentShape {
                shape: shape.to_vec(),
                expected,
                actual: data.len(),
            });
        }
        let actual = data.len();
        let data = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| {
            TensorError::InconsistentShape {
                shape: shape.to_vec(),
                expected,
                actual,
            }
        })?;
        Ok(Self { data })
    }

    /// 由任意布局的 ndarray 数组创建张量. 会在必要时复制为标准布局.
    pub(crate) fn from_array(data: ArrayD<f64>) -> Result<Self, TensorError> {
        check_shape(data.shape())?;
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        debug_assert!(data.is_standard_layout());
        Ok(Self { data })
    }

    /// 形状.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// 秩 (维数).
    #[inline]
    pub fn rank(&self) -> usize {
        self.data.ndim()
    }

    /// 元素个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 是否为空. 合法张量总是非空的, 因此恒为 `false`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 行优先步长, 即形状的后缀积.
    pub fn strides(&self) -> Vec<usize> {
        let mut ans = vec![1; self.rank()];
        for p in (0..self.rank().saturating_sub(1)).rev() {
            ans[p] = ans[p + 1] * self.shape()[p + 1];
        }
        ans
    }

    /// 多维索引对应的线性偏移. 越界或维数不符时返回 `None`.
    pub fn offset_of(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.rank() {
            return None;
        }
        let mut offset = 0;
        for ((&i, &len), stride) in index.iter().zip(self.shape()).zip(self.strides()) {
            if i >= len {
                return None;
            }
            offset += i * stride;
        }
        Some(offset)
    }

    /// 线性偏移对应的多维索引. 越界时返回 `None`.
    pub fn index_of(&self, mut offset: usize) -> Option<Vec<usize>> {
        if offset >= self.len() {
            return None;
        }
        let ans = self
            .strides()
            .into_iter()
            .map(|stride| {
                let i = offset / stride;
                offset %= stride;
                i
            })
            .collect();
        Some(ans)
    }

    /// 获取给定位置的元素. 越界或维数不符时返回 `None`.
    #[inline]
    pub fn get(&self, index: &[usize]) -> Option<&f64> {
        self.data.get(index)
    }

    /// 获取给定位置的元素, 并可就地修改. 越界或维数不符时返回 `None`.
    #[inline]
    pub fn get_mut(&mut self, index: &[usize]) -> Option<&mut f64> {
        self.data.get_mut(index)
    }

    /// 轴置换. 结果满足 `shape'[k] == shape[p[k]]`, 且数据被完整复制为新的行优先布局.
    ///
    /// 若 `p` 不是 `[0, rank)` 的排列, 返回 [`TensorError::InvalidPermutation`].
    pub fn permute(&self, p: &[usize]) -> Result<Tensor, TensorError> {
        if !is_permutation(p, self.rank()) {
            return Err(TensorError::InvalidPermutation {
                perm: p.to_vec(),
                rank: self.rank(),
            });
        }
        let data = self
            .data
            .view()
            .permuted_axes(IxDyn(p))
            .as_standard_layout()
            .into_owned();
        Ok(Self { data })
    }

    /// 全局最小值.
    pub fn minimum(&self) -> f64 {
        self.data.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// 全局最大值.
    pub fn maximum(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// 所有元素之和.
    pub fn sum(&self) -> f64 {
        self.data.sum()
    }

    /// 就地 min-max 归一化.
    ///
    /// 先减去全局最小值, 再除以新的全局最大值. 若减法后最大值小于
    /// [`EPSILON`], 则跳过除法: 全部相等的数据保持减法后的值 (一般为 0).
    pub fn normalize_in_place(&mut self) {
        let min = self.minimum();
        self.map_inplace(move |x| x - min);
        let max = self.maximum();
        if max < EPSILON {
            return;
        }
        self.map_inplace(move |x| x / max);
    }

    /// 就地 L1 归一化: 每个元素除以全体元素的均值.
    ///
    /// 均值的绝对值小于 [`EPSILON`] 时不做任何修改.
    pub fn l1_normalize_in_place(&mut self) {
        let mean = self.sum() / self.len() as f64;
        if mean.abs() < EPSILON {
            return;
        }
        self.map_inplace(move |x| x / mean);
    }

    fn map_inplace<F>(&mut self, f: F)
    where
        F: Fn(f64) -> f64 + Sync + Send,
    {
        #[cfg(feature = "rayon")]
        self.data.par_mapv_inplace(f);
        #[cfg(not(feature = "rayon"))]
        self.data.mapv_inplace(f);
    }

    /// 沿第 0 轴截取 `[start, start + len)` 并深拷贝.
    pub fn slice_axis0(&self, start: usize, len: usize) -> Result<Tensor, TensorError> {
        let total = self.shape()[0];
        let end = start.saturating_add(len);
        if len == 0 || end > total {
            return Err(TensorError::IndexOutOfRange {
                index: end as isize,
                len: total,
            });
        }
        let data = self
            .data
            .slice_axis(Axis(0), Slice::from(start..end))
            .as_standard_layout()
            .into_owned();
        Ok(Self { data })
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn view(&self) -> ArrayViewD<'_, f64> {
        self.data.view()
    }

    /// 以行优先序迭代所有元素.
    #[inline]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &f64> {
        self.data.iter()
    }

    /// 复制出行优先序列.
    #[inline]
    pub fn to_vec(&self) -> Vec<f64> {
        self.data.iter().copied().collect()
    }

    /// 消费自我, 获得行优先序列.
    #[inline]
    pub fn into_raw_vec(self) -> Vec<f64> {
        self.data.into_raw_vec()
    }

    /// 逐元素文本转储, 每行形如 `(i, j, k, ): value`.
    ///
    /// 遍历时第 0 维变化最快, 与存储的行优先序相反.
    pub fn to_index_string(&self) -> String {
        let mut ans = String::new();
        // 转置视图的行优先遍历即原张量的列优先遍历, 下标需要反转回来.
        for (rev, v) in self.data.t().indexed_iter() {
            ans.push('(');
            for i in rev.slice().iter().rev() {
                let _ = write!(ans, "{i}, ");
            }
            let _ = writeln!(ans, "): {v}");
        }
        ans
    }
}

impl Index<&[usize]> for Tensor {
    type Output = f64;

    /// 越界时 panic.
    #[inline]
    fn index(&self, index: &[usize]) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<&[usize]> for Tensor {
    #[inline]
    fn index_mut(&mut self, index: &[usize]) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl<const N: usize> Index<[usize; N]> for Tensor {
    type Output = f64;

    /// 越界时 panic.
    #[inline]
    fn index(&self, index: [usize; N]) -> &Self::Output {
        &self.data[&index[..]]
    }
}

impl<const N: usize> IndexMut<[usize; N]> for Tensor {
    #[inline]
    fn index_mut(&mut self, index: [usize; N]) -> &mut Self::Output {
        &mut self.data[&index[..]]
    }
}
