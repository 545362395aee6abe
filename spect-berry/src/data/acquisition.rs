//! 弦图/投影视图对.

use super::{inverse_permutation, Tensor, TensorError};
use crate::Idx3d;

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::join;
    }
}

/// 由弦图 `[slice, angle, detector]` 得到投影 `[angle, slice, detector]` 的轴置换.
///
/// 该置换是对合 (自逆) 的.
pub const SINOGRAM_TO_PROJECTION: [usize; 3] = [1, 0, 2];

/// 同一次采集的两种布局.
///
/// 只能由其中一个视图构造, 另一个始终由置换派生, 二者不会各自分叉.
#[derive(Clone, Debug, PartialEq)]
pub struct Acquisition {
    sinogram: Tensor,
    projection: Tensor,
}

#[inline]
fn require_rank3(t: &Tensor) -> Result<(), TensorError> {
    match t.rank() {
        3 => Ok(()),
        actual => Err(TensorError::RankMismatch {
            expected: 3,
            actual,
        }),
    }
}

impl Acquisition {
    /// 由弦图构造, 并派生投影.
    pub fn from_sinogram(sinogram: Tensor) -> Result<Self, TensorError> {
        require_rank3(&sinogram)?;
        let projection = sinogram.permute(&SINOGRAM_TO_PROJECTION)?;
        Ok(Self {
            sinogram,
            projection,
        })
    }

    /// 由投影构造, 并以逆置换派生弦图.
    pub fn from_projection(projection: Tensor) -> Result<Self, TensorError> {
        require_rank3(&projection)?;
        let sinogram = projection.permute(&inverse_permutation(&SINOGRAM_TO_PROJECTION))?;
        Ok(Self {
            sinogram,
            projection,
        })
    }

    /// 弦图视图 `[slice, angle, detector]`.
    #[inline]
    pub fn sinogram(&self) -> &Tensor {
        &self.sinogram
    }

    /// 投影视图 `[angle, slice, detector]`.
    #[inline]
    pub fn projection(&self) -> &Tensor {
        &self.projection
    }

    /// 消费自我, 取出弦图.
    #[inline]
    pub fn into_sinogram(self) -> Tensor {
        self.sinogram
    }

    /// 按 (slice, angle, detector) 给出的形状.
    pub fn shape(&self) -> Idx3d {
        let s = self.sinogram.shape();
        (s[0], s[1], s[2])
    }

    /// 两个视图各自独立地做 min-max 归一化.
    ///
    /// 因为两者互为置换, 归一化的结果仍保持置换关系.
    pub fn normalize_in_place(&mut self) {
        let Self {
            sinogram,
            projection,
        } = self;
        #[cfg(feature = "rayon")]
        join(
            || sinogram.normalize_in_place(),
            || projection.normalize_in_place(),
        );
        #[cfg(not(feature = "rayon"))]
        {
            sinogram.normalize_in_place();
            projection.normalize_in_place();
        }
    }

    /// 截取以 `center` 为中心、长度为 `len` 的切片窗口 (深拷贝), 越界时向内平移.
    ///
    /// 返回窗口起点与窗口数据. 切片数不足 `len` 时返回全部切片.
    pub fn slice_window(&self, center: usize, len: usize) -> Result<(usize, Tensor), TensorError> {
        let total = self.sinogram.shape()[0];
        let start = window_start(center, len, total);
        let window = self.sinogram.slice_axis0(start, len.min(total))?;
        Ok((start, window))
    }
}

/// 在长度为 `total` 的轴上, 求以 `center` 为中心、长度为 `len` 的窗口起点.
///
/// 窗口总是完整落在 `[0, total)` 内; 若 `total <= len` 则从 0 开始.
pub fn window_start(center: usize, len: usize, total: usize) -> usize {
    if total <= len {
        return 0;
    }
    center.saturating_sub(len / 2).min(total - len)
}

#[cfg(test)]
mod tests {
    use super::{window_start, Acquisition};
    use crate::{Tensor, TensorError};

    fn iota(shape: &[usize]) -> Tensor {
        let n = shape.iter().product::<usize>();
        Tensor::from_shape_vec(shape, (0..n).map(|x| x as f64).collect()).unwrap()
    }

    #[test]
    fn test_views_agree() {
        let acq = Acquisition::from_sinogram(iota(&[2, 3, 4])).unwrap();
        assert_eq!(acq.shape(), (2, 3, 4));
        assert_eq!(acq.projection().shape(), &[3, 2, 4]);
        for s in 0..2 {
            for a in 0..3 {
                for d in 0..4 {
                    assert_eq!(acq.projection()[[a, s, d]], acq.sinogram()[[s, a, d]]);
                }
            }
        }
    }

    #[test]
    fn test_from_projection() {
        let proj = iota(&[3, 2, 4]);
        let acq = Acquisition::from_projection(proj.clone()).unwrap();
        assert_eq!(acq.sinogram().shape(), &[2, 3, 4]);
        assert_eq!(acq.projection(), &proj);
        assert_eq!(Acquisition::from_sinogram(acq.sinogram().clone()).unwrap(), acq);
    }

    #[test]
    fn test_rank_checked() {
        assert!(matches!(
            Acquisition::from_sinogram(iota(&[2, 3])),
            Err(TensorError::RankMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_normalize_keeps_relation() {
        let mut acq = Acquisition::from_sinogram(iota(&[2, 2, 3])).unwrap();
        acq.normalize_in_place();
        assert_eq!(acq.sinogram().maximum(), 1.0);
        assert_eq!(acq.projection().maximum(), 1.0);
        assert_eq!(
            acq.sinogram().permute(&super::SINOGRAM_TO_PROJECTION).unwrap(),
            *acq.projection()
        );
    }

    #[test]
    fn test_window_start() {
        assert_eq!(window_start(0, 16, 64), 0);
        assert_eq!(window_start(8, 16, 64), 0);
        assert_eq!(window_start(30, 16, 64), 22);
        assert_eq!(window_start(63, 16, 64), 48);
        assert_eq!(window_start(100, 16, 64), 48);
        assert_eq!(window_start(3, 16, 4), 0);
    }

    #[test]
    fn test_slice_window() {
        let acq = Acquisition::from_sinogram(iota(&[6, 1, 1])).unwrap();
        let (start, w) = acq.slice_window(5, 4).unwrap();
        assert_eq!(start, 2);
        assert_eq!(w.to_vec(), vec![2.0, 3.0, 4.0, 5.0]);

        let (start, w) = acq.slice_window(1, 16).unwrap();
        assert_eq!(start, 0);
        assert_eq!(w.shape(), &[6, 1, 1]);
    }
}
