//! 张量的 8 位灰度预览.

use std::path::Path;

use image::{GrayImage, Luma};
use ndarray::{Axis, Ix2};

use super::{Tensor, TensorError};

/// 将 `[0, 1]` 内的值映射为灰度, 越界值被截断.
#[inline]
fn gray(v: f64) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0) as u8
}

/// 将 `(height, width)` 视图画为灰度图.
fn draw(view: ndarray::ArrayView2<'_, f64>) -> GrayImage {
    let (height, width) = view.dim();
    let mut buf = GrayImage::new(width as u32, height as u32);
    for ((h, w), &pix) in view.indexed_iter() {
        buf.put_pixel(w as u32, h as u32, Luma([gray(pix)]));
    }
    buf
}

/// 预览图生成. 像素值为 `value * 255`, 因此通常在归一化之后调用.
impl Tensor {
    /// 二维张量 `[height, width]` 的灰度图.
    pub fn to_gray_image(&self) -> Result<GrayImage, TensorError> {
        let view = self
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| TensorError::RankMismatch {
                expected: 2,
                actual: self.rank(),
            })?;
        Ok(draw(view))
    }

    /// 三维张量 `[frame, height, width]` 第 `index` 帧的灰度图.
    ///
    /// 负索引从末尾计数, 即 `-1` 是最后一帧.
    pub fn frame_image(&self, index: isize) -> Result<GrayImage, TensorError> {
        if self.rank() != 3 {
            return Err(TensorError::RankMismatch {
                expected: 3,
                actual: self.rank(),
            });
        }
        let len = self.shape()[0];
        let frame = if index < 0 {
            len.checked_sub(index.unsigned_abs())
        } else {
            Some(index as usize).filter(|&i| i < len)
        }
        .ok_or(TensorError::IndexOutOfRange { index, len })?;

        let view = self
            .data
            .index_axis(Axis(0), frame)
            .into_dimensionality::<Ix2>()
            .map_err(|_| TensorError::RankMismatch {
                expected: 3,
                actual: self.rank(),
            })?;
        Ok(draw(view))
    }

    /// 三维张量每一帧的灰度图.
    pub fn frame_images(&self) -> Result<Vec<GrayImage>, TensorError> {
        let len = self.shape()[0] as isize;
        (0..len).map(|i| self.frame_image(i)).collect()
    }

    /// 将二维张量保存为灰度图片, 格式由扩展名决定.
    pub fn save_preview<P: AsRef<Path>>(&self, path: P) -> Result<(), TensorError> {
        self.to_gray_image()?.save(path)?;
        Ok(())
    }
}
