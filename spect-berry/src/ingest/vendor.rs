//! 厂商影像容器读取.

use std::path::Path;

use nifti::{IntoNdArray, NiftiError, NiftiObject, ReaderOptions};
use thiserror::Error;

use crate::{Tensor, TensorError};

/// 影像容器中的描述性标签. 缺失的标签为 `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VendorTags {
    /// 受检者.
    pub subject: Option<String>,
    /// 检查描述.
    pub study: Option<String>,
    /// 成像模态.
    pub modality: Option<String>,
}

/// 厂商读取器的解析结果.
#[derive(Clone, Debug)]
pub struct VendorImage {
    /// 投影帧 `[frame, height, width]`, 帧即角度.
    pub frames: Tensor,
    /// 描述性标签.
    pub tags: VendorTags,
}

/// 厂商读取器错误.
#[derive(Debug, Error)]
pub enum VendorError {
    /// 文件无法读取.
    #[error("cannot read `{}`: {reason}", path.display())]
    Read {
        /// 文件路径.
        path: std::path::PathBuf,
        /// 原因.
        reason: String,
    },

    /// 文件内容无法解析.
    #[error("cannot parse `{}`: {reason}", path.display())]
    Parse {
        /// 文件路径.
        path: std::path::PathBuf,
        /// 原因.
        reason: String,
    },

    /// 解析出的像素数据不构成合法张量.
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// 厂商影像容器读取器. 标签解析与像素平面的解码由实现者负责.
pub trait VendorReader {
    /// 解析 `path` 处的容器.
    fn parse(&self, path: &Path) -> Result<VendorImage, VendorError>;
}

/// 以 NIfTI 容器承载的投影序列.
///
/// 体数据按 `[W, H, F]` 存储, 读出后转换为 `[F, H, W]`.
/// 头部的 `descrip` 字段作为检查描述; 受检者与模态在 NIfTI 中没有对应字段.
#[derive(Copy, Clone, Debug, Default)]
pub struct NiftiReader;

impl NiftiReader {
    fn map_err(path: &Path, e: NiftiError) -> VendorError {
        let path = path.to_owned();
        let reason = e.to_string();
        match e {
            NiftiError::Io(_) => VendorError::Read { path, reason },
            _ => VendorError::Parse { path, reason },
        }
    }
}

impl VendorReader for NiftiReader {
    fn parse(&self, path: &Path) -> Result<VendorImage, VendorError> {
        let obj = ReaderOptions::new()
            .read_file(path)
            .map_err(|e| Self::map_err(path, e))?;

        let descrip = String::from_utf8_lossy(&obj.header().descrip[..])
            .trim_end_matches('\0')
            .trim()
            .to_owned();
        let tags = VendorTags {
            study: Some(descrip).filter(|s| !s.is_empty()),
            ..VendorTags::default()
        };

        let data = obj
            .into_volume()
            .into_ndarray::<f64>()
            .map_err(|e| Self::map_err(path, e))?;
        if data.ndim() != 3 {
            return Err(TensorError::RankMismatch {
                expected: 3,
                actual: data.ndim(),
            }
            .into());
        }

        // [W, H, F] -> [F, H, W].
        let frames = Tensor::from_array(data.permuted_axes([2, 1, 0].as_slice()))?;
        Ok(VendorImage { frames, tags })
    }
}
