//! 弦图/投影文件的读取与校验.
//!
//! 原始二进制文件按声明的几何与元素类型读取; 厂商容器委托给 [`VendorReader`].
//! 成功时两种视图均已归一化, 且附带可读的元信息报告.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use itertools::Itertools;
use log::{debug, info, warn};
use thiserror::Error;

use crate::consts::{NUM_ANGLES, NUM_DETECTORS, NUM_SLICES};
use crate::data::ParseKindError;
use crate::{Acquisition, ElemType, Idx3d, Tensor, TensorError};

mod vendor;

pub use vendor::{NiftiReader, VendorError, VendorImage, VendorReader, VendorTags};

/// 占位值, 用于缺失的描述性标签.
pub const UNKNOWN_TAG: &str = "Unknown";

/// 输入文件格式.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum FileFormat {
    /// 原始弦图 `[slice, angle, detector]`.
    RawSinogram,

    /// 原始投影 `[angle, slice, detector]`.
    #[default]
    RawProjection,

    /// 厂商影像容器, 帧为角度.
    VendorImage,
}

impl FileFormat {
    /// 所有格式.
    pub const ALL: [FileFormat; 3] = [Self::RawSinogram, Self::RawProjection, Self::VendorImage];

    /// 显示名称.
    pub const fn name(self) -> &'static str {
        match self {
            Self::RawSinogram => "RAW_SINOGRAM",
            Self::RawProjection => "RAW_PROJECTION",
            Self::VendorImage => "VENDOR_IMAGE",
        }
    }

    /// 任务文件中的持久化标签.
    pub const fn tag(self) -> u8 {
        match self {
            Self::RawSinogram => 0,
            Self::RawProjection => 1,
            Self::VendorImage => 2,
        }
    }

    /// 由持久化标签还原.
    pub fn from_tag(tag: u8) -> Result<Self, ParseKindError> {
        Self::ALL
            .into_iter()
            .find(|f| f.tag() == tag)
            .ok_or(ParseKindError::Tag {
                kind: "file format",
                tag,
            })
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FileFormat {
    type Err = ParseKindError;

    /// 大小写不敏感, `-` 与 `_` 等价.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "raw_sinogram" | "sinogram" => Ok(Self::RawSinogram),
            "raw_projection" | "projection" => Ok(Self::RawProjection),
            "vendor_image" | "vendor" | "dicom" | "nifti" => Ok(Self::VendorImage),
            _ => Err(ParseKindError::Name {
                kind: "file format",
                value: s.to_owned(),
            }),
        }
    }
}

/// 采集几何.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Geometry {
    /// 切片数.
    pub num_slices: usize,
    /// 角度数.
    pub num_angles: usize,
    /// 探测器数.
    pub num_detectors: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            num_slices: NUM_SLICES,
            num_angles: NUM_ANGLES,
            num_detectors: NUM_DETECTORS,
        }
    }
}

impl Geometry {
    /// 由 (slice, angle, detector) 构造.
    #[inline]
    pub const fn new(num_slices: usize, num_angles: usize, num_detectors: usize) -> Self {
        Self {
            num_slices,
            num_angles,
            num_detectors,
        }
    }

    /// 弦图形状 `[slice, angle, detector]`.
    #[inline]
    pub const fn sinogram_shape(&self) -> [usize; 3] {
        [self.num_slices, self.num_angles, self.num_detectors]
    }

    /// 投影形状 `[angle, slice, detector]`.
    #[inline]
    pub const fn projection_shape(&self) -> [usize; 3] {
        [self.num_angles, self.num_slices, self.num_detectors]
    }
}

impl From<Idx3d> for Geometry {
    fn from((s, a, d): Idx3d) -> Self {
        Self::new(s, a, d)
    }
}

/// 读取结果状态.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum IngestStatus {
    /// 成功.
    Ok,
    /// 文件无法读取.
    FailToReadFile,
    /// 文件内容无法解析, 或长度不足.
    FailToParseFile,
    /// 数据形状与期望不符.
    InvalidShape,
    /// 其它错误.
    Unknown,
}

/// 有序的键值元信息. 重复设置同一键时覆盖原值而不改变位置.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SinogramInfo {
    entries: Vec<(String, String)>,
}

impl SinogramInfo {
    /// 设置键值.
    pub fn set<K: Into<String>, V: ToString>(&mut self, key: K, value: V) {
        let key = key.into();
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key, value)),
        }
    }

    /// 查询键值.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// 按插入顺序迭代.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// 条目个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否没有任何条目.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 形如 `key: value\n` 的报告.
    pub fn report(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{k}: {v}\n"))
            .join("")
    }
}

impl fmt::Display for SinogramInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.report())
    }
}

/// 读取错误.
#[derive(Debug, Error)]
pub enum IngestError {
    /// 原始文件读取失败.
    #[error(transparent)]
    Tensor(#[from] TensorError),

    /// 厂商容器读取失败.
    #[error(transparent)]
    Vendor(#[from] VendorError),

    /// 厂商容器的帧数/宽度与期望的角度数/探测器数不符.
    #[error(
        "invalid shape (F: {frames}, H: {height}, W: {width}), \
         expected {expected_angles} frames of width {expected_detectors}"
    )]
    InvalidShape {
        /// 帧数.
        frames: usize,
        /// 帧高.
        height: usize,
        /// 帧宽.
        width: usize,
        /// 期望的角度数.
        expected_angles: usize,
        /// 期望的探测器数.
        expected_detectors: usize,
    },
}

impl IngestError {
    /// 对应的状态.
    pub fn status(&self) -> IngestStatus {
        match self {
            Self::Tensor(e) => tensor_status(e),
            Self::Vendor(VendorError::Read { .. }) => IngestStatus::FailToReadFile,
            Self::Vendor(VendorError::Parse { .. }) => IngestStatus::FailToParseFile,
            Self::Vendor(VendorError::Tensor(e)) => tensor_status(e),
            Self::InvalidShape { .. } => IngestStatus::InvalidShape,
        }
    }
}

fn tensor_status(e: &TensorError) -> IngestStatus {
    match e {
        TensorError::CannotOpenFile { .. } | TensorError::Io(_) => IngestStatus::FailToReadFile,
        TensorError::FileLength { .. } => IngestStatus::FailToParseFile,
        TensorError::InvalidShape(_)
        | TensorError::InconsistentShape { .. }
        | TensorError::RankMismatch { .. } => IngestStatus::InvalidShape,
        _ => IngestStatus::Unknown,
    }
}

/// 成功读取的结果. 两个视图均已归一化.
#[derive(Clone, Debug)]
pub struct Ingested {
    /// 弦图/投影视图对.
    pub acquisition: Acquisition,
    /// 元信息.
    pub info: SinogramInfo,
}

impl Ingested {
    /// 实际的采集几何.
    #[inline]
    pub fn geometry(&self) -> Geometry {
        self.acquisition.shape().into()
    }
}

/// 读取 `path`, 并按 `format` 解释.
///
/// 原始格式按 `geometry` 与 `elem` 读取; 厂商格式交给 `vendor`, 并校验
/// 帧数等于 `geometry.num_angles`, 帧宽等于 `geometry.num_detectors`.
pub fn ingest(
    path: &Path,
    format: FileFormat,
    geometry: Geometry,
    elem: ElemType,
    vendor: &dyn VendorReader,
) -> Result<Ingested, IngestError> {
    let mut info = SinogramInfo::default();
    let mut acquisition = match format {
        FileFormat::RawSinogram => {
            let t = Tensor::from_raw_file(path, &geometry.sinogram_shape(), elem)?;
            Acquisition::from_sinogram(t)?
        }
        FileFormat::RawProjection => {
            let t = Tensor::from_raw_file(path, &geometry.projection_shape(), elem)?;
            Acquisition::from_projection(t)?
        }
        FileFormat::VendorImage => {
            let VendorImage { frames, tags } = vendor.parse(path)?;
            debug!("vendor image `{}`: {:?}", path.display(), frames.shape());
            for (key, value) in [
                ("PatientName", tags.subject),
                ("StudyDescription", tags.study),
                ("Modality", tags.modality),
            ] {
                let value = value.unwrap_or_else(|| {
                    warn!("cannot read tag {key} of `{}`", path.display());
                    UNKNOWN_TAG.to_owned()
                });
                info.set(key, value);
            }
            let (frames_n, height, width) = match frames.shape() {
                &[f, h, w] => (f, h, w),
                other => {
                    return Err(TensorError::RankMismatch {
                        expected: 3,
                        actual: other.len(),
                    }
                    .into())
                }
            };
            if width != geometry.num_detectors || frames_n != geometry.num_angles {
                return Err(IngestError::InvalidShape {
                    frames: frames_n,
                    height,
                    width,
                    expected_angles: geometry.num_angles,
                    expected_detectors: geometry.num_detectors,
                });
            }
            Acquisition::from_projection(frames)?
        }
    };
    acquisition.normalize_in_place();

    let (s, a, d) = acquisition.shape();
    info.set("Number of Slices", s);
    info.set("Number of Detectors", d);
    info.set("Number of Angles", a);
    info!(
        "ingested `{}` as {format}: {s} slices, {a} angles, {d} detectors",
        path.display()
    );
    Ok(Ingested { acquisition, info })
}
