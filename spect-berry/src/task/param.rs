//! 任务参数集合.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::config;
use crate::consts::{DEFAULT_CHECKPOINT_STRIDE, DEFAULT_RESOLUTION, DEFAULT_TASK_NAME};
use crate::data::ParseKindError;
use crate::ingest::{FileFormat, Geometry, Ingested, SinogramInfo};
use crate::{Acquisition, ElemType, Tensor};

/// 迭代重建算法.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum IteratorKind {
    /// 极大似然期望最大化.
    #[default]
    Mlem,
    /// 带 Tikhonov 正则的 EM.
    EmTikhonov,
    /// 二维小波正则的 PAPA.
    Papa2dWavelet,
    /// 连续 PAPA.
    PapaCont,
    /// 连续 PAPA, TV 正则.
    PapaContTv,
    /// 连续 PAPA, 小波正则.
    PapaContWavelet,
    /// 动态 PAPA.
    PapaDynamic,
    /// TV 正则的 PAPA.
    PapaTv,
}

impl IteratorKind {
    /// 所有算法, 顺序即持久化标签.
    pub const ALL: [IteratorKind; 8] = [
        Self::Mlem,
        Self::EmTikhonov,
        Self::Papa2dWavelet,
        Self::PapaCont,
        Self::PapaContTv,
        Self::PapaContWavelet,
        Self::PapaDynamic,
        Self::PapaTv,
    ];

    /// 显示名称.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mlem => "MLEM",
            Self::EmTikhonov => "EM-Tikhonov",
            Self::Papa2dWavelet => "PAPA-2DWavelet",
            Self::PapaCont => "PAPA-Cont",
            Self::PapaContTv => "PAPA-Cont-TV",
            Self::PapaContWavelet => "PAPA-Cont-Wavelet",
            Self::PapaDynamic => "PAPA-Dynamic",
            Self::PapaTv => "PAPA-TV",
        }
    }

    /// 任务文件中的持久化标签.
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// 由持久化标签还原.
    pub fn from_tag(tag: u8) -> Result<Self, ParseKindError> {
        Self::ALL
            .get(tag as usize)
            .copied()
            .ok_or(ParseKindError::Tag {
                kind: "iterator",
                tag,
            })
    }
}

impl fmt::Display for IteratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IteratorKind {
    type Err = ParseKindError;

    /// 大小写不敏感.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseKindError::Name {
                kind: "iterator",
                value: s.to_owned(),
            })
    }
}

/// 参数校验错误.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    /// 任务名为空或含空白字符.
    #[error("invalid task name `{0}`")]
    TaskName(String),

    /// 光标越界, 或尚未加载数据.
    #[error("{axis} index {index} out of range 0..{len}")]
    Cursor {
        /// 光标所在的轴.
        axis: &'static str,
        /// 请求的索引.
        index: usize,
        /// 轴长度.
        len: usize,
    },

    /// 重建结果与分辨率不符.
    #[error("result of shape {0:?} does not match resolution")]
    ResultShape(Vec<usize>),
}

/// 一个检查点: 迭代序号与 `[resolution, resolution]` 的重建图像.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    /// 迭代序号.
    pub iteration: u32,
    /// 重建图像 (已归一化).
    pub image: Tensor,
}

/// 重建任务的全部参数, 以及已加载的数据和结果.
///
/// 公有字段可以随意编辑; 带约束的字段通过方法访问.
/// 运行期间对它的修改不会影响正在进行的重建.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskParameter {
    task_name: String,

    /// 系统矩阵.
    pub sysmat_path: PathBuf,
    /// 输入弦图/投影文件.
    pub sinogram_path: PathBuf,
    /// 衰减图.
    pub mumap_path: PathBuf,
    /// 散射图.
    pub scatter_map_path: PathBuf,
    /// 复原模型.
    pub model_path: PathBuf,
    /// 输出目录. 相对路径见 [`config::resolve_output_dir`].
    pub output_dir: PathBuf,

    /// 迭代算法.
    pub iterator: IteratorKind,
    /// 迭代次数.
    pub num_iters: u32,
    /// 对偶迭代次数.
    pub num_dual_iters: u32,
    /// 正则化权重.
    pub lambda: f64,
    /// 步长参数.
    pub gamma: f64,
    /// 散射系数.
    pub coeff_scatter: f64,
    /// 是否先经过复原模型.
    pub use_nn: bool,
    /// 是否使用散射图.
    pub use_scatter_map: bool,
    /// 检查点间隔.
    pub checkpoint_stride: u32,
    /// 重建图像边长.
    pub resolution: usize,

    /// 输入文件格式.
    pub file_format: FileFormat,
    /// 原始文件元素类型.
    pub data_type: ElemType,

    geometry: Geometry,
    acquisition: Option<Acquisition>,
    sinogram_info: SinogramInfo,
    reconstructed: Vec<Checkpoint>,
    index_sinogram: usize,
    index_projection: usize,
}

impl Default for TaskParameter {
    fn default() -> Self {
        Self {
            task_name: DEFAULT_TASK_NAME.to_owned(),
            sysmat_path: PathBuf::new(),
            sinogram_path: PathBuf::new(),
            mumap_path: PathBuf::new(),
            scatter_map_path: PathBuf::new(),
            model_path: config::default_model_path(),
            output_dir: PathBuf::new(),
            iterator: IteratorKind::default(),
            num_iters: 100,
            num_dual_iters: 1,
            lambda: 0.1,
            gamma: 0.01,
            coeff_scatter: 0.5,
            use_nn: false,
            use_scatter_map: false,
            checkpoint_stride: DEFAULT_CHECKPOINT_STRIDE,
            resolution: DEFAULT_RESOLUTION,
            file_format: FileFormat::default(),
            data_type: ElemType::default(),
            geometry: Geometry::default(),
            acquisition: None,
            sinogram_info: SinogramInfo::default(),
            reconstructed: Vec::new(),
            index_sinogram: 0,
            index_projection: 0,
        }
    }
}

/// 任务名是否合法: 非空且不含空白字符.
#[inline]
pub fn is_valid_task_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(char::is_whitespace)
}

impl TaskParameter {
    /// 任务名.
    #[inline]
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// 设置任务名. 含空白字符的名字被拒绝.
    pub fn set_task_name<S: Into<String>>(&mut self, name: S) -> Result<(), ParamError> {
        let name = name.into();
        if !is_valid_task_name(&name) {
            return Err(ParamError::TaskName(name));
        }
        self.task_name = name;
        Ok(())
    }

    /// 采集几何. 加载数据后总与弦图形状一致.
    #[inline]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// 设置读取原始文件时使用的几何. 已加载的数据会被丢弃.
    pub fn set_geometry(&mut self, geometry: Geometry) {
        if geometry != self.geometry {
            self.clear_acquisition();
        }
        self.geometry = geometry;
    }

    /// 已加载的视图对.
    #[inline]
    pub fn acquisition(&self) -> Option<&Acquisition> {
        self.acquisition.as_ref()
    }

    /// 已加载的弦图.
    #[inline]
    pub fn sinogram(&self) -> Option<&Tensor> {
        self.acquisition.as_ref().map(Acquisition::sinogram)
    }

    /// 已加载的投影.
    #[inline]
    pub fn projection(&self) -> Option<&Tensor> {
        self.acquisition.as_ref().map(Acquisition::projection)
    }

    /// 是否已加载数据.
    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.acquisition.is_some()
    }

    /// 读取时记录的元信息.
    #[inline]
    pub fn sinogram_info(&self) -> &SinogramInfo {
        &self.sinogram_info
    }

    /// 装入一次成功读取的结果. 几何随之更新, 光标复位, 旧结果被丢弃.
    pub fn load(&mut self, ingested: Ingested) {
        self.geometry = ingested.geometry();
        self.acquisition = Some(ingested.acquisition);
        self.sinogram_info = ingested.info;
        self.index_sinogram = 0;
        self.index_projection = 0;
        self.reconstructed.clear();
    }

    /// 直接装入弦图 (例如从任务文件恢复). 投影由置换派生.
    pub(crate) fn restore_acquisition(&mut self, acquisition: Acquisition, info: SinogramInfo) {
        self.geometry = acquisition.shape().into();
        self.acquisition = Some(acquisition);
        self.sinogram_info = info;
    }

    fn clear_acquisition(&mut self) {
        self.acquisition = None;
        self.sinogram_info = SinogramInfo::default();
        self.index_sinogram = 0;
        self.index_projection = 0;
    }

    /// 重建结果, 按检查点顺序, 最后一个为最终结果.
    #[inline]
    pub fn reconstructed(&self) -> &[Checkpoint] {
        &self.reconstructed
    }

    /// 替换重建结果. 每个结果必须是 `[resolution, resolution]`.
    pub fn set_reconstructed(&mut self, results: Vec<Checkpoint>) -> Result<(), ParamError> {
        let expected = [self.resolution, self.resolution];
        if let Some(bad) = results.iter().find(|c| c.image.shape() != expected) {
            return Err(ParamError::ResultShape(bad.image.shape().to_vec()));
        }
        self.reconstructed = results;
        Ok(())
    }

    pub(crate) fn clear_reconstructed(&mut self) {
        self.reconstructed.clear();
    }

    /// 当前显示的弦图切片.
    #[inline]
    pub fn index_sinogram(&self) -> usize {
        self.index_sinogram
    }

    /// 当前显示的投影角度.
    #[inline]
    pub fn index_projection(&self) -> usize {
        self.index_projection
    }

    /// 设置弦图光标, 必须落在 `[0, num_slices)` 内.
    pub fn set_index_sinogram(&mut self, index: usize) -> Result<(), ParamError> {
        self.check_cursor("slice", index, self.geometry.num_slices)?;
        self.index_sinogram = index;
        Ok(())
    }

    /// 设置投影光标, 必须落在 `[0, num_angles)` 内.
    pub fn set_index_projection(&mut self, index: usize) -> Result<(), ParamError> {
        self.check_cursor("angle", index, self.geometry.num_angles)?;
        self.index_projection = index;
        Ok(())
    }

    fn check_cursor(&self, axis: &'static str, index: usize, len: usize) -> Result<(), ParamError> {
        let len = if self.is_loaded() { len } else { 0 };
        if index >= len && !(index == 0 && len == 0) {
            return Err(ParamError::Cursor { axis, index, len });
        }
        Ok(())
    }

    /// 解析后的输出目录.
    pub fn resolved_output_dir(&self) -> PathBuf {
        config::resolve_output_dir(&self.output_dir, &self.task_name)
    }
}
