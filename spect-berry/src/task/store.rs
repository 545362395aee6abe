//! 任务文件.
//!
//! 布局: 4 字节魔数 `SPRT`, 1 字节版本号, 之后是 zlib 压缩的 `bincode` 记录.
//! 投影不落盘, 读取时总由弦图置换得到.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::param::{Checkpoint, IteratorKind, ParamError, TaskParameter};
use crate::consts::TASK_FILE_EXT;
use crate::data::ParseKindError;
use crate::ingest::{FileFormat, Geometry, SinogramInfo};
use crate::{Acquisition, ElemType, Tensor, TensorError};

const MAGIC: &[u8; 4] = b"SPRT";
const VERSION: u8 = 1;

/// 任务文件读写错误.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O 错误.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// 不是任务文件.
    #[error("not a task file")]
    Magic,

    /// 不支持的版本.
    #[error("unsupported task file version {0}")]
    Version(u8),

    /// 编解码错误.
    #[error("task record codec: {0}")]
    Codec(#[from] bincode::Error),

    /// 未知的枚举标签.
    #[error(transparent)]
    Kind(#[from] ParseKindError),

    /// 数据块不构成合法张量.
    #[error(transparent)]
    Tensor(#[from] TensorError),

    /// 参数不满足约束.
    #[error(transparent)]
    Param(#[from] ParamError),

    /// 弦图维度与几何不符.
    #[error("sinogram dims {dims:?} disagree with geometry {geometry:?}")]
    Geometry {
        /// 弦图维度.
        dims: [usize; 3],
        /// 记录的几何.
        geometry: [usize; 3],
    },
}

#[derive(Serialize, Deserialize)]
struct SinogramBlock {
    dims: [usize; 3],
    data: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct TomographBlock {
    resolution: usize,
    iterations: Vec<u32>,
    images: Vec<Vec<f64>>,
}

#[derive(Serialize, Deserialize)]
struct TaskRecord {
    task_name: String,
    sysmat_path: PathBuf,
    sinogram_path: PathBuf,
    mumap_path: PathBuf,
    scatter_map_path: PathBuf,
    model_path: PathBuf,
    output_dir: PathBuf,

    iterator: u8,
    num_iters: u32,
    num_dual_iters: u32,
    lambda: f64,
    gamma: f64,
    coeff_scatter: f64,
    use_nn: bool,
    use_scatter_map: bool,
    checkpoint_stride: u32,
    resolution: usize,
    file_format: u8,
    data_type: u8,

    geometry: [usize; 3],
    index_sinogram: usize,
    index_projection: usize,
    info: Vec<(String, String)>,

    /// 仅在已加载时存在.
    sinogram: Option<SinogramBlock>,
    /// 仅在有重建结果时存在.
    tomographs: Option<TomographBlock>,
}

impl From<&TaskParameter> for TaskRecord {
    fn from(p: &TaskParameter) -> Self {
        let sinogram = p.sinogram().map(|s| SinogramBlock {
            dims: [s.shape()[0], s.shape()[1], s.shape()[2]],
            data: s.to_vec(),
        });
        // 结果的分辨率以图像自身为准, `resolution` 字段可能在重建后被修改.
        let tomographs = p.reconstructed().first().map(|first| TomographBlock {
            resolution: first.image.shape()[0],
            iterations: p.reconstructed().iter().map(|c| c.iteration).collect(),
            images: p.reconstructed().iter().map(|c| c.image.to_vec()).collect(),
        });
        Self {
            task_name: p.task_name().to_owned(),
            sysmat_path: p.sysmat_path.clone(),
            sinogram_path: p.sinogram_path.clone(),
            mumap_path: p.mumap_path.clone(),
            scatter_map_path: p.scatter_map_path.clone(),
            model_path: p.model_path.clone(),
            output_dir: p.output_dir.clone(),
            iterator: p.iterator.tag(),
            num_iters: p.num_iters,
            num_dual_iters: p.num_dual_iters,
            lambda: p.lambda,
            gamma: p.gamma,
            coeff_scatter: p.coeff_scatter,
            use_nn: p.use_nn,
            use_scatter_map: p.use_scatter_map,
            checkpoint_stride: p.checkpoint_stride,
            resolution: p.resolution,
            file_format: p.file_format.tag(),
            data_type: p.data_type.tag(),
            geometry: p.geometry().sinogram_shape(),
            index_sinogram: p.index_sinogram(),
            index_projection: p.index_projection(),
            info: p
                .sinogram_info()
                .iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
            sinogram,
            tomographs,
        }
    }
}

impl TryFrom<TaskRecord> for TaskParameter {
    type Error = StoreError;

    fn try_from(r: TaskRecord) -> Result<Self, Self::Error> {
        let mut p = TaskParameter::default();
        p.set_task_name(r.task_name)?;
        p.sysmat_path = r.sysmat_path;
        p.sinogram_path = r.sinogram_path;
        p.mumap_path = r.mumap_path;
        p.scatter_map_path = r.scatter_map_path;
        p.model_path = r.model_path;
        p.output_dir = r.output_dir;
        p.iterator = IteratorKind::from_tag(r.iterator)?;
        p.num_iters = r.num_iters;
        p.num_dual_iters = r.num_dual_iters;
        p.lambda = r.lambda;
        p.gamma = r.gamma;
        p.coeff_scatter = r.coeff_scatter;
        p.use_nn = r.use_nn;
        p.use_scatter_map = r.use_scatter_map;
        p.checkpoint_stride = r.checkpoint_stride;
        p.resolution = r.resolution;
        p.file_format = FileFormat::from_tag(r.file_format)?;
        p.data_type = ElemType::from_tag(r.data_type)?;

        let [s, a, d] = r.geometry;
        p.set_geometry(Geometry::new(s, a, d));

        if let Some(SinogramBlock { dims, data }) = r.sinogram {
            if dims != r.geometry {
                return Err(StoreError::Geometry {
                    dims,
                    geometry: r.geometry,
                });
            }
            let mut info = SinogramInfo::default();
            for (k, v) in r.info {
                info.set(k, v);
            }
            let sinogram = Tensor::from_shape_vec(&dims, data)?;
            p.restore_acquisition(Acquisition::from_sinogram(sinogram)?, info);
            p.set_index_sinogram(r.index_sinogram)?;
            p.set_index_projection(r.index_projection)?;
        }

        if let Some(TomographBlock {
            resolution,
            iterations,
            images,
        }) = r.tomographs
        {
            p.resolution = resolution;
            let results = iterations
                .into_iter()
                .zip(images)
                .map(|(iteration, data)| {
                    Tensor::from_shape_vec(&[resolution, resolution], data)
                        .map(|image| Checkpoint { iteration, image })
                })
                .collect::<Result<Vec<_>, _>>()?;
            p.set_reconstructed(results)?;
            p.resolution = r.resolution;
        }
        Ok(p)
    }
}

impl TaskParameter {
    /// 默认任务文件路径: `{解析后的输出目录}/{任务名}.task`.
    pub fn default_task_file(&self) -> PathBuf {
        let mut ans = self.resolved_output_dir();
        ans.push(format!("{}.{TASK_FILE_EXT}", self.task_name()));
        ans
    }

    /// 写入任务文件.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), StoreError> {
        let mut w = BufWriter::new(File::create(path.as_ref())?);
        w.write_all(MAGIC)?;
        w.write_all(&[VERSION])?;
        let mut e = ZlibEncoder::new(w, Compression::default());
        bincode::serialize_into(&mut e, &TaskRecord::from(self))?;
        e.finish()?.flush()?;
        Ok(())
    }

    /// 写入默认位置, 必要时创建目录. 返回文件路径.
    pub fn save(&self) -> Result<PathBuf, StoreError> {
        let path = self.default_task_file();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        self.save_to(&path)?;
        info!("task `{}` saved to `{}`", self.task_name(), path.display());
        Ok(path)
    }

    /// 读取任务文件.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut r = BufReader::new(File::open(path.as_ref())?);
        let mut head = [0u8; 5];
        r.read_exact(&mut head).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => StoreError::Magic,
            _ => StoreError::Io(e),
        })?;
        if &head[..4] != MAGIC {
            return Err(StoreError::Magic);
        }
        if head[4] != VERSION {
            return Err(StoreError::Version(head[4]));
        }
        let record: TaskRecord = bincode::deserialize_from(ZlibDecoder::new(r))?;
        record.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Ingested;

    fn loaded_param() -> TaskParameter {
        let data = (0..24).map(|x| (x * x) as f64).collect();
        let mut acquisition =
            Acquisition::from_projection(Tensor::from_shape_vec(&[3, 2, 4], data).unwrap())
                .unwrap();
        acquisition.normalize_in_place();
        let mut info = SinogramInfo::default();
        info.set("Number of Slices", 2);
        info.set("Modality", "NM");

        let mut p = TaskParameter::default();
        p.set_task_name("roundtrip").unwrap();
        p.sysmat_path = "/data/sysmat.bin".into();
        p.output_dir = "runs".into();
        p.iterator = IteratorKind::PapaContWavelet;
        p.num_iters = 40;
        p.lambda = 0.25;
        p.use_nn = true;
        p.file_format = FileFormat::RawSinogram;
        p.data_type = ElemType::Float64;
        p.load(Ingested { acquisition, info });
        p.set_index_sinogram(1).unwrap();
        p.set_index_projection(2).unwrap();
        p
    }

    #[test]
    fn test_roundtrip_unloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.task");
        let mut p = TaskParameter::default();
        p.set_geometry(Geometry::new(8, 60, 64));
        p.gamma = 0.5;
        p.save_to(&path).unwrap();
        assert_eq!(TaskParameter::load_from(&path).unwrap(), p);
    }

    #[test]
    fn test_roundtrip_loaded_with_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.task");
        let mut p = loaded_param();
        p.resolution = 2;
        p.set_reconstructed(vec![
            Checkpoint {
                iteration: 20,
                image: Tensor::from_shape_vec(&[2, 2], vec![0.0, 0.5, 1.0, 0.25]).unwrap(),
            },
            Checkpoint {
                iteration: 40,
                image: Tensor::from_shape_vec(&[2, 2], vec![1.0, 0.0, 0.5, 0.5]).unwrap(),
            },
        ])
        .unwrap();
        p.save_to(&path).unwrap();

        let back = TaskParameter::load_from(&path).unwrap();
        assert_eq!(back.projection(), p.projection());
        assert_eq!(back.index_projection(), 2);
        assert_eq!(back.sinogram_info().get("Modality"), Some("NM"));
        assert_eq!(back.reconstructed()[1].iteration, 40);
        assert_eq!(back, p);
    }

    #[test]
    fn test_roundtrip_resolution_edited_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.task");
        let mut p = loaded_param();
        p.resolution = 2;
        p.set_reconstructed(vec![Checkpoint {
            iteration: 40,
            image: Tensor::from_shape_vec(&[2, 2], vec![0.0, 0.5, 1.0, 0.25]).unwrap(),
        }])
        .unwrap();
        p.resolution = 4;
        p.save_to(&path).unwrap();

        let back = TaskParameter::load_from(&path).unwrap();
        assert_eq!(back.resolution, 4);
        assert_eq!(back.reconstructed()[0].image.shape(), &[2, 2]);
        assert_eq!(back, p);
    }

    #[test]
    fn test_reject_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.task");
        std::fs::write(&path, b"PK\x03\x04junk").unwrap();
        assert!(matches!(
            TaskParameter::load_from(&path),
            Err(StoreError::Magic)
        ));
        std::fs::write(&path, b"SP").unwrap();
        assert!(matches!(
            TaskParameter::load_from(&path),
            Err(StoreError::Magic)
        ));
        std::fs::write(&path, b"SPRT\x09").unwrap();
        assert!(matches!(
            TaskParameter::load_from(&path),
            Err(StoreError::Version(9))
        ));
    }

    #[test]
    fn test_reject_truncated_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.task");
        loaded_param().save_to(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(TaskParameter::load_from(&path).is_err());
    }

    #[test]
    fn test_default_task_file() {
        let mut p = TaskParameter::default();
        p.set_task_name("knee").unwrap();
        p.output_dir = std::env::temp_dir().join("spect-out");
        assert_eq!(
            p.default_task_file(),
            std::env::temp_dir().join("spect-out").join("knee.task")
        );

        let dir = tempfile::tempdir().unwrap();
        p.output_dir = dir.path().to_owned();
        let path = p.save().unwrap();
        assert!(path.exists());
        assert_eq!(TaskParameter::load_from(path).unwrap(), p);
    }
}
