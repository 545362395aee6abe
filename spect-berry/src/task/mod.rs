//! 重建任务与其生命周期.
//!
//! ```text
//! Init -> Loaded -> Running -> { Completed | FailedToReconstruct }
//!                      ^                   |
//!                      +------ start ------+
//! ```
//!
//! 运行结束后的状态只由最终进度决定: 等于 100 为 `Completed`, 否则为
//! `FailedToReconstruct`. 引擎主动提前结束与引擎出错不做区分.

use std::path::Path;
use std::sync::Arc;

use image::GrayImage;
use log::{info, warn};
use once_cell::unsync::OnceCell;
use thiserror::Error;

use crate::consts::PROGRESS_DONE;
use crate::engine::Backend;
use crate::ingest::{self, FileFormat, Geometry, IngestStatus, NiftiReader, VendorReader};
use crate::{ElemType, TensorError};

mod exec;
mod manager;
mod param;
mod store;

use exec::{Execution, RunOutput, Snapshot};

pub use exec::MODEL_INPUT_SHAPE;
pub use manager::{TaskHandle, TaskManager};
pub use param::{is_valid_task_name, Checkpoint, IteratorKind, ParamError, TaskParameter};
pub use store::StoreError;

/// 任务状态.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TaskStatus {
    /// 尚未加载数据.
    Init,
    /// 已加载数据, 未在运行.
    Loaded,
    /// 正在运行.
    Running,
    /// 上一次运行完整结束.
    Completed,
    /// 上一次运行未达到 100% 进度.
    FailedToReconstruct,
}

/// 任务操作错误.
#[derive(Debug, Error)]
pub enum TaskError {
    /// 尚未加载数据, 无法启动.
    #[error("task `{0}` has no sinogram loaded")]
    NotLoaded(String),

    /// 后台线程无法创建.
    #[error("cannot spawn reconstruction thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// 结果索引越界.
    #[error("result {index} out of range 0..{len}")]
    NoResult {
        /// 请求的索引.
        index: usize,
        /// 结果个数.
        len: usize,
    },

    /// 预览生成失败.
    #[error(transparent)]
    Tensor(#[from] TensorError),

    /// 任务句柄不存在.
    #[error("no such task {0:?}")]
    NoSuchTask(TaskHandle),
}

/// 一个重建任务: 参数集合、一个执行槽, 以及上一次运行的结果.
pub struct Task {
    parameter: TaskParameter,
    execution: Option<Execution>,
    /// 上一次运行结束时的进度.
    last_progress: Option<u8>,
    fault: Option<String>,
    completion_pending: bool,
    previews: Vec<OnceCell<GrayImage>>,
}

impl Default for Task {
    fn default() -> Self {
        Self::from_parameter(TaskParameter::default())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.parameter.task_name())
            .field("running", &self.execution.is_some())
            .field("last_progress", &self.last_progress)
            .field("fault", &self.fault)
            .finish()
    }
}

impl Task {
    /// 新建空任务, 状态为 [`TaskStatus::Init`].
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 由已有参数 (例如读自任务文件) 建立任务. 已有的重建结果保留.
    pub fn from_parameter(parameter: TaskParameter) -> Self {
        let previews = parameter
            .reconstructed()
            .iter()
            .map(|_| OnceCell::new())
            .collect();
        Self {
            parameter,
            execution: None,
            last_progress: None,
            fault: None,
            completion_pending: false,
            previews,
        }
    }

    /// 读取任务文件.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        TaskParameter::load_from(path).map(Self::from_parameter)
    }

    /// 任务名.
    #[inline]
    pub fn name(&self) -> &str {
        self.parameter.task_name()
    }

    /// 参数.
    #[inline]
    pub fn parameter(&self) -> &TaskParameter {
        &self.parameter
    }

    /// 可编辑的参数. 运行期间的修改只影响下一次运行.
    #[inline]
    pub fn parameter_mut(&mut self) -> &mut TaskParameter {
        &mut self.parameter
    }

    /// 读取数据文件, 厂商格式使用 [`NiftiReader`].
    pub fn ingest(
        &mut self,
        path: &Path,
        format: FileFormat,
        geometry: Geometry,
        elem: ElemType,
    ) -> IngestStatus {
        self.ingest_with(path, format, geometry, elem, &NiftiReader)
    }

    /// 读取数据文件, 厂商格式使用 `vendor`.
    ///
    /// 失败时参数保持不变. 成功时记录路径、格式与元素类型; 若当前没有运行,
    /// 上一次运行的结果被丢弃, 任务回到 [`TaskStatus::Loaded`].
    pub fn ingest_with(
        &mut self,
        path: &Path,
        format: FileFormat,
        geometry: Geometry,
        elem: ElemType,
        vendor: &dyn VendorReader,
    ) -> IngestStatus {
        match ingest::ingest(path, format, geometry, elem, vendor) {
            Ok(ingested) => {
                self.sync();
                self.parameter.sinogram_path = path.to_owned();
                self.parameter.file_format = format;
                self.parameter.data_type = elem;
                self.parameter.load(ingested);
                if self.execution.is_none() {
                    self.reset_outcome();
                }
                IngestStatus::Ok
            }
            Err(e) => {
                warn!("task `{}`: {e}", self.name());
                e.status()
            }
        }
    }

    /// 启动后台运行.
    ///
    /// 已在运行时什么也不做, 返回 `Ok(false)`. 否则清除上一次的结果,
    /// 对参数做快照后启动, 返回 `Ok(true)`.
    pub fn start(&mut self, backend: Arc<dyn Backend>) -> Result<bool, TaskError> {
        self.sync();
        if self.execution.is_some() {
            return Ok(false);
        }
        let snapshot = Snapshot::capture(&self.parameter)
            .ok_or_else(|| TaskError::NotLoaded(self.name().to_owned()))?;
        self.parameter.clear_reconstructed();
        self.reset_outcome();
        self.execution = Some(Execution::launch(snapshot, backend)?);
        Ok(true)
    }

    fn reset_outcome(&mut self) {
        self.last_progress = None;
        self.fault = None;
        self.completion_pending = false;
        self.previews.clear();
    }

    /// 收取已结束运行的产出. 本次调用中运行恰好结束时返回 `true`.
    pub fn sync(&mut self) -> bool {
        let Some(out) = self.execution.as_mut().and_then(Execution::try_finish) else {
            return false;
        };
        self.execution = None;
        self.absorb(out);
        true
    }

    /// 阻塞直至当前运行结束 (若有), 返回最终状态.
    pub fn wait(&mut self) -> TaskStatus {
        if let Some(exec) = self.execution.take() {
            let out = exec.wait();
            self.absorb(out);
        }
        self.status()
    }

    fn absorb(&mut self, out: RunOutput) {
        let RunOutput {
            progress,
            checkpoints,
            fault,
        } = out;
        if let Some(res) = checkpoints.first().map(|c| c.image.shape()[0]) {
            if res != self.parameter.resolution {
                warn!(
                    "task `{}`: resolution changed during run, keeping {res}",
                    self.name()
                );
                self.parameter.resolution = res;
            }
        }
        if let Err(e) = self.parameter.set_reconstructed(checkpoints) {
            warn!("task `{}`: results dropped: {e}", self.name());
        }
        self.previews = self
            .parameter
            .reconstructed()
            .iter()
            .map(|_| OnceCell::new())
            .collect();
        self.last_progress = Some(progress);
        self.fault = fault;
        self.completion_pending = true;
        info!(
            "task `{}` {}",
            self.name(),
            if progress == PROGRESS_DONE {
                "completed"
            } else {
                "failed"
            }
        );
    }

    /// 当前状态.
    pub fn status(&mut self) -> TaskStatus {
        self.sync();
        if self.execution.is_some() {
            TaskStatus::Running
        } else if let Some(p) = self.last_progress {
            if p == PROGRESS_DONE {
                TaskStatus::Completed
            } else {
                TaskStatus::FailedToReconstruct
            }
        } else if self.parameter.is_loaded() {
            TaskStatus::Loaded
        } else {
            TaskStatus::Init
        }
    }

    /// 当前进度. 运行中为实时进度, 完成后为 100, 其它状态为 0.
    pub fn progress(&mut self) -> u8 {
        match self.status() {
            TaskStatus::Running => self
                .execution
                .as_ref()
                .map_or(0, Execution::progress),
            TaskStatus::Completed => PROGRESS_DONE,
            _ => 0,
        }
    }

    /// 上一次运行的错误信息, 仅用于诊断.
    #[inline]
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    /// 上一次运行的结果, 按检查点顺序, 最后一个为最终结果.
    #[inline]
    pub fn results(&self) -> &[Checkpoint] {
        self.parameter.reconstructed()
    }

    /// 第 `index` 个结果的灰度预览. 首次访问时生成并缓存.
    pub fn result_preview(&self, index: usize) -> Result<&GrayImage, TaskError> {
        let len = self.results().len();
        let (cell, checkpoint) = self
            .previews
            .get(index)
            .zip(self.results().get(index))
            .ok_or(TaskError::NoResult { index, len })?;
        cell.get_or_try_init(|| checkpoint.image.to_gray_image())
            .map_err(TaskError::from)
    }

    /// 第 `index` 张弦图切片的预览. 负索引从末尾计数.
    pub fn sinogram_preview(&self, index: isize) -> Result<Option<GrayImage>, TaskError> {
        self.parameter
            .sinogram()
            .map(|t| t.frame_image(index))
            .transpose()
            .map_err(TaskError::from)
    }

    /// 第 `index` 个角度的投影预览. 负索引从末尾计数.
    pub fn projection_preview(&self, index: isize) -> Result<Option<GrayImage>, TaskError> {
        self.parameter
            .projection()
            .map(|t| t.frame_image(index))
            .transpose()
            .map_err(TaskError::from)
    }

    /// 取走一次性的完成通知.
    pub fn take_completion(&mut self) -> bool {
        self.sync();
        std::mem::take(&mut self.completion_pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{Gate, Script, ScriptedBackend};
    use std::io::Write;

    fn raw_sinogram(shape: [usize; 3], f: impl Fn(usize) -> f32) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..shape.iter().product::<usize>() {
            file.write_all(&f(i).to_le_bytes()).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn init_logger() {
        // 多个测试共用一个进程, 重复初始化会失败.
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Warn)
            .init();
    }

    fn loaded_task() -> (Task, tempfile::NamedTempFile) {
        init_logger();
        let file = raw_sinogram([4, 4, 4], |i| i as f32);
        let mut task = Task::new();
        task.parameter_mut().resolution = 2;
        task.parameter_mut().output_dir = std::env::temp_dir();
        let status = task.ingest(
            file.path(),
            FileFormat::RawSinogram,
            Geometry::new(4, 4, 4),
            ElemType::Float32,
        );
        assert_eq!(status, IngestStatus::Ok);
        (task, file)
    }

    fn backend(script: Script, gate: Arc<Gate>) -> Arc<ScriptedBackend> {
        ScriptedBackend::new(script, gate)
    }

    #[test]
    fn test_status_sequence_completed() {
        let mut task = Task::new();
        assert_eq!(task.status(), TaskStatus::Init);
        assert_eq!(task.progress(), 0);

        let (mut task, _file) = loaded_task();
        assert_eq!(task.status(), TaskStatus::Loaded);
        assert_eq!(task.parameter().sinogram_path, _file.path());

        let gate = Gate::closed();
        let b = backend(Script::default(), gate.clone());
        assert!(task.start(b.clone()).unwrap());
        assert_eq!(task.status(), TaskStatus::Running);
        assert!(!task.take_completion());

        gate.open();
        assert_eq!(task.wait(), TaskStatus::Completed);
        assert_eq!(task.progress(), 100);
        assert!(task.take_completion());
        assert!(!task.take_completion());
        assert!(task.fault().is_none());

        let tags: Vec<u32> = task.results().iter().map(|c| c.iteration).collect();
        assert_eq!(tags, vec![10, 20, 100]);
        assert_eq!(task.results()[0].image.shape(), &[2, 2]);
        assert_eq!(task.result_preview(2).unwrap().dimensions(), (2, 2));
        assert!(matches!(
            task.result_preview(3),
            Err(TaskError::NoResult { index: 3, len: 3 })
        ));
    }

    #[test]
    fn test_partial_progress_is_failure() {
        let (mut task, _file) = loaded_task();
        let script = Script {
            final_progress: 99,
            ..Script::default()
        };
        task.start(backend(script, Gate::opened())).unwrap();
        assert_eq!(task.wait(), TaskStatus::FailedToReconstruct);
        assert_eq!(task.progress(), 0);
        assert!(task.fault().is_none());
    }

    #[test]
    fn test_engine_error_at_full_progress_is_completed() {
        let (mut task, _file) = loaded_task();
        let script = Script {
            error: true,
            ..Script::default()
        };
        task.start(backend(script, Gate::opened())).unwrap();
        assert_eq!(task.wait(), TaskStatus::Completed);
        assert!(task.fault().unwrap().contains("scripted failure"));
    }

    #[test]
    fn test_engine_panic_is_failure() {
        let (mut task, _file) = loaded_task();
        let script = Script {
            panic: true,
            ..Script::default()
        };
        task.start(backend(script, Gate::opened())).unwrap();
        assert_eq!(task.wait(), TaskStatus::FailedToReconstruct);
        assert!(task.results().is_empty());
    }

    #[test]
    fn test_double_start_runs_once() {
        let (mut task, _file) = loaded_task();
        let gate = Gate::closed();
        let b = backend(Script::default(), gate.clone());
        assert!(task.start(b.clone()).unwrap());
        assert!(!task.start(b.clone()).unwrap());
        assert_eq!(task.status(), TaskStatus::Running);
        gate.open();
        assert_eq!(task.wait(), TaskStatus::Completed);
        assert_eq!(b.launches(), 1);
    }

    #[test]
    fn test_rerun_clears_results() {
        let (mut task, _file) = loaded_task();
        let b = backend(Script::default(), Gate::opened());
        task.start(b.clone()).unwrap();
        assert_eq!(task.wait(), TaskStatus::Completed);
        assert_eq!(task.results().len(), 3);

        let gate = Gate::closed();
        let b2 = backend(Script::default(), gate.clone());
        assert!(task.start(b2).unwrap());
        assert!(task.results().is_empty());
        assert_eq!(task.status(), TaskStatus::Running);
        gate.open();
        assert_eq!(task.wait(), TaskStatus::Completed);
        assert_eq!(task.results().len(), 3);
    }

    #[test]
    fn test_start_requires_data() {
        let mut task = Task::new();
        let b = backend(Script::default(), Gate::opened());
        assert!(matches!(task.start(b.clone()), Err(TaskError::NotLoaded(_))));
        assert_eq!(b.launches(), 0);
    }

    #[test]
    fn test_ingest_constant_sinogram() {
        let file = raw_sinogram([4, 4, 4], |_| 2.0);
        let mut task = Task::new();
        let status = task.ingest(
            file.path(),
            FileFormat::RawSinogram,
            Geometry::new(4, 4, 4),
            ElemType::Float32,
        );
        assert_eq!(status, IngestStatus::Ok);
        let sino = task.parameter().sinogram().unwrap();
        assert_ne!(sino.maximum(), 1.0);
        assert_eq!(sino.maximum(), 0.0);
        assert_eq!(sino.minimum(), 0.0);
    }

    #[test]
    fn test_failed_ingest_keeps_state() {
        let (mut task, _file) = loaded_task();
        let short = raw_sinogram([1, 1, 3], |i| i as f32);
        let before = task.parameter().clone();
        let status = task.ingest(
            short.path(),
            FileFormat::RawSinogram,
            Geometry::new(4, 4, 4),
            ElemType::Float32,
        );
        assert_eq!(status, IngestStatus::FailToParseFile);
        assert_eq!(task.parameter(), &before);
        assert_eq!(task.status(), TaskStatus::Loaded);
    }

    #[test]
    fn test_ingest_during_run_keeps_snapshot() {
        let (mut task, _file) = loaded_task();
        let gate = Gate::closed();
        let b = backend(Script::default(), gate.clone());
        task.start(b.clone()).unwrap();
        // 引擎配置完成后进度为 1.
        while task.progress() == 0 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let in_flight = b.last_block.lock().unwrap().clone().unwrap();

        let other = raw_sinogram([2, 4, 4], |i| (i % 5) as f32);
        let status = task.ingest(
            other.path(),
            FileFormat::RawSinogram,
            Geometry::new(2, 4, 4),
            ElemType::Float32,
        );
        assert_eq!(status, IngestStatus::Ok);
        assert_eq!(task.status(), TaskStatus::Running);

        gate.open();
        assert_eq!(task.wait(), TaskStatus::Completed);
        assert_eq!(task.parameter().geometry(), Geometry::new(2, 4, 4));
        assert_eq!(in_flight.shape(), &[4, 4, 4]);
        assert_eq!(task.results().len(), 3);
    }

    #[test]
    fn test_previews() {
        let (task, _file) = loaded_task();
        assert_eq!(task.sinogram_preview(-1).unwrap().unwrap().dimensions(), (4, 4));
        assert!(task.projection_preview(4).is_err());
        assert!(Task::new().sinogram_preview(0).unwrap().is_none());
    }

    #[test]
    fn test_load_from_file_keeps_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.task");
        let (mut task, _file) = loaded_task();
        task.start(backend(Script::default(), Gate::opened()))
            .unwrap();
        task.wait();
        task.parameter().save_to(&path).unwrap();

        let mut back = Task::load(&path).unwrap();
        assert_eq!(back.status(), TaskStatus::Loaded);
        assert_eq!(back.results().len(), 3);
        assert_eq!(
            back.result_preview(0).unwrap(),
            task.result_preview(0).unwrap()
        );
    }
}
