//! 后台执行: 参数快照、复原、重建、结果整理.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, info, warn};

use super::param::{Checkpoint, TaskParameter};
use crate::consts::{NUM_ANGLES, NUM_DETECTORS, NUM_SLICES};
use crate::engine::{Backend, EngineConfig, EngineError, Progress};
use crate::Tensor;

/// 复原模型的固定输入形状.
pub const MODEL_INPUT_SHAPE: [usize; 3] = [NUM_SLICES, NUM_ANGLES, NUM_DETECTORS];

/// 一次运行所需的全部输入, 与任务参数完全解耦.
#[derive(Clone, Debug)]
pub(crate) struct Snapshot {
    config: EngineConfig,
    use_nn: bool,
    model_path: PathBuf,
    checkpoint_stride: u32,
}

impl Snapshot {
    /// 对参数做值快照. 切片窗口以弦图光标为中心, 共 [`NUM_SLICES`] 张.
    ///
    /// 尚未加载数据时返回 `None`.
    pub(crate) fn capture(p: &TaskParameter) -> Option<Self> {
        let acquisition = p.acquisition()?;
        let (start, sinogram) = acquisition
            .slice_window(p.index_sinogram(), NUM_SLICES)
            .ok()?;
        debug!(
            "task `{}`: slice window [{start}, {}) of {}",
            p.task_name(),
            start + sinogram.shape()[0],
            acquisition.shape().0
        );
        let config = EngineConfig {
            sinogram,
            sysmat_path: p.sysmat_path.clone(),
            mumap_path: p.mumap_path.clone(),
            scatter_map_path: p.scatter_map_path.clone(),
            use_scatter_map: p.use_scatter_map,
            iterator: p.iterator,
            num_iters: p.num_iters,
            num_dual_iters: p.num_dual_iters,
            lambda: p.lambda,
            gamma: p.gamma,
            coeff_scatter: p.coeff_scatter,
            rec_height: p.resolution,
            rec_width: p.resolution,
            output_dir: p.resolved_output_dir(),
            task_name: p.task_name().to_owned(),
        };
        Some(Self {
            config,
            use_nn: p.use_nn,
            model_path: p.model_path.clone(),
            checkpoint_stride: p.checkpoint_stride.max(1),
        })
    }

    /// 重建图像边长.
    #[inline]
    pub(crate) fn resolution(&self) -> usize {
        self.config.rec_height
    }
}

/// 一次运行的产出.
#[derive(Debug)]
pub(crate) struct RunOutput {
    /// 最终进度.
    pub progress: u8,
    /// 检查点与最终结果.
    pub checkpoints: Vec<Checkpoint>,
    /// 引擎/复原模型错误或 panic 信息. 仅用于诊断.
    pub fault: Option<String>,
}

/// 一个正在进行的后台运行.
pub(crate) struct Execution {
    progress: Progress,
    handle: Option<JoinHandle<()>>,
    rx: Receiver<RunOutput>,
}

impl Execution {
    /// 在新线程中开始运行 `snapshot`.
    pub(crate) fn launch(snapshot: Snapshot, backend: Arc<dyn Backend>) -> std::io::Result<Self> {
        let progress = Progress::new();
        let (tx, rx) = mpsc::channel();
        let worker_progress = progress.clone();
        let name = snapshot.config.task_name.clone();
        let handle = thread::Builder::new()
            .name(format!("recon-{name}"))
            .spawn(move || {
                let out = execute(snapshot, backend.as_ref(), &worker_progress);
                // 接收端可能已随任务一起被丢弃.
                let _ = tx.send(out);
            })?;
        info!("task `{name}` started");
        Ok(Self {
            progress,
            handle: Some(handle),
            rx,
        })
    }

    /// 当前进度.
    #[inline]
    pub(crate) fn progress(&self) -> u8 {
        self.progress.get()
    }

    /// 不阻塞地检查运行是否结束. 结束时返回产出, 之后不应再调用.
    pub(crate) fn try_finish(&mut self) -> Option<RunOutput> {
        match self.rx.try_recv() {
            Ok(out) => Some(self.join(out)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(self.join(self.lost())),
        }
    }

    /// 阻塞直至运行结束.
    pub(crate) fn wait(mut self) -> RunOutput {
        let out = self.rx.recv().unwrap_or_else(|_| self.lost());
        self.join(out)
    }

    fn lost(&self) -> RunOutput {
        RunOutput {
            progress: self.progress.get(),
            checkpoints: Vec::new(),
            fault: Some("worker exited without reporting".to_owned()),
        }
    }

    fn join(&mut self, out: RunOutput) -> RunOutput {
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                warn!("reconstruction worker panicked after reporting");
            }
        }
        out
    }
}

/// 工作线程主体. 引擎的 panic 被捕获并按错误处理.
fn execute(snapshot: Snapshot, backend: &dyn Backend, progress: &Progress) -> RunOutput {
    let name = snapshot.config.task_name.clone();
    let resolution = snapshot.resolution();
    let stride = snapshot.checkpoint_stride;
    let num_iters = snapshot.config.num_iters;
    let timer = Instant::now();

    let mut raw = Vec::new();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        reconstruct(snapshot, backend, progress, &mut raw)
    }));
    let fault = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(payload) => Some(panic_message(payload.as_ref())),
    };
    if let Some(f) = &fault {
        error!("task `{name}`: {f}");
    }

    let checkpoints = collect_results(raw, resolution, stride, num_iters);
    let progress = progress.get();
    info!(
        "task `{name}` finished in {:.3}s: progress {progress}, {} result(s)",
        timer.elapsed().as_secs_f64(),
        checkpoints.len()
    );
    RunOutput {
        progress,
        checkpoints,
        fault,
    }
}

fn reconstruct(
    snapshot: Snapshot,
    backend: &dyn Backend,
    progress: &Progress,
    raw: &mut Vec<Vec<f64>>,
) -> Result<(), EngineError> {
    let Snapshot {
        mut config,
        use_nn,
        model_path,
        checkpoint_stride,
    } = snapshot;

    if use_nn {
        if config.sinogram.shape() == MODEL_INPUT_SHAPE {
            let timer = Instant::now();
            config.sinogram = restore(&config.sinogram, backend, &model_path)?;
            info!(
                "restoration took {:.3}s",
                timer.elapsed().as_secs_f64()
            );
        } else {
            warn!(
                "restoration skipped: window {:?} does not match model input {MODEL_INPUT_SHAPE:?}",
                config.sinogram.shape()
            );
        }
    }

    let mut engine = backend.engine()?;
    engine.configure(&config)?;
    let timer = Instant::now();
    let ans = engine.run(progress, raw, checkpoint_stride);
    info!(
        "reconstruction took {:.3}s",
        timer.elapsed().as_secs_f64()
    );
    ans
}

/// L1 归一化后送入复原模型, 输出作为新的切片窗口.
fn restore(
    block: &Tensor,
    backend: &dyn Backend,
    model: &std::path::Path,
) -> Result<Tensor, EngineError> {
    let mut input = block.clone();
    input.l1_normalize_in_place();
    let input: Vec<f32> = input.iter().map(|&x| x as f32).collect();

    let mut predictor = backend.predictor(model)?;
    let output = predictor.predict(&input)?;
    if output.len() != input.len() {
        return Err(EngineError::PredictLength {
            expected: input.len(),
            actual: output.len(),
        });
    }
    Tensor::from_shape_vec(block.shape(), output.into_iter().map(f64::from).collect())
        .map_err(|e| EngineError::Predict(e.to_string()))
}

/// 整理引擎输出: 重排为 `[resolution, resolution]` 并归一化.
///
/// 第 `i` 个 (从 0 开始) 检查点标记为 `(i + 1) * stride`, 最后一个为最终结果,
/// 标记为 `num_iters`. 长度不符的数组被跳过.
pub(crate) fn collect_results(
    raw: Vec<Vec<f64>>,
    resolution: usize,
    stride: u32,
    num_iters: u32,
) -> Vec<Checkpoint> {
    let last = raw.len().saturating_sub(1);
    raw.into_iter()
        .enumerate()
        .filter_map(|(i, flat)| {
            let iteration = if i == last {
                num_iters
            } else {
                (i as u32 + 1).saturating_mul(stride)
            };
            match Tensor::from_shape_vec(&[resolution, resolution], flat) {
                Ok(mut image) => {
                    image.normalize_in_place();
                    Some(Checkpoint { iteration, image })
                }
                Err(e) => {
                    warn!("result #{i} skipped: {e}");
                    None
                }
            }
        })
        .collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let msg = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic");
    format!("engine panicked: {msg}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{Gate, Script, ScriptedBackend};
    use crate::ingest::{Ingested, SinogramInfo};
    use crate::Acquisition;
    use std::sync::atomic::Ordering;

    fn param(slices: usize) -> TaskParameter {
        let shape = [slices, NUM_ANGLES, NUM_DETECTORS];
        let n = shape.iter().product::<usize>();
        let t = Tensor::from_shape_vec(&shape, (0..n).map(|x| (x % 7) as f64).collect()).unwrap();
        let mut p = TaskParameter::default();
        p.output_dir = std::env::temp_dir();
        p.resolution = 4;
        p.num_iters = 30;
        p.load(Ingested {
            acquisition: Acquisition::from_sinogram(t).unwrap(),
            info: SinogramInfo::default(),
        });
        p
    }

    #[test]
    fn test_collect_results_tags() {
        let raw = vec![vec![0.0, 1.0, 2.0, 3.0]; 3];
        let out = collect_results(raw, 2, 10, 25);
        let tags: Vec<u32> = out.iter().map(|c| c.iteration).collect();
        assert_eq!(tags, vec![10, 20, 25]);
        assert!(out.iter().all(|c| c.image.maximum() == 1.0));
    }

    #[test]
    fn test_collect_results_skips_malformed() {
        let raw = vec![vec![1.0; 3], vec![0.0, 2.0, 4.0, 8.0]];
        let out = collect_results(raw, 2, 5, 50);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].iteration, 50);
        assert_eq!(out[0].image[[0, 1]], 0.25);
        assert!(collect_results(Vec::new(), 2, 5, 50).is_empty());
    }

    #[test]
    fn test_snapshot_window() {
        let mut p = param(40);
        p.set_index_sinogram(39).unwrap();
        let s = Snapshot::capture(&p).unwrap();
        assert_eq!(s.config.sinogram.shape(), &MODEL_INPUT_SHAPE);
        let expected = p.sinogram().unwrap().slice_axis0(24, 16).unwrap();
        assert_eq!(s.config.sinogram, expected);
        assert!(Snapshot::capture(&TaskParameter::default()).is_none());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut p = param(16);
        let s = Snapshot::capture(&p).unwrap();
        let before = s.config.sinogram.clone();
        p.num_iters = 1;
        p.set_geometry(crate::ingest::Geometry::new(1, 1, 1));
        assert_eq!(s.config.sinogram, before);
        assert_eq!(s.config.num_iters, 30);
    }

    #[test]
    fn test_execution_runs_restoration() {
        let mut p = param(16);
        p.use_nn = true;
        let backend = ScriptedBackend::new(Script::default(), Gate::opened());
        let exec = Execution::launch(Snapshot::capture(&p).unwrap(), backend.clone()).unwrap();
        let out = exec.wait();
        assert_eq!(out.progress, 100);
        assert!(out.fault.is_none());
        assert_eq!(out.checkpoints.len(), 3);
        assert_eq!(backend.predictions.load(Ordering::SeqCst), 1);

        // 复原输出 = L1 归一化输入 * 2, 其均值为 2.
        let block = backend.last_block.lock().unwrap().clone().unwrap();
        let mean = block.sum() / block.len() as f64;
        assert!((mean - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_execution_skips_restoration_on_shape() {
        let mut p = param(8);
        p.use_nn = true;
        let backend = ScriptedBackend::new(Script::default(), Gate::opened());
        let exec = Execution::launch(Snapshot::capture(&p).unwrap(), backend.clone()).unwrap();
        assert_eq!(exec.wait().progress, 100);
        assert_eq!(backend.predictions.load(Ordering::SeqCst), 0);
        assert_eq!(
            backend.last_block.lock().unwrap().as_ref(),
            p.sinogram()
        );
    }

    #[test]
    fn test_bad_prediction_is_a_fault() {
        let mut p = param(16);
        p.use_nn = true;
        let script = Script {
            bad_prediction: true,
            ..Script::default()
        };
        let backend = ScriptedBackend::new(script, Gate::opened());
        let out = Execution::launch(Snapshot::capture(&p).unwrap(), backend.clone())
            .unwrap()
            .wait();
        assert_eq!(out.progress, 0);
        assert!(out.fault.unwrap().contains("predictor returned"));
        assert_eq!(backend.launches(), 0);
    }

    #[test]
    fn test_engine_panic_is_caught() {
        let script = Script {
            panic: true,
            ..Script::default()
        };
        let backend = ScriptedBackend::new(script, Gate::opened());
        let out = Execution::launch(Snapshot::capture(&param(4)).unwrap(), backend)
            .unwrap()
            .wait();
        assert_eq!(out.progress, 1);
        assert!(out.checkpoints.is_empty());
        assert!(out.fault.unwrap().contains("scripted engine panic"));
    }
}
