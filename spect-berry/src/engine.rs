//! 外部协作者边界: 重建引擎、复原模型.
//!
//! 二者都是同步、不可中断的调用, 只在后台执行线程上被调用.
//! 具体实现 (数值算法、推理运行时) 不在本 crate 内, 由 [`Backend`] 注入.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::consts::PROGRESS_DONE;
use crate::task::IteratorKind;
use crate::Tensor;

/// 引擎与复原模型错误.
#[derive(Debug, Error)]
pub enum EngineError {
    /// 配置被引擎拒绝.
    #[error("engine rejected configuration: {0}")]
    Configure(String),

    /// 运行期间出错.
    #[error("engine failed: {0}")]
    Run(String),

    /// 复原模型无法加载.
    #[error("cannot load model `{}`: {reason}", path.display())]
    Model {
        /// 模型路径.
        path: PathBuf,
        /// 原因.
        reason: String,
    },

    /// 复原模型推理失败.
    #[error("prediction failed: {0}")]
    Predict(String),

    /// 复原模型输出长度与输入不符.
    #[error("predictor returned {actual} elements, {expected} expected")]
    PredictLength {
        /// 期望长度.
        expected: usize,
        /// 实际长度.
        actual: usize,
    },
}

/// 单写者/多读者的进度单元, 取值 `0..=100`.
///
/// 写入只会使进度单调增加; 超过 100 的值被截断为 100.
#[derive(Clone, Debug, Default)]
pub struct Progress(Arc<AtomicU8>);

impl Progress {
    /// 新建值为 0 的进度单元.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 更新进度. 小于当前值的更新被忽略.
    #[inline]
    pub fn set(&self, value: u8) {
        self.0.fetch_max(value.min(PROGRESS_DONE), Ordering::Release);
    }

    /// 读取当前进度.
    #[inline]
    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    /// 是否已完成.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.get() == PROGRESS_DONE
    }
}

/// 交给引擎的完整配置. 全部为值, 不引用任何任务状态.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 切片窗口 `[slice, angle, detector]`, 可能已被复原模型处理.
    pub sinogram: Tensor,
    /// 系统矩阵路径.
    pub sysmat_path: PathBuf,
    /// 衰减图路径.
    pub mumap_path: PathBuf,
    /// 散射图路径.
    pub scatter_map_path: PathBuf,
    /// 是否使用散射图.
    pub use_scatter_map: bool,
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
    /// 重建图像高.
    pub rec_height: usize,
    /// 重建图像宽.
    pub rec_width: usize,
    /// 输出目录 (已解析为具体路径).
    pub output_dir: PathBuf,
    /// 任务名.
    pub task_name: String,
}

/// 重建引擎.
pub trait ReconEngine: Send {
    /// 载入配置. 每次运行前调用一次.
    fn configure(&mut self, config: &EngineConfig) -> Result<(), EngineError>;

    /// 运行重建, 阻塞直至结束.
    ///
    /// 引擎应随运行推进 `progress`, 并向 `results` 依次追加每个检查点的
    /// 扁平图像 (长度 `rec_height * rec_width`), 最后追加最终结果.
    /// 运行完整结束时进度应为 100.
    fn run(
        &mut self,
        progress: &Progress,
        results: &mut Vec<Vec<f64>>,
        checkpoint_stride: u32,
    ) -> Result<(), EngineError>;
}

/// 散射复原模型. 输入输出元素个数相同.
pub trait Predictor: Send {
    /// 推理.
    fn predict(&mut self, input: &[f32]) -> Result<Vec<f32>, EngineError>;
}

/// 为每次运行提供全新的引擎与复原模型实例.
pub trait Backend: Send + Sync {
    /// 新建一个重建引擎.
    fn engine(&self) -> Result<Box<dyn ReconEngine>, EngineError>;

    /// 加载 `model` 处的复原模型.
    fn predictor(&self, model: &Path) -> Result<Box<dyn Predictor>, EngineError>;
}

/// 按脚本运行的替身后端, 供任务相关测试使用.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Condvar, Mutex};

    /// 替身引擎的行为.
    #[derive(Clone, Debug)]
    pub(crate) struct Script {
        /// 运行结束时的进度.
        pub final_progress: u8,
        /// 产生的结果个数 (含最终结果).
        pub results: usize,
        /// 强制的结果长度; `None` 表示 `rec_height * rec_width`.
        pub result_len: Option<usize>,
        /// 运行结束时返回错误.
        pub error: bool,
        /// 运行时 panic.
        pub panic: bool,
        /// 复原模型多返回一个元素.
        pub bad_prediction: bool,
    }

    impl Default for Script {
        fn default() -> Self {
            Self {
                final_progress: PROGRESS_DONE,
                results: 3,
                result_len: None,
                error: false,
                panic: false,
                bad_prediction: false,
            }
        }
    }

    /// 闸门: 关闭时引擎在 `run` 中阻塞.
    #[derive(Default)]
    pub(crate) struct Gate {
        open: Mutex<bool>,
        cv: Condvar,
    }

    impl Gate {
        pub(crate) fn closed() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn opened() -> Arc<Self> {
            let g = Self::closed();
            g.open();
            g
        }

        pub(crate) fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.cv.notify_all();
        }

        fn pass(&self) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cv.wait(open).unwrap();
            }
        }
    }

    pub(crate) struct ScriptedBackend {
        pub script: Script,
        pub gate: Arc<Gate>,
        /// 已创建的引擎个数.
        pub launches: AtomicUsize,
        /// 复原模型被调用的次数.
        pub predictions: Arc<AtomicUsize>,
        /// 最近一次配置中的切片窗口.
        pub last_block: Arc<Mutex<Option<Tensor>>>,
    }

    impl ScriptedBackend {
        pub(crate) fn new(script: Script, gate: Arc<Gate>) -> Arc<Self> {
            Arc::new(Self {
                script,
                gate,
                launches: AtomicUsize::new(0),
                predictions: Arc::default(),
                last_block: Arc::default(),
            })
        }

        pub(crate) fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }
    }

    struct ScriptedEngine {
        script: Script,
        gate: Arc<Gate>,
        last_block: Arc<Mutex<Option<Tensor>>>,
        len: usize,
    }

    impl ReconEngine for ScriptedEngine {
        fn configure(&mut self, config: &EngineConfig) -> Result<(), EngineError> {
            self.len = config.rec_height * config.rec_width;
            *self.last_block.lock().unwrap() = Some(config.sinogram.clone());
            Ok(())
        }

        fn run(
            &mut self,
            progress: &Progress,
            results: &mut Vec<Vec<f64>>,
            _checkpoint_stride: u32,
        ) -> Result<(), EngineError> {
            progress.set(1);
            self.gate.pass();
            if self.script.panic {
                panic!("scripted engine panic");
            }
            let len = self.script.result_len.unwrap_or(self.len);
            for k in 0..self.script.results {
                results.push((0..len).map(|i| (i * (k + 1)) as f64).collect());
            }
            progress.set(self.script.final_progress);
            if self.script.error {
                return Err(EngineError::Run("scripted failure".into()));
            }
            Ok(())
        }
    }

    struct Doubler {
        bad: bool,
        calls: Arc<AtomicUsize>,
    }

    impl Predictor for Doubler {
        fn predict(&mut self, input: &[f32]) -> Result<Vec<f32>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut out: Vec<f32> = input.iter().map(|x| x * 2.0).collect();
            if self.bad {
                out.push(0.0);
            }
            Ok(out)
        }
    }

    impl Backend for ScriptedBackend {
        fn engine(&self) -> Result<Box<dyn ReconEngine>, EngineError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedEngine {
                script: self.script.clone(),
                gate: Arc::clone(&self.gate),
                last_block: Arc::clone(&self.last_block),
                len: 0,
            }))
        }

        fn predictor(&self, _model: &Path) -> Result<Box<dyn Predictor>, EngineError> {
            Ok(Box::new(Doubler {
                bad: self.script.bad_prediction,
                calls: Arc::clone(&self.predictions),
            }))
        }
    }
}
