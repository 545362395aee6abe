//! 通用常量.

use std::time::Duration;

/// 复原模型固定输入: 探测器个数.
pub const NUM_DETECTORS: usize = 128;

/// 复原模型固定输入: 投影角度个数.
pub const NUM_ANGLES: usize = 120;

/// 复原模型固定输入: 切片个数. 同时也是送入重建引擎的切片窗口大小.
pub const NUM_SLICES: usize = 16;

/// 归一化时认为 "全部相等" 的阈值.
pub const EPSILON: f64 = 1e-8;

/// 重建完成时的进度值.
pub const PROGRESS_DONE: u8 = 100;

/// 默认重建图像分辨率 (正方形边长).
pub const DEFAULT_RESOLUTION: usize = 128;

/// 默认检查点间隔 (迭代次数).
pub const DEFAULT_CHECKPOINT_STRIDE: u32 = 10;

/// 默认任务名.
pub const DEFAULT_TASK_NAME: &str = "untitled_task";

/// 默认复原模型文件名.
pub const MODEL_FILE_NAME: &str = "ckpt_e40_0_p25.2163251814763.pth.onnx";

/// 任务文件扩展名.
pub const TASK_FILE_EXT: &str = "task";

/// 上层轮询任务状态的参考间隔.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
