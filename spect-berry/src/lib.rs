#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 管理离线 SPECT 断层重建任务: 读取探测器原始数据, 以多维张量表示,
//! 可选地经过外部复原模型, 交给外部重建引擎, 并收集中间与最终重建图像.
//!
//! 该 crate 仅提供 `safe` 接口. 重建算法本身、散射复原推理模型、
//! 厂商影像容器解析均视为外部协作者, 以 trait 的形式接入.
//!
//! # 注意
//!
//! 1. 张量的多维索引 (`Index`/`IndexMut`) 越界时程序 panic, 在任何构建配置下都会检查.
//!   需要非 panic 访问时请使用 `get`/`get_mut`.
//! 2. 后台任务不可取消. 一旦启动, 只能等待其完成或失败.
//!
//! # 模块概览
//!
//! ### 张量与轴置换 ✅
//!
//! 行优先存储的 `f64` 张量, 支持置换、归约、min-max 归一化.
//!
//! 实现位于 `spect-berry/src/data`.
//!
//! ### 弦图/投影文件读取与校验 ✅
//!
//! 原始二进制文件 (`float32`/`float64`, 小端) 与厂商影像容器.
//! 两种视图 (弦图 `[slice, angle, detector]`, 投影 `[angle, slice, detector]`)
//! 永远由置换相互派生.
//!
//! 实现位于 `spect-berry/src/ingest`.
//!
//! ### 任务状态机与后台执行 ✅
//!
//! `Init -> Loaded -> Running -> {Completed | FailedToReconstruct}`.
//! 启动时对参数做值快照, 后台线程只访问快照.
//!
//! 实现位于 `spect-berry/src/task`.
//!
//! ### 任务文件 ✅
//!
//! `serde` + `bincode` 编码, zlib 压缩.
//!
//! 实现位于 `spect-berry/src/task/store.rs`.

/// 三维索引, 按 (slice, angle, detector) 或 (angle, slice, detector) 解释.
pub type Idx3d = (usize, usize, usize);

/// 张量基础数据结构.
mod data;

pub use data::{
    inverse_permutation, window_start, Acquisition, ElemType, ParseKindError, Tensor,
    TensorError, SINOGRAM_TO_PROJECTION,
};

pub mod config;
pub mod consts;
pub mod engine;
pub mod ingest;
pub mod prelude;
pub mod task;
