//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::Idx3d;

pub use crate::data::{
    inverse_permutation, window_start, Acquisition, ElemType, ParseKindError, Tensor,
    TensorError, SINOGRAM_TO_PROJECTION,
};

pub use crate::consts::{NUM_ANGLES, NUM_DETECTORS, NUM_SLICES, POLL_INTERVAL, PROGRESS_DONE};

pub use crate::config::{base_dir, base_dir_with, default_model_path};

pub use crate::engine::{Backend, EngineConfig, EngineError, Predictor, Progress, ReconEngine};

pub use crate::ingest::{
    ingest, FileFormat, Geometry, IngestError, IngestStatus, Ingested, NiftiReader, SinogramInfo,
    VendorReader,
};

pub use crate::task::{
    Checkpoint, IteratorKind, Task, TaskError, TaskHandle, TaskManager, TaskParameter,
    TaskStatus,
};
