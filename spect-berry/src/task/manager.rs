//! 任务集合.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use log::warn;

use super::{Checkpoint, StoreError, Task, TaskError, TaskStatus};
use crate::engine::Backend;
use crate::ingest::{FileFormat, Geometry, IngestStatus};
use crate::ElemType;

/// 任务句柄. 任务被移除后不再复用.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskHandle(u64);

/// 一组相互独立的任务, 共用同一个后端.
///
/// 上层应以 [`crate::consts::POLL_INTERVAL`] 左右的间隔调用
/// [`TaskManager::poll_completed`] 观察进展.
pub struct TaskManager {
    tasks: BTreeMap<TaskHandle, Task>,
    next: u64,
    backend: Arc<dyn Backend>,
}

impl TaskManager {
    /// 新建空集合.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            tasks: BTreeMap::new(),
            next: 0,
            backend,
        }
    }

    /// 新建空任务.
    pub fn create_task(&mut self) -> TaskHandle {
        self.insert(Task::new())
    }

    /// 加入已有任务.
    pub fn insert(&mut self, task: Task) -> TaskHandle {
        let h = TaskHandle(self.next);
        self.next += 1;
        self.tasks.insert(h, task);
        h
    }

    /// 读取任务文件并加入.
    pub fn load_task<P: AsRef<Path>>(&mut self, path: P) -> Result<TaskHandle, StoreError> {
        Task::load(path).map(|t| self.insert(t))
    }

    /// 移除任务. 正在进行的运行不会被取消, 其结果将被丢弃.
    pub fn remove(&mut self, handle: TaskHandle) -> Option<Task> {
        self.tasks.remove(&handle)
    }

    /// 任务个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// 是否没有任务.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 按创建顺序迭代句柄.
    pub fn handles(&self) -> impl Iterator<Item = TaskHandle> + '_ {
        self.tasks.keys().copied()
    }

    /// 任务引用.
    #[inline]
    pub fn task(&self, handle: TaskHandle) -> Option<&Task> {
        self.tasks.get(&handle)
    }

    /// 可变任务引用.
    #[inline]
    pub fn task_mut(&mut self, handle: TaskHandle) -> Option<&mut Task> {
        self.tasks.get_mut(&handle)
    }

    /// 读取数据文件. 句柄不存在时返回 `None`.
    pub fn ingest(
        &mut self,
        handle: TaskHandle,
        path: &Path,
        format: FileFormat,
        geometry: Geometry,
        elem: ElemType,
    ) -> Option<IngestStatus> {
        self.task_mut(handle)
            .map(|t| t.ingest(path, format, geometry, elem))
    }

    /// 启动任务. 已在运行时返回 `Ok(false)`.
    pub fn start(&mut self, handle: TaskHandle) -> Result<bool, TaskError> {
        let backend = Arc::clone(&self.backend);
        self.tasks
            .get_mut(&handle)
            .ok_or(TaskError::NoSuchTask(handle))?
            .start(backend)
    }

    /// 启动所有可启动的任务, 返回新启动的个数. 各任务之间没有先后关系.
    pub fn start_all(&mut self) -> usize {
        let mut launched = 0;
        for (h, task) in self.tasks.iter_mut() {
            match task.start(Arc::clone(&self.backend)) {
                Ok(true) => launched += 1,
                Ok(false) => {}
                Err(e) => warn!("task {h:?} not started: {e}"),
            }
        }
        launched
    }

    /// 任务状态.
    pub fn status(&mut self, handle: TaskHandle) -> Option<TaskStatus> {
        self.task_mut(handle).map(Task::status)
    }

    /// 任务进度.
    pub fn progress(&mut self, handle: TaskHandle) -> Option<u8> {
        self.task_mut(handle).map(Task::progress)
    }

    /// 任务结果.
    pub fn results(&self, handle: TaskHandle) -> Option<&[Checkpoint]> {
        self.task(handle).map(Task::results)
    }

    /// 收取所有刚结束的运行, 返回它们的句柄. 每次结束只报告一次.
    pub fn poll_completed(&mut self) -> Vec<TaskHandle> {
        self.tasks
            .iter_mut()
            .filter_map(|(&h, t)| t.take_completion().then_some(h))
            .collect()
    }

    /// 阻塞直至所有运行结束.
    pub fn wait_all(&mut self) {
        for task in self.tasks.values_mut() {
            task.wait();
        }
    }
}
