//! 任务文件检视工具.
//!
//! 用法: `inspect [TASK_FILE]...`. 未给出文件时, 扫描 `$SPECT_TASK_DIR`
//! (默认 `$HOME/spect-recon`) 下的全部任务文件.
//!
//! 每个任务的预览与导出写在任务文件旁的 `{文件名}.inspect/` 目录中.

mod report;

use log::{error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use spect_berry::task::Task;
use spect_berry::{Tensor, TensorError};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use utils::loader;

/// 导出预览与 `.npy` 文件.
fn export(path: &Path, task: &Task) -> Result<PathBuf, TensorError> {
    let mut name = path.file_name().unwrap_or_default().to_owned();
    name.push(".inspect");
    let dir = path.with_file_name(name);
    fs::create_dir_all(&dir)?;

    let p = task.parameter();
    if let Some(acq) = p.acquisition() {
        acq.sinogram().write_npy(dir.join("sinogram.npy"))?;
        acq.projection().write_npy(dir.join("projection.npy"))?;
        save_frame(acq.sinogram(), p.index_sinogram(), &dir, "sinogram")?;
        save_frame(acq.projection(), p.index_projection(), &dir, "projection")?;
    }
    for (i, c) in task.results().iter().enumerate() {
        let stem = format!("result_{i:02}_iter{}", c.iteration);
        c.image.write_npy(dir.join(format!("{stem}.npy")))?;
        c.image.save_preview(dir.join(format!("{stem}.png")))?;
    }
    Ok(dir)
}

fn save_frame(t: &Tensor, index: usize, dir: &Path, what: &str) -> Result<(), TensorError> {
    t.frame_image(index as isize)?
        .save(dir.join(format!("{what}_{index:03}.png")))?;
    Ok(())
}

fn inspect(path: PathBuf) {
    let task = match Task::load(&path) {
        Ok(t) => t,
        Err(e) => {
            error!("cannot load `{}`: {e}", path.display());
            return;
        }
    };
    let mut out = io::stdout().lock();
    if let Err(e) = report::describe_into(&path, &task, &mut out) {
        error!("cannot print report: {e}");
    }
    if let Err(e) = utils::sep_to(&mut out) {
        error!("cannot print report: {e}");
    }
    drop(out);

    match export(&path, &task) {
        Ok(dir) => info!("`{}` exported to `{}`", task.name(), dir.display()),
        Err(e) => warn!("cannot export `{}`: {e}", task.name()),
    }
}

fn main() {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()
        .expect("Logger initialization error");

    let mut paths: Vec<PathBuf> = env::args_os().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        let dir = loader::task_dir_from_env_or_home();
        info!("scanning `{}`", dir.display());
        paths = match loader::task_files(&dir) {
            Ok(p) => p,
            Err(e) => {
                error!("cannot scan `{}`: {e}", dir.display());
                return;
            }
        };
    }
    if paths.is_empty() {
        warn!("no task file found");
        return;
    }

    // 每批不超过核心数.
    let batch = utils::cpus().max(1);
    for chunk in paths.chunks(batch) {
        thread::scope(|s| {
            for p in chunk {
                s.spawn(move || inspect(p.clone()));
            }
        });
    }
}
