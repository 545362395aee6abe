//! 任务文件的定位.

use log::warn;
use spect_berry::consts::TASK_FILE_EXT;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// 获取任务文件目录.
///
/// 1. 若环境变量 `$SPECT_TASK_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/spect-recon`;
/// 3. 无法确定用户主目录时, 返回当前目录.
pub fn task_dir_from_env_or_home() -> PathBuf {
    match env::var("SPECT_TASK_DIR") {
        Ok(d) if !d.is_empty() => PathBuf::from(d),
        _ => spect_berry::config::base_dir().unwrap_or_else(|| PathBuf::from(".")),
    }
}

/// 递归列出 `dir` 下所有任务文件, 按路径排序.
///
/// 不跟随符号链接. 无法读取的子目录只记录警告并跳过; `dir` 本身无法读取时返回错误.
pub fn task_files<P: AsRef<Path>>(dir: P) -> io::Result<Vec<PathBuf>> {
    let mut ans = Vec::new();
    for entry in WalkDir::new(dir.as_ref()).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                warn!("skipped while scanning: {e}");
                continue;
            }
        };
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|e| e == TASK_FILE_EXT) {
            ans.push(path.to_path_buf());
        }
    }
    ans.sort();
    Ok(ans)
}
