//! 运行环境配置: 工作目录、模型路径、输出目录解析.

use crate::consts::MODEL_FILE_NAME;
use std::env;
use std::path::{Path, PathBuf};

/// 工作目录名, 位于用户主目录下.
const BASE_DIR_NAME: &str = "spect-recon";

/// 获取 `{用户主目录}/spect-recon` 目录.
pub fn base_dir() -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push(BASE_DIR_NAME);
    Some(ans)
}

/// 获取 `{用户主目录}/spect-recon` 目录下给定继续项组成的全路径.
pub fn base_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = base_dir()?;
    ans.extend(it);
    Some(ans)
}

/// 获取默认复原模型路径.
///
/// 1. 若环境变量 `$MODEL_PATH` 非空, 则返回其值;
/// 2. 否则若 `$APPDIR` 非空 (AppImage 打包), 返回 `$APPDIR/usr/share/model/{模型文件}`;
/// 3. 否则, 返回模型文件名本身 (相对于当前目录).
pub fn default_model_path() -> PathBuf {
    match non_empty_var("MODEL_PATH") {
        Some(p) => PathBuf::from(p),
        None => match non_empty_var("APPDIR") {
            Some(app) => [app.as_str(), "usr", "share", "model", MODEL_FILE_NAME]
                .iter()
                .collect(),
            None => PathBuf::from(MODEL_FILE_NAME),
        },
    }
}

/// 解析任务输出目录.
///
/// 绝对路径按原样返回. 相对路径 (包括空路径) 被视为相对于 [`base_dir`],
/// 并追加任务名一级, 即 `{base}/{output_dir}/{task_name}`.
/// 无法确定用户主目录时, 以当前目录代替 `{base}`.
pub fn resolve_output_dir(output_dir: &Path, task_name: &str) -> PathBuf {
    if output_dir.is_absolute() {
        return output_dir.to_owned();
    }
    let mut ans = base_dir().unwrap_or_default();
    ans.push(output_dir);
    ans.push(task_name);
    ans
}

#[inline]
fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_absolute_output_dir() {
        let abs = env::temp_dir().join("recon-out");
        assert_eq!(resolve_output_dir(&abs, "any"), abs);
    }

    #[test]
    fn test_resolve_relative_output_dir() {
        let p = resolve_output_dir(Path::new("runs"), "phantom");
        assert!(p.ends_with("runs/phantom"));
    }

    #[test]
    fn test_base_dir_with() {
        if let Some(p) = base_dir_with(["a", "b"]) {
            assert!(p.ends_with("spect-recon/a/b"));
        }
    }
}
