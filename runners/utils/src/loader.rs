//! 对 `bl-frame::dataset` 的更一层封装. 提供更直接的数据集加载器.

use bl_frame::dataset::{self, LoadError, LoadResult, SubjectLoader};
use log::{debug, warn};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// 获取小鼠数据集基本路径.
///
/// 1. 若环境变量 `$NEUROFRAME_SUBJECTS_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/mice`.
pub fn subjects_dir_from_env_or_home() -> Option<PathBuf> {
    match env::var("NEUROFRAME_SUBJECTS_DIR") {
        Ok(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => dataset::home_dataset_dir_with(["mice"]),
    }
}

/// 获取骨缝模板路径.
///
/// 1. 若环境变量 `$NEUROFRAME_TEMPLATES_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/templates`.
pub fn templates_dir_from_env_or_home() -> Option<PathBuf> {
    match env::var("NEUROFRAME_TEMPLATES_DIR") {
        Ok(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => dataset::home_dataset_dir_with(["templates"]),
    }
}

/// 需要处理的小鼠编号.
///
/// 1. 若环境变量 `$NEUROFRAME_SUBJECTS` 非空, 则按逗号分隔解析;
/// 2. 否则, 取 `dir` 下所有子目录名, 升序.
pub fn subject_ids<P: AsRef<Path>>(dir: P) -> Vec<String> {
    if let Ok(list) = env::var("NEUROFRAME_SUBJECTS") {
        let ids: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if !ids.is_empty() {
            return ids;
        }
    }

    let entries = match fs::read_dir(dir.as_ref()) {
        Ok(e) => e,
        Err(e) => {
            warn!("Cannot list `{}`: {e}", dir.as_ref().display());
            return vec![];
        }
    };
    let mut ids: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    ids.sort_unstable();
    debug!("Found {} subjects in `{}`", ids.len(), dir.as_ref().display());
    ids
}

/// 获取 `dir` 下所有小鼠的加载器.
pub fn subject_loader<P: AsRef<Path>>(dir: P) -> LoadResult<SubjectLoader> {
    SubjectLoader::new(subject_ids(&dir), dir)
}

/// 从 `$NEUROFRAME_SUBJECTS_DIR` 或者 `$HOME/dataset/mice` 下加载小鼠数据.
pub fn subject_loader_from_env_or_home() -> LoadResult<SubjectLoader> {
    let dir = subjects_dir_from_env_or_home()
        .ok_or_else(|| LoadError::NotADirectory(PathBuf::from("~/dataset/mice")))?;
    subject_loader(dir)
}
