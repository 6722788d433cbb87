//! 对 `n2v-berry::data` 的更一层封装. 提供更直接的数据集加载器.

use std::path::{Path, PathBuf};

use n2v_berry::axes::Axes;
use n2v_berry::config::data_dir_from_env_or_home;
use n2v_berry::consts::{ENV_PREDICT_DIR, ENV_TRAIN_DIR};
use n2v_berry::data::{file_loader, list_files, FileLoader};
use n2v_berry::Result;

/// 获取训练数据路径.
///
/// 1. 若环境变量 `$N2V_TRAIN_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/n2v/train`.
pub fn train_dir_from_env_or_home() -> Option<PathBuf> {
    data_dir_from_env_or_home(ENV_TRAIN_DIR, &["n2v", "train"])
}

/// 获取推理数据路径.
///
/// 1. 若环境变量 `$N2V_PREDICT_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/n2v/predict`.
pub fn predict_dir_from_env_or_home() -> Option<PathBuf> {
    data_dir_from_env_or_home(ENV_PREDICT_DIR, &["n2v", "predict"])
}

/// 获取 `path` 下扩展名为 `extension` 的全部文件的加载器.
pub fn data_loader<P: AsRef<Path>>(path: P, extension: &str, axes: Axes) -> Result<FileLoader> {
    Ok(file_loader(list_files(path, extension)?, axes))
}

/// 从 `$N2V_PREDICT_DIR` 或者 `$HOME/dataset/n2v/predict` 下加载 `.npy` 单平面图像.
pub fn predict_loader_from_env_or_home() -> Option<Result<FileLoader>> {
    predict_dir_from_env_or_home().map(|d| data_loader(d, "npy", Axes::yx()))
}
