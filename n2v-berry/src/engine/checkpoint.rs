//! 检查点.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::Configuration;
use crate::data::Stats;
use crate::model::ModelState;
use crate::Result;

/// 训练状态快照, 以 `bincode` 格式存储.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// 已完成的 epoch (从 0 开始).
    pub epoch: usize,

    /// 该 epoch 的验证损失.
    pub val_loss: f64,

    /// 规范化统计量.
    pub stats: Stats,

    /// 当前学习率.
    pub learning_rate: f32,

    /// 模型参数.
    pub state: ModelState,

    /// 训练所用配置.
    pub config: Configuration,
}

impl Checkpoint {
    /// 写入文件.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let w = BufWriter::new(File::create(path)?);
        bincode::serialize_into(w, self)?;
        Ok(())
    }
}

/// 从文件读取检查点.
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
    let r = BufReader::new(File::open(path)?);
    Ok(bincode::deserialize_from(r)?)
}
