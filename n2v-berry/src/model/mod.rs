//! 模型接口.
//!
//! 网络结构不在本 crate 范围内: 引擎只通过 [`Model`] trait 调用前向传播与单步优化.
//! [`LinearFilter`] 是一个可训练的线性卷积滤波器, 仅用于让引擎可以独立运行和测试.

use ndarray::{ArrayD, ArrayViewD};
use serde::{Deserialize, Serialize};

use crate::dataset::Batch;
use crate::loss::Loss;
use crate::Result;

mod filter;

pub use filter::LinearFilter;

/// 单步优化参数.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StepOptions {
    /// 学习率.
    pub learning_rate: f32,

    /// 梯度范数上限. `None` 表示不裁剪.
    pub max_grad_norm: Option<f32>,
}

/// 可序列化的模型参数, 存入检查点.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    /// 模型名称, 载入时用于校验.
    pub name: String,

    /// 扁平化的参数.
    pub params: Vec<f32>,
}

/// 可被引擎驱动的模型.
pub trait Model {
    /// 模型名称.
    fn name(&self) -> &str;

    /// 前向传播. 输入为 `(B, C, [Z], Y, X)`, 输出形状与输入相同.
    fn forward(&self, input: ArrayViewD<f32>) -> Result<ArrayD<f32>>;

    /// 在一个 batch 上前向传播, 计算损失并更新一次参数. 返回更新前的损失.
    fn train_step(&mut self, batch: &Batch, loss: &Loss, opts: &StepOptions) -> Result<f32>;

    /// 导出参数.
    fn state(&self) -> ModelState;

    /// 载入参数.
    fn load_state(&mut self, state: &ModelState) -> Result<()>;
}

/// 按全局 L2 范数裁剪梯度, 返回裁剪前的范数.
pub fn clip_grad_norm(grads: &mut [f32], max_norm: f32) -> f32 {
    let norm = grads.iter().map(|g| g * g).sum::<f32>().sqrt();
    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        grads.iter_mut().for_each(|g| *g *= scale);
    }
    norm
}
