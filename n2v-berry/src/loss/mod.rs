//! 损失函数.
//!
//! 1. N2V: 只在被掩码像素上计算平方误差;
//! 2. PN2V: 基于噪声模型的负对数似然, 同样只在被掩码像素上计算;
//! 3. MSE / MAE: 有监督 (N2N, CARE) 的全像素损失.
//!
//! 每种损失都给出了对预测值的解析梯度, 供参考模型的 SGD 使用.

use ndarray::{ArrayD, ArrayViewD, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

mod noise_model;

pub use noise_model::HistogramNoiseModel;

/// 损失类型.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LossType {
    /// 盲点平方误差.
    N2v,

    /// 概率 N2V.
    Pn2v,

    /// 均方误差.
    Mse,

    /// 平均绝对误差.
    Mae,
}

impl LossType {
    /// 是否依赖掩码 (自监督).
    #[inline]
    pub fn is_masked(&self) -> bool {
        matches!(self, Self::N2v | Self::Pn2v)
    }
}

fn check_shape(a: &[usize], b: &[usize]) -> Result<()> {
    if a != b {
        return Err(Error::Mismatch(format!(
            "prediction shape {a:?} differs from target shape {b:?}"
        )));
    }
    Ok(())
}

/// 被掩码像素个数, 为 0 时报错.
fn mask_count(mask: &ArrayViewD<bool>) -> Result<f32> {
    let n = mask.iter().filter(|m| **m).count();
    if n == 0 {
        return Err(Error::Mismatch("mask contains no pixel".to_string()));
    }
    Ok(n as f32)
}

/// N2V 损失: `Σ mask * (original - pred)² / Σ mask`.
pub fn n2v_loss(pred: ArrayViewD<f32>, original: ArrayViewD<f32>, mask: ArrayViewD<bool>) -> Result<f32> {
    check_shape(pred.shape(), original.shape())?;
    check_shape(pred.shape(), mask.shape())?;
    let n = mask_count(&mask)?;
    let mut sum = 0.0f32;
    Zip::from(&pred).and(&original).and(&mask).for_each(|&p, &o, &m| {
        if m {
            sum += (o - p).powi(2);
        }
    });
    Ok(sum / n)
}

/// 均方误差.
pub fn mse_loss(pred: ArrayViewD<f32>, target: ArrayViewD<f32>) -> Result<f32> {
    check_shape(pred.shape(), target.shape())?;
    let sum: f32 = Zip::from(&pred).and(&target).fold(0.0, |acc, &p, &t| acc + (p - t).powi(2));
    Ok(sum / pred.len().max(1) as f32)
}

/// 平均绝对误差.
pub fn mae_loss(pred: ArrayViewD<f32>, target: ArrayViewD<f32>) -> Result<f32> {
    check_shape(pred.shape(), target.shape())?;
    let sum: f32 = Zip::from(&pred).and(&target).fold(0.0, |acc, &p, &t| acc + (p - t).abs());
    Ok(sum / pred.len().max(1) as f32)
}

/// PN2V 损失.
///
/// `samples` 的第 0 轴为信号采样, 其余轴与 `labels` 相同. 对每个像素, 先对所有采样的似然求平均,
/// 再在被掩码像素上对负对数似然求平均.
pub fn pn2v_loss(
    samples: ArrayViewD<f32>,
    labels: ArrayViewD<f32>,
    mask: ArrayViewD<bool>,
    noise_model: &HistogramNoiseModel,
) -> Result<f32> {
    check_shape(&samples.shape()[1..], labels.shape())?;
    check_shape(labels.shape(), mask.shape())?;
    let n = mask_count(&mask)?;

    let mut avg = ArrayD::<f32>::zeros(labels.raw_dim());
    for s in samples.axis_iter(Axis(0)) {
        Zip::from(&mut avg)
            .and(&s)
            .and(&labels)
            .for_each(|a, &s, &l| *a += noise_model.likelihood(l, s));
    }
    let k = samples.len_of(Axis(0)).max(1) as f32;
    let mut sum = 0.0f32;
    Zip::from(&avg).and(&mask).for_each(|&a, &m| {
        if m {
            sum -= (a / k).ln();
        }
    });
    Ok(sum / n)
}

/// 运行时损失. 在 [`LossType`] 基础上携带 PN2V 所需的噪声模型.
#[derive(Clone, Debug)]
pub struct Loss {
    kind: LossType,
    noise_model: Option<HistogramNoiseModel>,
}

impl Loss {
    /// 构建不需要噪声模型的损失. `LossType::Pn2v` 请使用 [`Loss::pn2v`].
    pub fn new(kind: LossType) -> Result<Self> {
        if kind == LossType::Pn2v {
            return Err(Error::Config("pn2v loss requires a noise model".to_string()));
        }
        Ok(Self {
            kind,
            noise_model: None,
        })
    }

    /// PN2V 损失.
    pub fn pn2v(noise_model: HistogramNoiseModel) -> Self {
        Self {
            kind: LossType::Pn2v,
            noise_model: Some(noise_model),
        }
    }

    /// 损失类型.
    #[inline]
    pub fn kind(&self) -> LossType {
        self.kind
    }

    fn require_mask<'a>(&self, mask: Option<ArrayViewD<'a, bool>>) -> Result<ArrayViewD<'a, bool>> {
        mask.ok_or_else(|| Error::Mismatch(format!("{:?} loss requires a mask", self.kind)))
    }

    fn require_noise_model(&self) -> Result<&HistogramNoiseModel> {
        self.noise_model
            .as_ref()
            .ok_or_else(|| Error::Config("pn2v loss requires a noise model".to_string()))
    }

    /// 计算损失. `pred` 与 `target` 形状相同, PN2V 将 `pred` 视为单个信号采样.
    pub fn compute(
        &self,
        pred: ArrayViewD<f32>,
        target: ArrayViewD<f32>,
        mask: Option<ArrayViewD<bool>>,
    ) -> Result<f32> {
        match self.kind {
            LossType::N2v => n2v_loss(pred, target, self.require_mask(mask)?),
            LossType::Pn2v => pn2v_loss(
                pred.insert_axis(Axis(0)),
                target,
                self.require_mask(mask)?,
                self.require_noise_model()?,
            ),
            LossType::Mse => mse_loss(pred, target),
            LossType::Mae => mae_loss(pred, target),
        }
    }

    /// 损失对 `pred` 的梯度.
    pub fn gradient(
        &self,
        pred: ArrayViewD<f32>,
        target: ArrayViewD<f32>,
        mask: Option<ArrayViewD<bool>>,
    ) -> Result<ArrayD<f32>> {
        check_shape(pred.shape(), target.shape())?;
        let mut grad = ArrayD::<f32>::zeros(pred.raw_dim());
        match self.kind {
            LossType::N2v => {
                let mask = self.require_mask(mask)?;
                check_shape(pred.shape(), mask.shape())?;
                let n = mask_count(&mask)?;
                Zip::from(&mut grad)
                    .and(&pred)
                    .and(&target)
                    .and(&mask)
                    .for_each(|g, &p, &t, &m| {
                        if m {
                            *g = 2.0 * (p - t) / n;
                        }
                    });
            }
            LossType::Pn2v => {
                let mask = self.require_mask(mask)?;
                check_shape(pred.shape(), mask.shape())?;
                let nm = self.require_noise_model()?;
                let n = mask_count(&mask)?;
                Zip::from(&mut grad)
                    .and(&pred)
                    .and(&target)
                    .and(&mask)
                    .for_each(|g, &p, &t, &m| {
                        if m {
                            *g = -nm.likelihood_grad(t, p) / nm.likelihood(t, p) / n;
                        }
                    });
            }
            LossType::Mse => {
                let n = pred.len().max(1) as f32;
                Zip::from(&mut grad)
                    .and(&pred)
                    .and(&target)
                    .for_each(|g, &p, &t| *g = 2.0 * (p - t) / n);
            }
            LossType::Mae => {
                let n = pred.len().max(1) as f32;
                Zip::from(&mut grad)
                    .and(&pred)
                    .and(&target)
                    .for_each(|g, &p, &t| *g = (p - t).signum() * f32::from(p != t) / n);
            }
        }
        Ok(grad)
    }
}
