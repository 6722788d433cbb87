//! 训练与评估指标.

use ndarray::{ArrayView, Dimension, Zip};
use num::Float;

/// 加权滑动平均. 用于统计一个 epoch 内的平均损失.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct MetricTracker {
    val: f64,
    sum: f64,
    count: usize,
}

impl MetricTracker {
    /// 清空.
    #[inline]
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// 记录一个值, 其权重为 `n` (通常是 batch 大小).
    #[inline]
    pub fn update(&mut self, value: f64, n: usize) {
        self.val = value;
        self.sum += value * n as f64;
        self.count += n;
    }

    /// 最近一次记录的值.
    #[inline]
    pub fn val(&self) -> f64 {
        self.val
    }

    /// 已记录的总权重.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// 加权平均. 尚无记录时为 `NaN`.
    #[inline]
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.sum / self.count as f64
        }
    }
}

fn mean<T: Float, D: Dimension>(a: &ArrayView<T, D>) -> T {
    let n = T::from(a.len().max(1)).unwrap_or_else(T::one);
    a.fold(T::zero(), |acc, &v| acc + v) / n
}

fn std<T: Float, D: Dimension>(a: &ArrayView<T, D>) -> T {
    let m = mean(a);
    let n = T::from(a.len().max(1)).unwrap_or_else(T::one);
    (a.fold(T::zero(), |acc, &v| acc + (v - m) * (v - m)) / n).sqrt()
}

/// 峰值信噪比 `10 * log10(range² / mse)`. 两图完全相同时为正无穷.
///
/// 形状不同时程序 panic.
pub fn psnr<T: Float, D: Dimension>(gt: ArrayView<T, D>, pred: ArrayView<T, D>, range: T) -> T {
    let n = T::from(gt.len().max(1)).unwrap_or_else(T::one);
    let mse = Zip::from(&gt)
        .and(&pred)
        .fold(T::zero(), |acc, &g, &p| acc + (g - p) * (g - p))
        / n;
    let ten = T::from(10).unwrap_or_else(T::one);
    ten * (range * range / mse).log10()
}

/// 尺度不变 PSNR: 先将真值标准化, 再对预测做最小二乘的仿射拟合, 然后计算 PSNR.
///
/// 动态范围取 `(max - min) / std`.
pub fn scale_invariant_psnr<T: Float, D: Dimension>(gt: ArrayView<T, D>, pred: ArrayView<T, D>) -> T {
    let gt_std = std(&gt);
    let (lo, hi) = gt.fold((T::infinity(), T::neg_infinity()), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
    });
    let range = (hi - lo) / gt_std;

    let gt_mean = mean(&gt);
    let gt_ = gt.mapv(|v| (v - gt_mean) / gt_std);
    let pred_mean = mean(&pred);
    let x = pred.mapv(|v| v - pred_mean);
    let (xy, xx) = Zip::from(&gt_)
        .and(&x)
        .fold((T::zero(), T::zero()), |(xy, xx), &g, &v| (xy + g * v, xx + v * v));
    let a = if xx > T::zero() { xy / xx } else { T::zero() };
    let fitted = x.mapv(|v| v * a);
    psnr(gt_.view(), fitted.view(), range)
}
