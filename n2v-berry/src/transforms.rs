//! 数据增强与推理时增强 (TTA).
//!
//! 所有变换只作用于最后两个轴, 即 `Y` 与 `X`. 因此同一套实现可以用于单个
//! `(C, [Z], Y, X)` patch, 也可以用于 `(B, C, [Z], Y, X)` batch.

use ndarray::{ArrayD, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::Result;

/// 训练时随机增强.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Augmentation {
    /// `Y`, `X` 轴各以 0.5 的概率翻转.
    NdFlip,

    /// `Y-X` 平面随机旋转 `k * 90` 度. 平面非正方形时 `k` 只取 0 或 2.
    XyRandomRotate90,
}

impl Augmentation {
    /// 对 patch 及其监督目标施加相同的随机变换.
    pub fn apply<R: Rng>(&self, patch: &mut ArrayD<f32>, mut target: Option<&mut ArrayD<f32>>, rng: &mut R) {
        let (ny, nx) = yx_axes(patch);
        match self {
            Self::NdFlip => {
                for ax in [ny, nx] {
                    if rng.gen_bool(0.5) {
                        patch.invert_axis(ax);
                        if let Some(t) = target.as_deref_mut() {
                            t.invert_axis(ax);
                        }
                    }
                }
            }
            Self::XyRandomRotate90 => {
                let k = if is_square(patch) {
                    rng.gen_range(0..4u8)
                } else {
                    2 * rng.gen_range(0..2u8)
                };
                *patch = rot90(patch, k);
                if let Some(t) = target {
                    *t = rot90(t, k);
                }
            }
        }
    }
}

/// 最后两个轴.
#[inline]
fn yx_axes(a: &ArrayD<f32>) -> (Axis, Axis) {
    let n = a.ndim();
    (Axis(n - 2), Axis(n - 1))
}

#[inline]
fn is_square(a: &ArrayD<f32>) -> bool {
    let s = a.shape();
    s[s.len() - 2] == s[s.len() - 1]
}

/// 将 `Y-X` 平面逆时针旋转 `k * 90` 度, 与 `numpy.rot90(a, k, axes=(-2, -1))` 一致.
pub fn rot90(a: &ArrayD<f32>, k: u8) -> ArrayD<f32> {
    let (ny, nx) = yx_axes(a);
    let mut v = a.view();
    for _ in 0..k % 4 {
        v.swap_axes(ny.index(), nx.index());
        v.invert_axis(ny);
    }
    v.as_standard_layout().into_owned()
}

/// TTA 中的一种变体: 先 (可选) 翻转 `X`, 再旋转 `k * 90` 度.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TtaVariant {
    /// 是否翻转 `X`.
    pub flip: bool,

    /// 旋转次数.
    pub k: u8,
}

impl TtaVariant {
    /// 正向变换.
    pub fn forward(&self, a: &ArrayD<f32>) -> ArrayD<f32> {
        let mut ans = a.clone();
        if self.flip {
            let (_, nx) = yx_axes(&ans);
            ans.invert_axis(nx);
        }
        rot90(&ans, self.k)
    }

    /// 逆变换.
    pub fn inverse(&self, a: &ArrayD<f32>) -> ArrayD<f32> {
        let mut ans = rot90(a, (4 - self.k % 4) % 4);
        if self.flip {
            let (_, nx) = yx_axes(&ans);
            ans.invert_axis(nx);
        }
        ans.as_standard_layout().into_owned()
    }
}

/// 给定形状的全部 TTA 变体: 正方形平面 8 种, 否则 4 种.
pub fn tta_variants(shape: &[usize]) -> Vec<TtaVariant> {
    let n = shape.len();
    let ks: &[u8] = if shape[n - 2] == shape[n - 1] {
        &[0, 1, 2, 3]
    } else {
        &[0, 2]
    };
    [false, true]
        .into_iter()
        .flat_map(|flip| ks.iter().map(move |&k| TtaVariant { flip, k }))
        .collect()
}

/// 推理时增强: 对每种变体分别预测, 逆变换后取平均.
///
/// `predict` 的输出形状必须与输入形状相同.
pub fn tta_predict<F>(input: &ArrayD<f32>, mut predict: F) -> Result<ArrayD<f32>>
where
    F: FnMut(&ArrayD<f32>) -> Result<ArrayD<f32>>,
{
    let variants = tta_variants(input.shape());
    let mut acc = ArrayD::<f32>::zeros(input.raw_dim());
    for v in &variants {
        let pred = predict(&v.forward(input))?;
        acc += &v.inverse(&pred);
    }
    acc /= variants.len() as f32;
    Ok(acc)
}
