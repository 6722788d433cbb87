//! 切块 (patch / tile) 提取.
//!
//! 输入数组均为规范化后的 `(N, C, [Z], Y, X)` 布局; 输出的每个 patch / tile 为
//! `(C, [Z], Y, X)`. 三种策略:
//!
//! 1. [`ExtractionStrategy::Sequential`]: 规则网格, 重叠均匀分布, 保证完全覆盖.
//! 2. [`ExtractionStrategy::Random`]: 随机位置, 数量与顺序策略相同.
//! 3. [`ExtractionStrategy::Tiled`]: 推理用分块, 附带拼接所需的坐标信息.
//!
//! 所有策略都先计算坐标, 再按坐标裁剪, 因此输入与监督目标总能使用相同的窗口.

use ndarray::{ArrayD, ArrayViewD, Axis, Slice};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, SpatialIdx};

mod random;
mod sequential;
mod tiled;

pub use random::{extract_patches_random, RandomCoords};
pub use sequential::{extract_patches_sequential, sequential_starts_1d};
pub use tiled::{extract_tiles, tile_spans_1d, TileInfo, TileSpan, Tiles};

/// 切块策略.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ExtractionStrategy {
    /// 规则网格.
    Sequential,

    /// 随机位置.
    Random,

    /// 带重叠分块, 仅用于推理.
    Tiled,
}

/// 一个 patch 在规范化数组中的位置.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PatchCoords {
    /// 样本 (`N` 轴) 索引.
    pub sample: usize,

    /// 各空间轴上的起点, 按 `([Z], Y, X)` 顺序.
    pub start: SpatialIdx,
}

/// 从规范化数组中裁剪出 `(C, [Z], Y, X)` 窗口.
///
/// 调用者保证坐标不越界, 否则程序 panic.
pub fn crop(array: &ArrayViewD<f32>, sample: usize, start: &[usize], size: &[usize]) -> ArrayD<f32> {
    let mut v = array.index_axis(Axis(0), sample);
    for (i, (&s, &len)) in start.iter().zip(size).enumerate() {
        v.slice_axis_inplace(Axis(i + 1), Slice::from(s..s + len));
    }
    v.to_owned()
}

/// 规范化数组的空间形状.
#[inline]
pub(crate) fn spatial_shape<'b>(array: &'b ArrayViewD<'_, f32>) -> &'b [usize] {
    &array.shape()[2..]
}

/// 检查规范化数组与 patch 大小是否兼容.
pub(crate) fn check_patch_size(array: &ArrayViewD<f32>, patch_size: &[usize]) -> Result<()> {
    if array.ndim() < 4 {
        return Err(Error::Dimension {
            expected: "normalized (N, C, [Z], Y, X) array".to_string(),
            shape: array.shape().to_vec(),
        });
    }
    let spatial = spatial_shape(array);
    if spatial.len() != patch_size.len() {
        return Err(Error::Patch(format!(
            "patch size {patch_size:?} does not match spatial shape {spatial:?}"
        )));
    }
    if patch_size.iter().any(|&p| p == 0) {
        return Err(Error::Patch(format!("patch size {patch_size:?} contains zero")));
    }
    if patch_size.iter().zip(spatial).any(|(p, s)| p > s) {
        return Err(Error::Patch(format!(
            "patch size {patch_size:?} is larger than the image {spatial:?}"
        )));
    }
    Ok(())
}

/// patch 迭代器. 每次迭代返回输入 patch, 以及 (若有) 相同窗口的监督目标 patch.
///
/// `C` 为坐标生成器, 决定了切块策略.
pub struct Patches<'a, C> {
    input: ArrayViewD<'a, f32>,
    target: Option<ArrayViewD<'a, f32>>,
    patch_size: Vec<usize>,
    coords: C,
}

impl<'a, C: Iterator<Item = PatchCoords>> Patches<'a, C> {
    pub(crate) fn new(input: ArrayViewD<'a, f32>, patch_size: &[usize], coords: C) -> Self {
        Self {
            input,
            target: None,
            patch_size: patch_size.to_vec(),
            coords,
        }
    }

    /// 附带形状与输入相同的监督目标.
    pub fn with_target(mut self, target: ArrayViewD<'a, f32>) -> Result<Self> {
        if target.shape() != self.input.shape() {
            return Err(Error::Mismatch(format!(
                "target shape {:?} differs from input shape {:?}",
                target.shape(),
                self.input.shape()
            )));
        }
        self.target = Some(target);
        Ok(self)
    }

    /// patch 大小.
    #[inline]
    pub fn patch_size(&self) -> &[usize] {
        &self.patch_size
    }
}

impl<C: Iterator<Item = PatchCoords>> Iterator for Patches<'_, C> {
    type Item = (ArrayD<f32>, Option<ArrayD<f32>>);

    fn next(&mut self) -> Option<Self::Item> {
        let PatchCoords { sample, start } = self.coords.next()?;
        let input = crop(&self.input, sample, &start, &self.patch_size);
        let target = self
            .target
            .as_ref()
            .map(|t| crop(t, sample, &start, &self.patch_size));
        Some((input, target))
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.coords.size_hint()
    }
}

impl<C: ExactSizeIterator<Item = PatchCoords>> ExactSizeIterator for Patches<'_, C> {}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::IxDyn;

    /// `(N, C, Y, X)` 或 `(N, C, Z, Y, X)` 的递增数组, 便于校验位置.
    pub(crate) fn ramp(shape: &[usize]) -> ArrayD<f32> {
        let len: usize = shape.iter().product();
        ArrayD::from_shape_vec(IxDyn(shape), (0..len).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn test_crop() {
        let a = ramp(&[2, 1, 4, 5]);
        let p = crop(&a.view(), 1, &[1, 2], &[2, 3]);
        assert_eq!(p.shape(), &[1, 2, 3]);
        assert_eq!(p[[0, 0, 0]], a[[1, 0, 1, 2]]);
        assert_eq!(p[[0, 1, 2]], a[[1, 0, 2, 4]]);
    }

    #[test]
    fn test_check_patch_size() {
        let a = ramp(&[1, 1, 8, 16]);
        assert!(check_patch_size(&a.view(), &[8, 8]).is_ok());
        assert!(check_patch_size(&a.view(), &[16, 8]).is_err());
        assert!(check_patch_size(&a.view(), &[8, 8, 8]).is_err());
        assert!(check_patch_size(&a.view(), &[0, 8]).is_err());
    }
}
