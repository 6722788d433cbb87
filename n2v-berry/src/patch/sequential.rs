//! 规则网格切块.

use itertools::Itertools;
use ndarray::ArrayViewD;

use super::{check_patch_size, spatial_shape, PatchCoords, Patches};
use crate::Result;

/// 单一空间轴上规则网格的起点.
///
/// 共 `ceil(size / patch)` 个窗口, 起点均匀分布在 `[0, size - patch]` 上
/// (两端都能取到), 即重叠量被平均分摊到每对相邻窗口之间, 轴被完全覆盖.
///
/// 要求 `0 < patch <= size`.
pub fn sequential_starts_1d(size: usize, patch: usize) -> Vec<usize> {
    debug_assert!(0 < patch && patch <= size);
    let n = (size + patch - 1) / patch;
    if n <= 1 {
        return vec![0];
    }
    let (span, gaps) = (size - patch, n - 1);
    // round(i * span / gaps)
    (0..n).map(|i| (2 * i * span + gaps) / (2 * gaps)).collect()
}

/// 以规则网格切块. 每个样本产生 `prod(ceil(size / patch))` 个 patch,
/// 按样本优先、空间行优先的顺序迭代.
///
/// `patch_size` 与数组空间维度个数不一致, 或大于图像时返回错误.
pub fn extract_patches_sequential<'a>(
    input: ArrayViewD<'a, f32>,
    patch_size: &[usize],
) -> Result<Patches<'a, std::vec::IntoIter<PatchCoords>>> {
    check_patch_size(&input, patch_size)?;

    let grid: Vec<Vec<usize>> = spatial_shape(&input)
        .iter()
        .zip(patch_size)
        .map(|(&s, &p)| sequential_starts_1d(s, p))
        .multi_cartesian_product()
        .collect();

    let coords: Vec<PatchCoords> = (0..input.shape()[0])
        .flat_map(|sample| {
            grid.iter().map(move |start| PatchCoords {
                sample,
                start: start.clone(),
            })
        })
        .collect();

    Ok(Patches::new(input, patch_size, coords.into_iter()))
}
