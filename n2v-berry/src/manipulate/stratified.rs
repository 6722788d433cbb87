//! 分层随机采样.

use itertools::Itertools;
use rand::Rng;

use crate::SpatialIdx;

/// 被掩码像素之间的网格间距: `round((100 / percentage) ^ (1 / ndim))`, 最小为 1.
#[inline]
pub fn mask_pixel_distance(percentage: f32, ndim: usize) -> usize {
    let d = (100.0 / percentage as f64).powf(1.0 / ndim as f64).round();
    (d as usize).max(1)
}

/// 在给定空间形状上分层随机采样被掩码像素的坐标.
///
/// 以 [`mask_pixel_distance`] 为边长把图像划分为网格, 每个网格单元内均匀随机取一点,
/// 落在图像外的点被丢弃. 因此被掩码像素约占 `percentage` %, 且在空间上分布均匀.
pub fn stratified_coords<R: Rng>(
    shape: &[usize],
    percentage: f32,
    rng: &mut R,
) -> Vec<SpatialIdx> {
    let dist = mask_pixel_distance(percentage, shape.len());
    shape
        .iter()
        .map(|&s| (0..s).step_by(dist))
        .multi_cartesian_product()
        .filter_map(|cell| {
            let p: SpatialIdx = cell.into_iter().map(|c| c + rng.gen_range(0..dist)).collect();
            p.iter().zip(shape).all(|(c, s)| c < s).then_some(p)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;

    #[test]
    fn test_mask_pixel_distance() {
        assert_eq!(mask_pixel_distance(100.0, 2), 1);
        assert_eq!(mask_pixel_distance(1.0, 2), 10);
        assert_eq!(mask_pixel_distance(0.2, 2), 22);
        assert_eq!(mask_pixel_distance(0.2, 3), 8);
    }

    #[test]
    fn test_stratified_coords() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let coords = stratified_coords(&[64, 64], 1.0, &mut rng);
        // 网格 7 x 7, 最后一行/列的单元只有部分落在图像内.
        assert!(coords.len() >= 36 && coords.len() <= 49);
        assert!(coords.iter().all(|c| c[0] < 64 && c[1] < 64));

        // 每个网格单元至多一个点.
        let cells: HashSet<_> = coords.iter().map(|c| (c[0] / 10, c[1] / 10)).collect();
        assert_eq!(cells.len(), coords.len());

        let all = stratified_coords(&[4, 5, 6], 100.0, &mut rng);
        assert_eq!(all.len(), 120);
    }
}
