//! 随机位置切块.

use ndarray::ArrayViewD;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use super::{check_patch_size, spatial_shape, PatchCoords, Patches};
use crate::Result;

/// 随机坐标生成器. 惰性地为每个样本生成固定数量的随机起点.
#[derive(Clone, Debug)]
pub struct RandomCoords {
    rng: ChaCha8Rng,
    /// 各空间轴上起点的上界 (含).
    max_start: Vec<usize>,
    per_sample: usize,
    total: usize,
    emitted: usize,
}

impl RandomCoords {
    fn new(rng: ChaCha8Rng, n_samples: usize, spatial: &[usize], patch_size: &[usize]) -> Self {
        let per_sample = spatial
            .iter()
            .zip(patch_size)
            .map(|(&s, &p)| (s + p - 1) / p)
            .product();
        Self {
            rng,
            max_start: spatial.iter().zip(patch_size).map(|(s, p)| s - p).collect(),
            per_sample,
            total: per_sample * n_samples,
            emitted: 0,
        }
    }
}

impl Iterator for RandomCoords {
    type Item = PatchCoords;

    fn next(&mut self) -> Option<Self::Item> {
        if self.emitted == self.total {
            return None;
        }
        let sample = self.emitted / self.per_sample;
        self.emitted += 1;
        let start = self
            .max_start
            .iter()
            .map(|&m| self.rng.gen_range(0..=m))
            .collect();
        Some(PatchCoords { sample, start })
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.total - self.emitted;
        (rest, Some(rest))
    }
}

impl ExactSizeIterator for RandomCoords {}

/// 以随机位置切块. 每个样本产生 `prod(ceil(size / patch))` 个 patch,
/// 起点在 `[0, size - patch]` 上均匀分布. 结果完全由 `rng` 的状态决定.
///
/// `patch_size` 与数组空间维度个数不一致, 或大于图像时返回错误.
pub fn extract_patches_random<'a>(
    input: ArrayViewD<'a, f32>,
    patch_size: &[usize],
    rng: ChaCha8Rng,
) -> Result<Patches<'a, RandomCoords>> {
    check_patch_size(&input, patch_size)?;
    let coords = RandomCoords::new(rng, input.shape()[0], spatial_shape(&input), patch_size);
    Ok(Patches::new(input, patch_size, coords))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::tests::ramp;
    use rand::SeedableRng;

    #[test]
    fn test_random_count_and_bounds() {
        let a = ramp(&[3, 1, 20, 17]);
        let patches =
            extract_patches_random(a.view(), &[8, 8], ChaCha8Rng::seed_from_u64(7)).unwrap();
        // ceil(20 / 8) * ceil(17 / 8) = 9 per sample
        assert_eq!(patches.len(), 27);

        let coords = RandomCoords::new(ChaCha8Rng::seed_from_u64(7), 3, &[20, 17], &[8, 8]);
        let coords: Vec<_> = coords.collect();
        assert!(coords[..9].iter().all(|c| c.sample == 0));
        assert!(coords[18..].iter().all(|c| c.sample == 2));
        assert!(coords.iter().all(|c| c.start[0] <= 12 && c.start[1] <= 9));

        // 同一种子, 同一结果.
        for ((p, _), c) in patches.zip(&coords) {
            let expected = a[[c.sample, 0, c.start[0], c.start[1]]];
            assert_eq!(p[[0, 0, 0]], expected);
        }
    }

    #[test]
    fn test_random_exact_fit() {
        let a = ramp(&[1, 1, 8, 8]);
        let mut patches =
            extract_patches_random(a.view(), &[8, 8], ChaCha8Rng::seed_from_u64(0)).unwrap();
        let (p, _) = patches.next().unwrap();
        assert_eq!(p, a.index_axis(ndarray::Axis(0), 0));
        assert!(patches.next().is_none());
    }
}
