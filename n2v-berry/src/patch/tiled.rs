//! 推理用带重叠分块.
//!
//! 每个轴独立计算分块, 多维分块为各轴分块的笛卡尔积. 相邻两块在重叠区的中点处分界,
//! 因此各块的拼接区域互不相交且恰好覆盖整个轴, 拼接时不会出现重复计数.

use std::ops::Range;

use itertools::Itertools;
use ndarray::{ArrayD, ArrayViewD};

use super::{crop, spatial_shape};
use crate::{Error, Result};

/// 单一空间轴上的一个分块.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TileSpan {
    /// 分块在图像中的起点. 分块长度由调用方给出的 (裁剪后的) tile 大小决定.
    pub start: usize,

    /// 该分块负责写入的图像区间.
    pub stitch: Range<usize>,

    /// `stitch` 对应的分块内区间.
    pub overlap_crop: Range<usize>,
}

/// 计算单一空间轴上的分块.
///
/// 1. 步长为 `tile - overlap`, 最后一块贴齐轴末端;
/// 2. `tile >= size` 时只有一块, 覆盖整个轴;
/// 3. 相邻两块以重叠区中点为界.
///
/// 要求 `0 < tile` 且 `overlap < tile`.
pub fn tile_spans_1d(size: usize, tile: usize, overlap: usize) -> Vec<TileSpan> {
    debug_assert!(0 < tile && overlap < tile);
    if tile >= size {
        return vec![TileSpan {
            start: 0,
            stitch: 0..size,
            overlap_crop: 0..size,
        }];
    }

    let step = tile - overlap;
    let mut starts = vec![0];
    while let Some(&last) = starts.last().filter(|&&s| s + tile < size) {
        starts.push((last + step).min(size - tile));
    }

    // 第 k 块与第 k + 1 块的分界.
    let bounds: Vec<usize> = starts
        .iter()
        .tuple_windows()
        .map(|(&a, &b)| b + (a + tile - b) / 2)
        .collect();

    starts
        .iter()
        .enumerate()
        .map(|(k, &start)| {
            let lo = if k == 0 { 0 } else { bounds[k - 1] };
            let hi = bounds.get(k).copied().unwrap_or(size);
            TileSpan {
                start,
                stitch: lo..hi,
                overlap_crop: lo - start..hi - start,
            }
        })
        .collect()
}

/// 一个分块的拼接信息.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TileInfo {
    /// 样本 (`N` 轴) 索引.
    pub sample: usize,

    /// 该样本完整的 `(C, [Z], Y, X)` 形状.
    pub array_shape: Vec<usize>,

    /// 是否是该样本的最后一块.
    pub last_tile: bool,

    /// 各空间轴上需要保留的分块内区间.
    pub overlap_crop: Vec<Range<usize>>,

    /// 各空间轴上保留区间在图像中的位置.
    pub stitch: Vec<Range<usize>>,
}

impl TileInfo {
    /// 该分块贡献的像素个数 (单通道).
    #[inline]
    pub fn stitch_len(&self) -> usize {
        self.stitch.iter().map(|r| r.len()).product()
    }
}

/// 分块迭代器. 按样本优先、空间行优先的顺序返回 `(tile, info)`.
pub struct Tiles<'a> {
    input: ArrayViewD<'a, f32>,
    tile_size: Vec<usize>,
    grid: Vec<Vec<TileSpan>>,
    cur: usize,
    total: usize,
}

impl Tiles<'_> {
    /// 每个样本的分块个数.
    #[inline]
    pub fn tiles_per_sample(&self) -> usize {
        self.grid.len()
    }

    /// 实际使用的 (按图像裁剪后的) tile 大小.
    #[inline]
    pub fn tile_size(&self) -> &[usize] {
        &self.tile_size
    }
}

impl Iterator for Tiles<'_> {
    type Item = (ArrayD<f32>, TileInfo);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == self.total {
            return None;
        }
        let per_sample = self.grid.len();
        let (sample, k) = (self.cur / per_sample, self.cur % per_sample);
        self.cur += 1;

        let spans = &self.grid[k];
        let start: Vec<usize> = spans.iter().map(|s| s.start).collect();
        let tile = crop(&self.input, sample, &start, &self.tile_size);
        let info = TileInfo {
            sample,
            array_shape: self.input.shape()[1..].to_vec(),
            last_tile: k + 1 == per_sample,
            overlap_crop: spans.iter().map(|s| s.overlap_crop.clone()).collect(),
            stitch: spans.iter().map(|s| s.stitch.clone()).collect(),
        };
        Some((tile, info))
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.total - self.cur;
        (rest, Some(rest))
    }
}

impl ExactSizeIterator for Tiles<'_> {}

/// 以带重叠分块的方式切分规范化数组, 用于推理与拼接.
///
/// 各轴上 tile 大小会被裁剪到图像大小. `tile_size` 和 `overlap` 的长度必须等于空间维度个数,
/// 且每一轴上 `overlap < tile`.
pub fn extract_tiles<'a>(
    input: ArrayViewD<'a, f32>,
    tile_size: &[usize],
    overlap: &[usize],
) -> Result<Tiles<'a>> {
    if input.ndim() < 4 {
        return Err(Error::Dimension {
            expected: "normalized (N, C, [Z], Y, X) array".to_string(),
            shape: input.shape().to_vec(),
        });
    }
    let spatial = spatial_shape(&input).to_vec();
    if tile_size.len() != spatial.len() || overlap.len() != spatial.len() {
        return Err(Error::Patch(format!(
            "tile size {tile_size:?} / overlap {overlap:?} do not match spatial shape {spatial:?}"
        )));
    }
    if tile_size.iter().zip(overlap).any(|(&t, &o)| t == 0 || o >= t) {
        return Err(Error::Patch(format!(
            "overlap {overlap:?} must be smaller than tile size {tile_size:?}"
        )));
    }

    let clamped: Vec<usize> = tile_size.iter().zip(&spatial).map(|(&t, &s)| t.min(s)).collect();
    let grid: Vec<Vec<TileSpan>> = spatial
        .iter()
        .zip(tile_size)
        .zip(overlap)
        .map(|((&s, &t), &o)| tile_spans_1d(s, t, o))
        .multi_cartesian_product()
        .collect();
    let total = grid.len() * input.shape()[0];
    log::debug!(
        "Tiling {:?} into {} tiles of {:?} per sample",
        input.shape(),
        grid.len(),
        clamped
    );

    Ok(Tiles {
        input,
        tile_size: clamped,
        grid,
        cur: 0,
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::tests::ramp;

    fn assert_partition(size: usize, tile: usize, overlap: usize) {
        let spans = tile_spans_1d(size, tile, overlap);
        let tile = tile.min(size);
        assert_eq!(spans[0].stitch.start, 0);
        assert_eq!(spans.last().unwrap().stitch.end, size);
        assert_eq!(spans.last().unwrap().start + tile, size);
        for w in spans.windows(2) {
            assert_eq!(w[0].stitch.end, w[1].stitch.start);
        }
        for s in &spans {
            assert!(!s.stitch.is_empty());
            assert!(s.overlap_crop.end <= tile);
            assert_eq!(s.overlap_crop.start + s.start, s.stitch.start);
            assert_eq!(s.overlap_crop.len(), s.stitch.len());
        }
    }

    #[test]
    fn test_tile_spans_1d_partition() {
        for size in 1..80 {
            for (tile, overlap) in [(8, 0), (8, 2), (8, 4), (16, 6), (16, 15), (32, 8)] {
                assert_partition(size, tile, overlap);
            }
        }
    }

    #[test]
    fn test_tile_spans_1d_values() {
        let spans = tile_spans_1d(20, 8, 4);
        let starts: Vec<_> = spans.iter().map(|s| s.start).collect();
        assert_eq!(starts, [0, 4, 8, 12]);
        assert_eq!(spans[0].stitch, 0..6);
        assert_eq!(spans[1].stitch, 6..10);
        assert_eq!(spans[1].overlap_crop, 2..6);
        assert_eq!(spans[3].stitch, 14..20);
        assert_eq!(spans[3].overlap_crop, 2..8);

        // 最后一块被推回贴边, 重叠变大.
        let spans = tile_spans_1d(10, 8, 2);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].start, 2);
        assert_eq!(spans[0].stitch, 0..5);
        assert_eq!(spans[1].overlap_crop, 3..8);
    }

    #[test]
    fn test_extract_tiles() {
        let a = ramp(&[2, 1, 20, 10]);
        let tiles = extract_tiles(a.view(), &[8, 16], &[4, 2]).unwrap();
        assert_eq!(tiles.tile_size(), &[8, 10]);
        assert_eq!(tiles.tiles_per_sample(), 4);
        assert_eq!(tiles.len(), 8);

        let all: Vec<_> = tiles.collect();
        assert!(all.iter().all(|(t, _)| t.shape() == [1, 8, 10]));
        let lasts: Vec<_> = all.iter().map(|(_, i)| i.last_tile).collect();
        assert_eq!(lasts, [false, false, false, true, false, false, false, true]);
        assert_eq!(all[4].1.sample, 1);
        assert_eq!(all[4].1.array_shape, [1, 20, 10]);
        assert_eq!(all[5].0[[0, 0, 0]], a[[1, 0, 4, 0]]);

        let covered: usize = all[..4].iter().map(|(_, i)| i.stitch_len()).sum();
        assert_eq!(covered, 200);
    }

    #[test]
    fn test_extract_tiles_invalid() {
        let a = ramp(&[1, 1, 20, 10]);
        assert!(extract_tiles(a.view(), &[8, 8], &[8, 0]).is_err());
        assert!(extract_tiles(a.view(), &[8], &[0]).is_err());
        assert!(extract_tiles(a.view(), &[0, 8], &[0, 0]).is_err());
    }
}
