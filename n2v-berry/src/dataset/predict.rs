//! 推理数据集.

use std::path::PathBuf;

use either::Either;
use ndarray::{ArrayD, Axis};

use crate::axes::Axes;
use crate::data::read_array;
use crate::patch::{extract_tiles, TileInfo};
use crate::{Error, Result};

/// 推理的最小单元: 一个整幅样本或一个 tile, 均为 `(C, [Z], Y, X)`.
#[derive(Clone, Debug)]
pub struct PredictItem {
    /// 网络输入 (尚未规范化).
    pub input: ArrayD<f32>,

    /// 所属样本在整个数据集中的序号.
    pub sample: usize,

    /// 分块推理时的拼接信息.
    pub tile: Option<TileInfo>,
}

/// 推理数据集. 数据来自内存中的规范化数组, 或按需读取的文件.
#[derive(Clone, Debug)]
pub struct PredictDataset {
    source: Either<Vec<ArrayD<f32>>, (Vec<PathBuf>, Axes)>,
    tiling: Option<(Vec<usize>, Vec<usize>)>,
}

impl PredictDataset {
    /// 以规范化后的 `(N, C, [Z], Y, X)` 数组构建.
    pub fn from_arrays(arrays: Vec<ArrayD<f32>>) -> Self {
        Self {
            source: Either::Left(arrays),
            tiling: None,
        }
    }

    /// 以文件构建. 文件在推理时才会读取.
    pub fn from_files(files: Vec<PathBuf>, axes: Axes) -> Self {
        Self {
            source: Either::Right((files, axes)),
            tiling: None,
        }
    }

    /// 改为带重叠的分块推理.
    pub fn with_tiling(mut self, tile_size: Vec<usize>, overlap: Vec<usize>) -> Self {
        self.tiling = Some((tile_size, overlap));
        self
    }

    /// 是否分块推理.
    #[inline]
    pub fn is_tiled(&self) -> bool {
        self.tiling.is_some()
    }

    /// 数组 (或文件) 个数.
    pub fn len(&self) -> usize {
        self.source.as_ref().either(|a| a.len(), |(f, _)| f.len())
    }

    /// 是否没有任何数据.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 取出第 `index` 个规范化数组.
    pub fn load(&self, index: usize) -> Result<ArrayD<f32>> {
        let out_of_range = || {
            Error::Mismatch(format!("no array at index {index}, the dataset holds {}", self.len()))
        };
        match &self.source {
            Either::Left(arrays) => arrays.get(index).cloned().ok_or_else(out_of_range),
            Either::Right((files, axes)) => read_array(files.get(index).ok_or_else(out_of_range)?, axes),
        }
    }

    /// 将一个规范化数组拆成推理单元. `first_sample` 为该数组第一个样本在整个数据集中的序号.
    ///
    /// 分块时 [`TileInfo::sample`] 仍是数组内的序号, 以便对每个数组单独拼接.
    pub fn items(&self, array: &ArrayD<f32>, first_sample: usize) -> Result<Vec<PredictItem>> {
        match &self.tiling {
            Some((tile_size, overlap)) => Ok(extract_tiles(array.view(), tile_size, overlap)?
                .map(|(input, info)| PredictItem {
                    input,
                    sample: first_sample + info.sample,
                    tile: Some(info),
                })
                .collect()),
            None => Ok(array
                .axis_iter(Axis(0))
                .enumerate()
                .map(|(n, s)| PredictItem {
                    input: s.to_owned(),
                    sample: first_sample + n,
                    tile: None,
                })
                .collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::tests::ramp;

    #[test]
    fn test_whole_items() {
        let ds = PredictDataset::from_arrays(vec![ramp(&[2, 1, 8, 8]), ramp(&[1, 1, 8, 12])]);
        assert_eq!(ds.len(), 2);
        assert!(!ds.is_tiled());
        let a = ds.load(1).unwrap();
        let items = ds.items(&a, 2).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].sample, 2);
        assert_eq!(items[0].input.shape(), &[1, 8, 12]);
        assert!(matches!(ds.load(2), Err(Error::Mismatch(_))));
    }

    #[test]
    fn test_tiled_items() {
        let ds = PredictDataset::from_arrays(vec![ramp(&[2, 1, 20, 20])]).with_tiling(vec![8, 8], vec![2, 2]);
        assert!(ds.is_tiled());
        let a = ds.load(0).unwrap();
        let items = ds.items(&a, 5).unwrap();
        let per_sample = items.len() / 2;
        assert_eq!(items[0].sample, 5);
        assert_eq!(items[per_sample].sample, 6);
        assert!(items
            .iter()
            .all(|i| i.tile.as_ref().map(|t| t.sample + 5) == Some(i.sample)));
    }

    #[test]
    fn test_missing_file() {
        let ds = PredictDataset::from_files(vec![PathBuf::from("/nonexistent.npy")], Axes::new("YX").unwrap());
        assert_eq!(ds.len(), 1);
        assert!(ds.load(0).is_err());
    }
}
