//! 内存数据集.

use std::path::PathBuf;

use ndarray::ArrayD;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::{extract_pairs, DatasetOptions, PatchPair, Sample, SamplePipeline, TrainingSource};
use crate::axes::Axes;
use crate::data::{file_loader, validate_files, Stats};
use crate::{Error, Result};

/// 一次性载入全部数据并预先切块的数据集.
///
/// 统计量取自全部输入数组. 随机切块只在构建时进行一次, 之后每个 epoch
/// 仅打乱顺序并重新做增强与盲点操作.
#[derive(Clone, Debug)]
pub struct InMemoryDataset {
    pairs: Vec<PatchPair>,
    pipeline: SamplePipeline,
    shuffle: bool,
    seed: u64,
}

impl InMemoryDataset {
    /// 从规范化后的 `(N, C, [Z], Y, X)` 数组构建. `targets` 若存在, 须与 `inputs` 一一对应.
    pub fn from_arrays(
        inputs: &[ArrayD<f32>],
        targets: Option<&[ArrayD<f32>]>,
        opts: &DatasetOptions,
    ) -> Result<Self> {
        opts.check_strategy()?;
        if let Some(t) = targets {
            if t.len() != inputs.len() {
                return Err(Error::Mismatch(format!(
                    "{} inputs but {} targets",
                    inputs.len(),
                    t.len()
                )));
            }
        }
        let stats = Stats::from_arrays(inputs.iter().map(|a| a.view()))
            .ok_or_else(|| Error::Empty("no data to build the dataset from".to_string()))?;

        let mut pairs = Vec::new();
        for (i, input) in inputs.iter().enumerate() {
            let target = targets.map(|t| t[i].view());
            let seed = opts.seed.wrapping_add(i as u64);
            pairs.extend(extract_pairs(input.view(), target, opts, seed)?);
        }
        log::info!(
            "In-memory dataset: {} arrays, {} patches, mean {:.4}, std {:.4}",
            inputs.len(),
            pairs.len(),
            stats.mean,
            stats.std
        );

        Ok(Self {
            pairs,
            pipeline: opts.pipeline(stats),
            shuffle: opts.shuffle,
            seed: opts.seed,
        })
    }

    /// 从文件构建. `target_files` 若存在, 须与 `files` 文件名一一对应.
    pub fn from_files(
        files: &[PathBuf],
        target_files: Option<&[PathBuf]>,
        axes: &Axes,
        opts: &DatasetOptions,
    ) -> Result<Self> {
        let read_all = |files: &[PathBuf]| -> Result<Vec<ArrayD<f32>>> {
            file_loader(files.iter().cloned(), axes.clone())
                .map(|(_, a)| a)
                .collect()
        };
        let inputs = read_all(files)?;
        let targets = match target_files {
            Some(t) => {
                validate_files(files, t)?;
                Some(read_all(t)?)
            }
            None => None,
        };
        Self::from_arrays(&inputs, targets.as_deref(), opts)
    }

    /// patch 个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// 是否没有任何 patch.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl TrainingSource for InMemoryDataset {
    fn stats(&self) -> Stats {
        self.pipeline.stats()
    }

    fn set_stats(&mut self, stats: Stats) {
        self.pipeline.set_stats(stats);
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.len())
    }

    fn samples(&self, epoch: usize) -> Box<dyn Iterator<Item = Result<Sample>> + '_> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        let mut order: Vec<usize> = (0..self.pairs.len()).collect();
        if self.shuffle {
            order.shuffle(&mut rng);
        }
        Box::new(order.into_iter().map(move |i| {
            let (patch, target) = &self.pairs[i];
            self.pipeline.process(patch.clone(), target.clone(), &mut rng)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::temp_dir;
    use crate::patch::tests::ramp;
    use crate::patch::ExtractionStrategy;

    fn opts() -> DatasetOptions {
        DatasetOptions {
            strategy: ExtractionStrategy::Sequential,
            ..DatasetOptions::new(vec![8, 8])
        }
    }

    #[test]
    fn test_from_arrays() {
        let a = ramp(&[2, 1, 16, 20]);
        let ds = InMemoryDataset::from_arrays(&[a.clone()], None, &opts()).unwrap();
        // 每个样本 2 x 3 个 patch.
        assert_eq!(ds.len(), 12);
        assert_eq!(ds.len_hint(), Some(12));
        let stats = ds.stats();
        assert!((stats.mean - a.mean().unwrap()).abs() < 1e-2);

        let samples: Vec<_> = ds.samples(0).map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 12);
        assert!(samples.iter().all(|s| s.input.shape() == [1, 8, 8] && s.mask.is_some()));

        // 同一 epoch 结果确定, 不同 epoch 顺序不同.
        let again: Vec<_> = ds.samples(0).map(|s| s.unwrap().target).collect();
        assert!(samples.iter().zip(&again).all(|(s, t)| &s.target == t));
    }

    #[test]
    fn test_supervised_and_errors() {
        let a = ramp(&[1, 1, 16, 16]);
        let t = a.mapv(|v| v * 0.5);
        let supervised = DatasetOptions {
            manipulate: None,
            augmentations: vec![],
            ..opts()
        };
        let ds = InMemoryDataset::from_arrays(&[a.clone()], Some(&[t.clone()]), &supervised).unwrap();
        assert!(ds.samples(1).all(|s| s.unwrap().mask.is_none()));

        assert!(InMemoryDataset::from_arrays(&[a.clone()], Some(&[]), &supervised).is_err());
        assert!(matches!(
            InMemoryDataset::from_arrays(&[], None, &supervised),
            Err(Error::Empty(_))
        ));
        let tiled = DatasetOptions {
            strategy: ExtractionStrategy::Tiled,
            ..opts()
        };
        assert!(InMemoryDataset::from_arrays(&[a], None, &tiled).is_err());

        let no_target = InMemoryDataset::from_arrays(&[t], None, &supervised).unwrap();
        assert!(no_target.samples(0).next().unwrap().is_err());
    }

    #[test]
    fn test_from_files() {
        let dir = temp_dir("in-memory");
        let path = dir.join("img.npy");
        ndarray_npy::write_npy(&path, &ramp(&[16, 16])).unwrap();
        let axes = Axes::new("YX").unwrap();
        let files = vec![path];
        let ds = InMemoryDataset::from_files(&files, Some(&files), &axes, &opts()).unwrap();
        assert_eq!(ds.len(), 4);
        std::fs::remove_dir_all(dir).unwrap();
    }
}
