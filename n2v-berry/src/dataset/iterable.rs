//! 逐文件读取的数据集.

use std::path::PathBuf;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::{extract_pairs, DatasetOptions, Sample, SamplePipeline, TrainingSource};
use crate::axes::Axes;
use crate::data::{read_array, validate_files, RunningStats, Stats};
use crate::{Error, Result};

/// 逐文件读取的数据集. 同一时刻内存中只有一个文件的数据.
///
/// 统计量需要额外遍历一次数据, 见 [`IterableDataset::compute_stats`] 与
/// [`IterableDataset::compute_running_stats`]; 未计算时为恒等变换.
#[derive(Clone, Debug)]
pub struct IterableDataset {
    files: Vec<PathBuf>,
    target_files: Option<Vec<PathBuf>>,
    axes: Axes,
    opts: DatasetOptions,
    pipeline: SamplePipeline,
}

impl IterableDataset {
    /// 构建数据集. 此时不会读取任何文件.
    pub fn new(
        files: Vec<PathBuf>,
        target_files: Option<Vec<PathBuf>>,
        axes: Axes,
        opts: DatasetOptions,
    ) -> Result<Self> {
        opts.check_strategy()?;
        if files.is_empty() {
            return Err(Error::Empty("no file to build the dataset from".to_string()));
        }
        if let Some(t) = &target_files {
            validate_files(&files, t)?;
        }
        let pipeline = opts.pipeline(Stats::default());
        Ok(Self {
            files,
            target_files,
            axes,
            opts,
            pipeline,
        })
    }

    /// 文件个数.
    #[inline]
    pub fn file_len(&self) -> usize {
        self.files.len()
    }

    /// 遍历全部文件, 以各文件均值/标准差的平均作为统计量, 与内存数据集一致.
    pub fn compute_stats(&mut self) -> Result<Stats> {
        let mut per_file = Vec::with_capacity(self.files.len());
        for f in &self.files {
            let a = read_array(f, &self.axes)?;
            per_file.extend(Stats::from_arrays([a.view()]));
        }
        let stats = Stats::average(per_file)
            .ok_or_else(|| Error::Empty("all files are empty".to_string()))?;
        log::info!("Computed stats: mean {:.4}, std {:.4}", stats.mean, stats.std);
        self.pipeline.set_stats(stats);
        Ok(stats)
    }

    /// 遍历全部文件, 以逐像素的在线均值/方差作为统计量.
    pub fn compute_running_stats(&mut self) -> Result<Stats> {
        let mut running = RunningStats::default();
        for f in &self.files {
            running.update(read_array(f, &self.axes)?.view());
        }
        let stats = running
            .stats()
            .ok_or_else(|| Error::Empty("all files are empty".to_string()))?;
        log::info!(
            "Running stats over {} pixels: mean {:.4}, std {:.4}",
            running.count(),
            stats.mean,
            stats.std
        );
        self.pipeline.set_stats(stats);
        Ok(stats)
    }

    /// 读取第 `i` 个文件并切块, 然后逐个 patch 处理.
    fn file_samples(&self, i: usize, epoch: usize, rng: &mut ChaCha8Rng) -> Vec<Result<Sample>> {
        let load = || -> Result<Vec<super::PatchPair>> {
            let input = read_array(&self.files[i], &self.axes)?;
            let target = match &self.target_files {
                Some(t) => Some(read_array(&t[i], &self.axes)?),
                None => None,
            };
            let seed = self
                .opts
                .seed
                .wrapping_add((epoch * self.files.len() + i) as u64);
            extract_pairs(input.view(), target.as_ref().map(|t| t.view()), &self.opts, seed)
        };
        match load() {
            Ok(pairs) => pairs
                .into_iter()
                .map(|(p, t)| self.pipeline.process(p, t, rng))
                .collect(),
            Err(e) => vec![Err(e)],
        }
    }
}

impl TrainingSource for IterableDataset {
    fn stats(&self) -> Stats {
        self.pipeline.stats()
    }

    fn set_stats(&mut self, stats: Stats) {
        self.pipeline.set_stats(stats);
    }

    fn len_hint(&self) -> Option<usize> {
        None
    }

    fn samples(&self, epoch: usize) -> Box<dyn Iterator<Item = Result<Sample>> + '_> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.opts.seed.wrapping_add(epoch as u64));
        let mut order: Vec<usize> = (0..self.files.len()).collect();
        if self.opts.shuffle {
            order.shuffle(&mut rng);
        }
        Box::new(
            order
                .into_iter()
                .flat_map(move |i| self.file_samples(i, epoch, &mut rng)),
        )
    }
}
