//! 训练与推理数据集.
//!
//! 训练数据集产出 [`Sample`]: 网络输入, 损失目标, 以及 (自监督时) 掩码.
//! 每个 patch 依次经过 "增强 -> 规范化 -> 盲点操作" 三步, 见 [`SamplePipeline`].
//!
//! 1. [`InMemoryDataset`]: 一次性载入全部数据并切块;
//! 2. [`IterableDataset`]: 逐文件读取, 适合无法全部载入内存的数据;
//! 3. [`PredictDataset`]: 推理数据, 按整幅样本或带重叠分块产出.

use ndarray::{ArrayD, ArrayViewD, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::data::Stats;
use crate::manipulate::N2vManipulate;
use crate::patch::{
    extract_patches_random, extract_patches_sequential, ExtractionStrategy, PatchCoords, Patches,
};
use crate::transforms::Augmentation;
use crate::{Error, Result};

mod in_memory;
mod iterable;
mod predict;

pub use in_memory::InMemoryDataset;
pub use iterable::IterableDataset;
pub use predict::{PredictDataset, PredictItem};

/// 输入 patch 及其 (可选的) 监督目标 patch.
pub(crate) type PatchPair = (ArrayD<f32>, Option<ArrayD<f32>>);

/// 单个训练样本, 各数组均为 `(C, [Z], Y, X)`.
#[derive(Clone, Debug)]
pub struct Sample {
    /// 网络输入.
    pub input: ArrayD<f32>,

    /// 损失目标. 自监督时为操作前的原始 patch.
    pub target: ArrayD<f32>,

    /// 被掩码像素. 仅自监督时存在.
    pub mask: Option<ArrayD<bool>>,
}

/// 一个 batch, 各数组均为 `(B, C, [Z], Y, X)`.
#[derive(Clone, Debug)]
pub struct Batch {
    /// 网络输入.
    pub input: ArrayD<f32>,

    /// 损失目标.
    pub target: ArrayD<f32>,

    /// 被掩码像素.
    pub mask: Option<ArrayD<bool>>,
}

impl Batch {
    /// 沿新的第 0 轴堆叠样本. 样本形状必须一致, 且要么都有掩码, 要么都没有.
    pub fn stack(samples: &[Sample]) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::Empty("cannot stack an empty batch".to_string()));
        }
        let inputs: Vec<_> = samples.iter().map(|s| s.input.view()).collect();
        let targets: Vec<_> = samples.iter().map(|s| s.target.view()).collect();
        let masks: Vec<_> = samples.iter().filter_map(|s| s.mask.as_ref()).map(|m| m.view()).collect();

        let mask = match masks.len() {
            0 => None,
            n if n == samples.len() => Some(ndarray::stack(Axis(0), &masks)?),
            _ => {
                return Err(Error::Mismatch(
                    "some samples in the batch have no mask".to_string(),
                ))
            }
        };
        Ok(Self {
            input: ndarray::stack(Axis(0), &inputs)?,
            target: ndarray::stack(Axis(0), &targets)?,
            mask,
        })
    }

    /// batch 大小.
    #[inline]
    pub fn len(&self) -> usize {
        self.input.len_of(Axis(0))
    }

    /// batch 是否为空. 由 [`Batch::stack`] 构建的 batch 永远非空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 训练数据集的构建参数.
#[derive(Clone, Debug)]
pub struct DatasetOptions {
    /// patch 大小, 按 `([Z], Y, X)` 顺序.
    pub patch_size: Vec<usize>,

    /// 切块策略, 只能是顺序或随机.
    pub strategy: ExtractionStrategy,

    /// 数据增强, 按顺序施加.
    pub augmentations: Vec<Augmentation>,

    /// 盲点像素操作. `None` 表示有监督训练.
    pub manipulate: Option<N2vManipulate>,

    /// 每个 epoch 是否打乱顺序.
    pub shuffle: bool,

    /// 随机种子.
    pub seed: u64,
}

impl DatasetOptions {
    /// 以默认 N2V 操作构建.
    pub fn new(patch_size: Vec<usize>) -> Self {
        Self {
            patch_size,
            strategy: ExtractionStrategy::Random,
            augmentations: vec![Augmentation::NdFlip, Augmentation::XyRandomRotate90],
            manipulate: Some(N2vManipulate::default()),
            shuffle: true,
            seed: 0,
        }
    }

    pub(crate) fn check_strategy(&self) -> Result<()> {
        if self.strategy == ExtractionStrategy::Tiled {
            return Err(tiled_for_training());
        }
        Ok(())
    }

    pub(crate) fn pipeline(&self, stats: Stats) -> SamplePipeline {
        SamplePipeline::new(self.augmentations.clone(), stats, self.manipulate.clone())
    }
}

fn tiled_for_training() -> Error {
    Error::Config("tiled extraction is only available for prediction".to_string())
}

/// 单个 patch 的处理流水线: 增强 -> 规范化 -> 盲点操作.
#[derive(Clone, Debug)]
pub struct SamplePipeline {
    augmentations: Vec<Augmentation>,
    stats: Stats,
    manipulate: Option<N2vManipulate>,
}

impl SamplePipeline {
    /// 构建流水线.
    pub fn new(augmentations: Vec<Augmentation>, stats: Stats, manipulate: Option<N2vManipulate>) -> Self {
        Self {
            augmentations,
            stats,
            manipulate,
        }
    }

    /// 规范化所用的统计量.
    #[inline]
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// 替换统计量.
    #[inline]
    pub fn set_stats(&mut self, stats: Stats) {
        self.stats = stats;
    }

    /// 处理一个 patch 及其 (可选的) 监督目标.
    ///
    /// 自监督时忽略 `target`; 有监督时 `target` 必须存在.
    pub fn process<R: Rng>(
        &self,
        mut patch: ArrayD<f32>,
        mut target: Option<ArrayD<f32>>,
        rng: &mut R,
    ) -> Result<Sample> {
        for aug in &self.augmentations {
            aug.apply(&mut patch, target.as_mut(), rng);
        }
        self.stats.normalize_inplace(&mut patch);

        if let Some(m) = &self.manipulate {
            let out = m.apply(patch.view(), rng);
            return Ok(Sample {
                input: out.patch,
                target: out.original,
                mask: Some(out.mask),
            });
        }

        let mut target = target.ok_or_else(|| {
            Error::Mismatch("supervised training requires a target for every patch".to_string())
        })?;
        self.stats.normalize_inplace(&mut target);
        Ok(Sample {
            input: patch,
            target,
            mask: None,
        })
    }
}

/// 按 `opts` 中的策略从一个规范化数组 (及其监督目标) 中切出全部 patch 对.
pub(crate) fn extract_pairs<'a>(
    input: ArrayViewD<'a, f32>,
    target: Option<ArrayViewD<'a, f32>>,
    opts: &DatasetOptions,
    seed: u64,
) -> Result<Vec<PatchPair>> {
    fn with_target<'b, C: Iterator<Item = PatchCoords>>(
        p: Patches<'b, C>,
        target: Option<ArrayViewD<'b, f32>>,
    ) -> Result<Vec<PatchPair>> {
        Ok(match target {
            Some(t) => p.with_target(t)?.collect(),
            None => p.collect(),
        })
    }

    match opts.strategy {
        ExtractionStrategy::Sequential => {
            with_target(extract_patches_sequential(input, &opts.patch_size)?, target)
        }
        ExtractionStrategy::Random => {
            let rng = ChaCha8Rng::seed_from_u64(seed);
            with_target(extract_patches_random(input, &opts.patch_size, rng)?, target)
        }
        ExtractionStrategy::Tiled => Err(tiled_for_training()),
    }
}

/// 可供引擎训练/验证的数据源.
pub trait TrainingSource {
    /// 规范化所用的统计量.
    fn stats(&self) -> Stats;

    /// 替换统计量. 验证集使用训练集的统计量.
    fn set_stats(&mut self, stats: Stats);

    /// 每个 epoch 的样本数. 逐文件读取的数据源事先未知时返回 `None`.
    fn len_hint(&self) -> Option<usize>;

    /// 第 `epoch` 轮的样本流. 同一 `epoch` 的结果是确定的.
    fn samples(&self, epoch: usize) -> Box<dyn Iterator<Item = Result<Sample>> + '_>;
}

/// 按 `batch_size` 分组的样本流, 见 [`batches`].
pub struct Batches<I> {
    inner: I,
    batch_size: usize,
}

impl<I: Iterator<Item = Result<Sample>>> Iterator for Batches<I> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = Vec::with_capacity(self.batch_size);
        for s in self.inner.by_ref().take(self.batch_size) {
            match s {
                Ok(s) => buf.push(s),
                Err(e) => return Some(Err(e)),
            }
        }
        if buf.is_empty() {
            None
        } else {
            Some(Batch::stack(&buf))
        }
    }
}

/// 将样本流分组为 batch. 最后一个 batch 可能不满; `batch_size` 为 0 时按 1 处理.
pub fn batches<I: IntoIterator<Item = Result<Sample>>>(it: I, batch_size: usize) -> Batches<I::IntoIter> {
    Batches {
        inner: it.into_iter(),
        batch_size: batch_size.max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::tests::ramp;
    use ndarray::IxDyn;

    fn sample(v: f32, masked: bool) -> Sample {
        let a = ArrayD::from_elem(IxDyn(&[1, 4, 4]), v);
        Sample {
            input: a.clone(),
            target: a.clone(),
            mask: masked.then(|| a.mapv(|_| true)),
        }
    }

    #[test]
    fn test_batch_stack() {
        let b = Batch::stack(&[sample(1.0, true), sample(2.0, true)]).unwrap();
        assert_eq!(b.len(), 2);
        assert_eq!(b.input.shape(), &[2, 1, 4, 4]);
        assert_eq!(b.mask.as_ref().unwrap().shape(), &[2, 1, 4, 4]);
        assert_eq!(b.input[[1, 0, 0, 0]], 2.0);

        assert!(Batch::stack(&[sample(1.0, true), sample(2.0, false)]).is_err());
        assert!(matches!(Batch::stack(&[]), Err(Error::Empty(_))));
        assert!(Batch::stack(&[sample(1.0, false)]).unwrap().mask.is_none());
    }

    #[test]
    fn test_batches() {
        let samples: Vec<_> = (0..5).map(|i| Ok(sample(i as f32, false))).collect();
        let sizes: Vec<_> = batches(samples, 2).map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, [2, 2, 1]);

        let with_err = vec![Ok(sample(0.0, false)), Err(Error::Model("boom".to_string()))];
        let mut it = batches(with_err, 4);
        assert!(it.next().unwrap().is_err());
    }

    #[test]
    fn test_pipeline() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let stats = Stats::new(10.0, 2.0);
        let patch = ramp(&[1, 1, 16, 16]).index_axis_move(Axis(0), 0);

        let n2v = SamplePipeline::new(vec![], stats, Some(N2vManipulate::default()));
        let s = n2v.process(patch.clone(), None, &mut rng).unwrap();
        assert!(s.mask.is_some());
        assert_eq!(s.target, stats.normalized(patch.view()));

        let care = SamplePipeline::new(vec![Augmentation::NdFlip], stats, None);
        assert!(care.process(patch.clone(), None, &mut rng).is_err());
        let s = care
            .process(patch.clone(), Some(patch.mapv(|v| v + 1.0)), &mut rng)
            .unwrap();
        assert!(s.mask.is_none());
        // 翻转对输入和目标一致.
        let diff = &s.target - &s.input;
        assert!(diff.iter().all(|d| (d - 0.5).abs() < 1e-3));
    }
}
