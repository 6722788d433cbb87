//! N2V 盲点像素操作.
//!
//! 对每个 patch 的每个通道, 分层随机地选出约 `masked_pixel_percentage` % 的像素,
//! 以邻域中的其它像素 (N2V) 或邻域中值 (N2V2) 替换, 同时记录掩码.
//! 网络只在被掩码像素上计算损失, 从而无法学到恒等映射.
//!
//! structN2V 额外在每个被掩码像素两侧的一条线上注入随机值,
//! 以抑制沿该方向相关的噪声.

use itertools::Itertools;
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Axis};
use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::consts::manipulation::*;
use crate::{Error, Result, SpatialIdx};

mod stratified;

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator};
    }
}

pub use stratified::{mask_pixel_distance, stratified_coords};

/// 被掩码像素的替换方式.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ManipulationStrategy {
    /// 从邻域中均匀随机选取一个像素值 (N2V).
    Uniform,

    /// 邻域中值, 不含中心像素 (N2V2).
    Median,
}

/// structN2V 线状掩码方向.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum StructAxis {
    /// 沿 `X` 轴.
    Horizontal,

    /// 沿 `Y` 轴.
    Vertical,
}

/// structN2V 线状掩码.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StructMask {
    /// 方向.
    pub axis: StructAxis,

    /// 线长 (含中心), 必须为不小于 3 的奇数.
    pub span: usize,
}

impl Default for StructMask {
    fn default() -> Self {
        Self {
            axis: StructAxis::Horizontal,
            span: DEFAULT_STRUCT_SPAN,
        }
    }
}

/// 盲点像素操作参数.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct N2vManipulate {
    masked_pixel_percentage: f32,
    roi_size: usize,
    strategy: ManipulationStrategy,
    remove_center: bool,
    struct_mask: Option<StructMask>,
}

impl Default for N2vManipulate {
    fn default() -> Self {
        Self {
            masked_pixel_percentage: DEFAULT_MASKED_PIXEL_PERCENTAGE,
            roi_size: DEFAULT_ROI_SIZE,
            strategy: ManipulationStrategy::Uniform,
            remove_center: true,
            struct_mask: None,
        }
    }
}

/// 一次盲点操作的结果.
#[derive(Clone, Debug)]
pub struct ManipulatedPatch {
    /// 被修改后的 patch, 作为网络输入.
    pub patch: ArrayD<f32>,

    /// 原始 patch, 作为损失的目标.
    pub original: ArrayD<f32>,

    /// 被掩码像素的位置, 与 patch 形状相同.
    pub mask: ArrayD<bool>,
}

impl ManipulatedPatch {
    /// 被掩码像素个数.
    #[inline]
    pub fn masked_len(&self) -> usize {
        self.mask.iter().filter(|m| **m).count()
    }
}

impl N2vManipulate {
    /// 构建参数.
    ///
    /// 1. `masked_pixel_percentage` 必须位于 `(0, 100]`;
    /// 2. `roi_size` 必须为不小于 3 的奇数;
    /// 3. `struct_mask.span` 必须为不小于 3 的奇数.
    pub fn new(
        masked_pixel_percentage: f32,
        roi_size: usize,
        strategy: ManipulationStrategy,
        remove_center: bool,
        struct_mask: Option<StructMask>,
    ) -> Result<Self> {
        let ans = Self {
            masked_pixel_percentage,
            roi_size,
            strategy,
            remove_center,
            struct_mask,
        };
        ans.validate()?;
        Ok(ans)
    }

    /// N2V2 参数: 邻域中值替换.
    #[inline]
    pub fn median() -> Self {
        Self {
            strategy: ManipulationStrategy::Median,
            ..Self::default()
        }
    }

    /// 检查参数合法性.
    pub fn validate(&self) -> Result<()> {
        let p = self.masked_pixel_percentage;
        if !(p > 0.0 && p <= 100.0) {
            return Err(Error::Config(format!(
                "masked pixel percentage must be in (0, 100], got {p}"
            )));
        }
        if self.roi_size < 3 || self.roi_size % 2 == 0 {
            return Err(Error::Config(format!(
                "roi size must be an odd number >= 3, got {}",
                self.roi_size
            )));
        }
        if let Some(s) = self.struct_mask {
            if s.span < 3 || s.span % 2 == 0 {
                return Err(Error::Config(format!(
                    "struct mask span must be an odd number >= 3, got {}",
                    s.span
                )));
            }
        }
        Ok(())
    }

    /// 被掩码像素百分比.
    #[inline]
    pub fn masked_pixel_percentage(&self) -> f32 {
        self.masked_pixel_percentage
    }

    /// 邻域边长.
    #[inline]
    pub fn roi_size(&self) -> usize {
        self.roi_size
    }

    /// 替换方式.
    #[inline]
    pub fn strategy(&self) -> ManipulationStrategy {
        self.strategy
    }

    /// structN2V 线状掩码.
    #[inline]
    pub fn struct_mask(&self) -> Option<StructMask> {
        self.struct_mask
    }

    /// 对 `(C, [Z], Y, X)` patch 施加盲点操作. 每个通道独立采样掩码位置.
    pub fn apply<R: Rng>(&self, patch: ArrayViewD<f32>, rng: &mut R) -> ManipulatedPatch {
        let original = patch.to_owned();
        let mut out = original.clone();
        let mut mask = ArrayD::from_elem(original.raw_dim(), false);

        for (c, orig) in original.axis_iter(Axis(0)).enumerate() {
            let mut ch = out.index_axis_mut(Axis(0), c);
            let mut ch_mask = mask.index_axis_mut(Axis(0), c);
            let shape = orig.shape().to_vec();

            let coords = stratified_coords(&shape, self.masked_pixel_percentage, rng);
            // 替换值均从原始 patch 读取.
            let values: Vec<f32> = coords
                .iter()
                .map(|p| match self.strategy {
                    ManipulationStrategy::Uniform => self.uniform_value(&orig, p, rng),
                    ManipulationStrategy::Median => self.median_value(&orig, p),
                })
                .collect();

            if let Some(s) = self.struct_mask {
                apply_struct_mask(&mut ch, &orig, &coords, s, rng);
            }
            for (p, v) in coords.iter().zip(values) {
                ch[p.as_slice()] = v;
                ch_mask[p.as_slice()] = true;
            }
        }

        ManipulatedPatch {
            patch: out,
            original,
            mask,
        }
    }

    /// 对一组 patch 施加盲点操作. 第 `i` 个 patch 使用种子 `seed + i`,
    /// 因此结果与是否并行无关.
    pub fn apply_batch(&self, patches: &[ArrayD<f32>], seed: u64) -> Vec<ManipulatedPatch> {
        let op = |(i, p): (usize, &ArrayD<f32>)| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(i as u64));
            self.apply(p.view(), &mut rng)
        };

        #[cfg(feature = "rayon")]
        let ans = patches.par_iter().enumerate().map(op).collect();
        #[cfg(not(feature = "rayon"))]
        let ans = patches.iter().enumerate().map(op).collect();
        ans
    }

    /// 邻域 (按图像边界裁剪) 在各轴上的闭区间.
    fn roi_bounds(&self, shape: &[usize], p: &[usize]) -> Vec<(usize, usize)> {
        let r = self.roi_size / 2;
        p.iter()
            .zip(shape)
            .map(|(&c, &s)| (c.saturating_sub(r), (c + r).min(s - 1)))
            .collect()
    }

    /// 在邻域中均匀随机选取一个像素值. `remove_center` 时不会选中 `p` 自身,
    /// 除非邻域中只有 `p` 一个像素.
    fn uniform_value<R: Rng>(&self, orig: &ArrayViewD<f32>, p: &SpatialIdx, rng: &mut R) -> f32 {
        let bounds = self.roi_bounds(orig.shape(), p);
        let only_center = bounds.iter().all(|(lo, hi)| lo == hi);
        loop {
            let q: SpatialIdx = bounds.iter().map(|&(lo, hi)| rng.gen_range(lo..=hi)).collect();
            if !(self.remove_center && &q == p) || only_center {
                return orig[q.as_slice()];
            }
        }
    }

    /// 邻域中值, 不含 `p` 自身. 偶数个值时取中间两个的平均.
    fn median_value(&self, orig: &ArrayViewD<f32>, p: &SpatialIdx) -> f32 {
        let mut values: Vec<OrderedFloat<f32>> = self
            .roi_bounds(orig.shape(), p)
            .into_iter()
            .map(|(lo, hi)| lo..=hi)
            .multi_cartesian_product()
            .filter(|q| q != p)
            .map(|q| OrderedFloat(orig[q.as_slice()]))
            .collect();
        if values.is_empty() {
            return orig[p.as_slice()];
        }

        let n = values.len();
        let (lower, &mut upper, _) = values.select_nth_unstable(n / 2);
        if n % 2 == 1 {
            upper.0
        } else {
            let below = lower.iter().max().map_or(upper.0, |v| v.0);
            (below + upper.0) / 2.0
        }
    }
}

/// structN2V: 在每个被掩码像素两侧的线上写入 `[min, max]` 内的均匀随机值.
/// 中心像素与掩码本身不受影响.
fn apply_struct_mask<R: Rng>(
    ch: &mut ArrayViewMutD<f32>,
    orig: &ArrayViewD<f32>,
    coords: &[SpatialIdx],
    s: StructMask,
    rng: &mut R,
) {
    let (lo, hi) = orig
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let ndim = orig.ndim();
    let axis = match s.axis {
        StructAxis::Horizontal => ndim - 1,
        StructAxis::Vertical => ndim - 2,
    };
    let len = orig.shape()[axis] as isize;
    let half = (s.span / 2) as isize;

    for p in coords {
        for off in (-half..=half).filter(|&o| o != 0) {
            let pos = p[axis] as isize + off;
            if !(0..len).contains(&pos) {
                continue;
            }
            let mut q = p.clone();
            q[axis] = pos as usize;
            ch[q.as_slice()] = if lo < hi { rng.gen_range(lo..hi) } else { lo };
        }
    }
}
