//! 均值/标准差统计与规范化.

use ndarray::{ArrayD, ArrayViewD};
use serde::{Deserialize, Serialize};

use crate::consts::NORM_EPS;

/// 数据集的强度统计, 用于输入规范化与输出反规范化.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// 均值.
    pub mean: f32,

    /// 标准差.
    pub std: f32,
}

impl Default for Stats {
    /// 恒等变换.
    #[inline]
    fn default() -> Self {
        Self {
            mean: 0.0,
            std: 1.0,
        }
    }
}

/// 计算单幅图像的 (均值, 总体标准差), 以 `f64` 累加.
fn mean_std(a: &ArrayViewD<f32>) -> Option<(f64, f64)> {
    if a.is_empty() {
        return None;
    }
    let n = a.len() as f64;
    let mean = a.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = a.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    Some((mean, var.sqrt()))
}

impl Stats {
    /// 构建统计量.
    #[inline]
    pub fn new(mean: f32, std: f32) -> Self {
        Self { mean, std }
    }

    /// 以 "各图像均值的平均" 和 "各图像标准差的平均" 作为数据集统计量.
    ///
    /// 没有非空图像时返回 `None`.
    pub fn from_arrays<'a, I: IntoIterator<Item = ArrayViewD<'a, f32>>>(it: I) -> Option<Self> {
        let (mut means, mut stds, mut count) = (0.0, 0.0, 0u64);
        for (m, s) in it.into_iter().filter_map(|a| mean_std(&a)) {
            means += m;
            stds += s;
            count += 1;
        }
        (count > 0).then(|| Self {
            mean: (means / count as f64) as f32,
            std: (stds / count as f64) as f32,
        })
    }

    /// 对若干统计量取算术平均. 与对全部图像调用 [`Stats::from_arrays`] 等价,
    /// 适用于逐个文件计算统计量的场景.
    pub fn average<I: IntoIterator<Item = Stats>>(it: I) -> Option<Self> {
        let (mut means, mut stds, mut count) = (0.0f64, 0.0f64, 0u64);
        for s in it {
            means += s.mean as f64;
            stds += s.std as f64;
            count += 1;
        }
        (count > 0).then(|| Self {
            mean: (means / count as f64) as f32,
            std: (stds / count as f64) as f32,
        })
    }

    /// 原地规范化: `(x - mean) / (std + eps)`.
    pub fn normalize_inplace(&self, a: &mut ArrayD<f32>) {
        let (mean, denom) = (self.mean, self.std + NORM_EPS);
        a.mapv_inplace(|v| (v - mean) / denom);
    }

    /// 规范化并返回新数组.
    #[inline]
    pub fn normalized(&self, a: ArrayViewD<f32>) -> ArrayD<f32> {
        let mut a = a.to_owned();
        self.normalize_inplace(&mut a);
        a
    }

    /// 原地反规范化: `x * (std + eps) + mean`.
    pub fn denormalize_inplace(&self, a: &mut ArrayD<f32>) {
        let (mean, denom) = (self.mean, self.std + NORM_EPS);
        a.mapv_inplace(|v| v * denom + mean);
    }
}

/// Welford 在线均值/方差累加器. 适用于无法一次性载入全部数据的场景.
///
/// 与 [`Stats::from_arrays`] 不同, 该累加器按像素而非按图像加权.
#[derive(Copy, Clone, Debug, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    /// 累加一幅图像的全部像素.
    pub fn update(&mut self, a: ArrayViewD<f32>) {
        for &v in a.iter() {
            self.count += 1;
            let v = v as f64;
            let delta = v - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (v - self.mean);
        }
    }

    /// 已累加像素个数.
    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// 当前统计量. 尚未累加任何像素时返回 `None`.
    pub fn stats(&self) -> Option<Stats> {
        (self.count > 0).then(|| Stats {
            mean: self.mean as f32,
            std: (self.m2 / self.count as f64).sqrt() as f32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{RunningStats, Stats};
    use ndarray::{arr1, ArrayD};

    fn f32_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_stats_from_arrays() {
        let a = arr1(&[1.0f32, 3.0]).into_dyn();
        let b = arr1(&[10.0f32, 10.0, 10.0]).into_dyn();
        let s = Stats::from_arrays([a.view(), b.view()]).unwrap();
        // means: 2, 10; stds: 1, 0
        assert!(f32_eq(s.mean, 6.0));
        assert!(f32_eq(s.std, 0.5));

        let empty = ArrayD::<f32>::zeros(vec![0]);
        assert!(Stats::from_arrays([empty.view()]).is_none());

        let per_image = [a.view(), b.view()].map(|v| Stats::from_arrays([v]).unwrap());
        let avg = Stats::average(per_image).unwrap();
        assert!(f32_eq(avg.mean, s.mean));
        assert!(f32_eq(avg.std, s.std));
        assert!(Stats::average([]).is_none());
    }

    #[test]
    fn test_normalize_inverse() {
        let s = Stats::new(5.0, 2.0);
        let orig = arr1(&[1.0f32, 5.0, 9.0]).into_dyn();
        let mut a = s.normalized(orig.view());
        assert!(f32_eq(a[[1]], 0.0));
        assert!(f32_eq(a[[2]], 2.0));
        s.denormalize_inplace(&mut a);
        for (x, y) in a.iter().zip(orig.iter()) {
            assert!(f32_eq(*x, *y));
        }
    }

    #[test]
    fn test_running_stats() {
        let mut r = RunningStats::default();
        assert!(r.stats().is_none());
        r.update(arr1(&[2.0f32, 4.0]).into_dyn().view());
        r.update(arr1(&[4.0f32, 4.0, 5.0, 5.0, 7.0, 9.0]).into_dyn().view());
        let s = r.stats().unwrap();
        assert_eq!(r.count(), 8);
        assert!(f32_eq(s.mean, 5.0));
        assert!(f32_eq(s.std, 2.0));
    }
}
