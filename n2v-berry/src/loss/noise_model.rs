use ndarray::{Array2, ArrayViewD, Zip};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// 防止对数似然出现 `ln(0)`.
const LIKELIHOOD_EPS: f32 = 1e-10;

/// PN2V 直方图噪声模型.
///
/// `density[[s, o]]` 为干净信号落在第 `s` 个 bin 时, 观测值落在第 `o` 个 bin 的概率密度.
/// 信号方向在相邻 bin 中心之间线性插值, 因此似然对信号可导.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramNoiseModel {
    min: f32,
    max: f32,
    density: Array2<f32>,
}

impl HistogramNoiseModel {
    /// 由成对的干净信号与噪声观测统计直方图. `[min, max)` 被等分为 `bins` 份,
    /// 区间外的值归入两端的 bin.
    pub fn from_data(
        signal: ArrayViewD<f32>,
        observation: ArrayViewD<f32>,
        bins: usize,
        min: f32,
        max: f32,
    ) -> Result<Self> {
        Self::check_range(bins, min, max)?;
        if signal.shape() != observation.shape() {
            return Err(Error::Mismatch(format!(
                "signal shape {:?} differs from observation shape {:?}",
                signal.shape(),
                observation.shape()
            )));
        }

        let mut counts = Array2::<f32>::zeros((bins, bins));
        let bin_of = |v: f32| Self::bin(v, bins, min, max);
        Zip::from(&signal)
            .and(&observation)
            .for_each(|&s, &o| counts[[bin_of(s), bin_of(o)]] += 1.0);
        Self::from_density(counts, min, max)
    }

    /// 由 (未归一化的) 直方图构建. 每一行会被归一化为概率密度, 全零行保持为零.
    pub fn from_density(mut histogram: Array2<f32>, min: f32, max: f32) -> Result<Self> {
        let (rows, cols) = histogram.dim();
        if rows != cols {
            return Err(Error::Config(format!(
                "noise model histogram must be square, got {rows}x{cols}"
            )));
        }
        Self::check_range(rows, min, max)?;
        let width = (max - min) / rows as f32;
        for mut row in histogram.rows_mut() {
            let sum = row.sum();
            if sum > 0.0 {
                row /= sum * width;
            }
        }
        Ok(Self {
            min,
            max,
            density: histogram,
        })
    }

    fn check_range(bins: usize, min: f32, max: f32) -> Result<()> {
        if bins == 0 || !(min < max) {
            return Err(Error::Config(format!(
                "invalid noise model range [{min}, {max}) with {bins} bins"
            )));
        }
        Ok(())
    }

    #[inline]
    fn bin(v: f32, bins: usize, min: f32, max: f32) -> usize {
        let t = (v - min) / (max - min) * bins as f32;
        (t.max(0.0) as usize).min(bins - 1)
    }

    /// bin 个数.
    #[inline]
    pub fn bins(&self) -> usize {
        self.density.nrows()
    }

    /// bin 宽度.
    #[inline]
    pub fn bin_width(&self) -> f32 {
        (self.max - self.min) / self.bins() as f32
    }

    /// 归一化后的密度表.
    #[inline]
    pub fn density(&self) -> &Array2<f32> {
        &self.density
    }

    /// 信号在 bin 中心坐标下的位置: 下侧 bin, 上侧 bin, 插值权重.
    fn signal_pos(&self, signal: f32) -> (usize, usize, f32) {
        let last = self.bins() - 1;
        let t = ((signal - self.min) / self.bin_width() - 0.5).clamp(0.0, last as f32);
        let lo = t.floor() as usize;
        let hi = (lo + 1).min(last);
        (lo, hi, t - lo as f32)
    }

    /// 观测值 `observation` 在干净信号为 `signal` 时的似然.
    pub fn likelihood(&self, observation: f32, signal: f32) -> f32 {
        let o = Self::bin(observation, self.bins(), self.min, self.max);
        let (lo, hi, f) = self.signal_pos(signal);
        (1.0 - f) * self.density[[lo, o]] + f * self.density[[hi, o]] + LIKELIHOOD_EPS
    }

    /// [`Self::likelihood`] 对 `signal` 的导数. 信号超出 bin 中心范围时为 0.
    pub fn likelihood_grad(&self, observation: f32, signal: f32) -> f32 {
        let o = Self::bin(observation, self.bins(), self.min, self.max);
        let t = (signal - self.min) / self.bin_width() - 0.5;
        if t <= 0.0 || t >= (self.bins() - 1) as f32 {
            return 0.0;
        }
        let (lo, hi, _) = self.signal_pos(signal);
        (self.density[[hi, o]] - self.density[[lo, o]]) / self.bin_width()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, ArrayD, IxDyn};

    #[test]
    fn test_from_data_rows_normalized() {
        let signal = ArrayD::from_shape_vec(IxDyn(&[6]), vec![0.1, 0.1, 0.1, 0.9, 0.9, 5.0]).unwrap();
        let obs = ArrayD::from_shape_vec(IxDyn(&[6]), vec![0.1, 0.2, 0.8, 0.9, 0.6, 0.9]).unwrap();
        let nm = HistogramNoiseModel::from_data(signal.view(), obs.view(), 4, 0.0, 1.0).unwrap();
        assert_eq!(nm.bins(), 4);
        for row in nm.density().rows() {
            let integral = row.sum() * nm.bin_width();
            assert!(integral == 0.0 || (integral - 1.0).abs() < 1e-5);
        }
        // 第 0 行: 两次落在 bin 0, 一次落在 bin 3.
        assert!((nm.density()[[0, 0]] - 2.0 / 3.0 / 0.25).abs() < 1e-5);
    }

    #[test]
    fn test_likelihood_interpolation() {
        let h = array![[1.0f32, 0.0], [0.0, 1.0]];
        let nm = HistogramNoiseModel::from_density(h, 0.0, 2.0).unwrap();
        // bin 中心为 0.5 与 1.5.
        assert!((nm.likelihood(0.2, 0.5) - 1.0).abs() < 1e-5);
        assert!((nm.likelihood(0.2, 1.0) - 0.5).abs() < 1e-5);
        assert!(nm.likelihood(0.2, 1.5) < 1e-5);
        assert!((nm.likelihood_grad(0.2, 1.0) + 1.0).abs() < 1e-5);
        assert_eq!(nm.likelihood_grad(0.2, 0.1), 0.0);
    }

    #[test]
    fn test_invalid() {
        assert!(HistogramNoiseModel::from_density(Array2::zeros((2, 3)), 0.0, 1.0).is_err());
        assert!(HistogramNoiseModel::from_density(Array2::zeros((2, 2)), 1.0, 1.0).is_err());
        let a = ArrayD::<f32>::zeros(IxDyn(&[3]));
        let b = ArrayD::<f32>::zeros(IxDyn(&[4]));
        assert!(HistogramNoiseModel::from_data(a.view(), b.view(), 4, 0.0, 1.0).is_err());
    }
}
