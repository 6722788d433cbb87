use itertools::Itertools;
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Slice, Zip};

use super::{clip_grad_norm, Model, ModelState, StepOptions};
use crate::dataset::Batch;
use crate::loss::Loss;
use crate::{Error, Result};

/// 在全部空间轴上共享权重的线性卷积滤波器, 边界按边缘像素复制填充.
///
/// `blind_spot` 时中心权重恒为 0, 即输出不依赖同一位置的输入, 这正是 N2V 对网络的要求.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearFilter {
    name: String,
    spatial_dims: usize,
    kernel: usize,
    weights: Vec<f32>,
    bias: f32,
    blind_spot: bool,
    trainable: bool,
}

impl LinearFilter {
    /// 可训练的滤波器. 盲点滤波器初始化为邻域均值, 否则初始化为恒等映射.
    ///
    /// `spatial_dims` 为 2 或 3, `kernel` 为不小于 3 的奇数.
    pub fn new(spatial_dims: usize, kernel: usize, blind_spot: bool) -> Result<Self> {
        if !(2..=3).contains(&spatial_dims) || kernel < 3 || kernel % 2 == 0 {
            return Err(Error::Model(format!(
                "invalid filter: {spatial_dims} spatial dims, kernel {kernel}"
            )));
        }
        let len = kernel.pow(spatial_dims as u32);
        let center = len / 2;
        let weights = (0..len)
            .map(|i| match (blind_spot, i == center) {
                (true, true) => 0.0,
                (true, false) => 1.0 / (len - 1) as f32,
                (false, c) => f32::from(c),
            })
            .collect();
        Ok(Self {
            name: format!("linear-filter-{spatial_dims}d-{kernel}"),
            spatial_dims,
            kernel,
            weights,
            bias: 0.0,
            blind_spot,
            trainable: true,
        })
    }

    /// 不可训练的邻域均值 (不含中心) 滤波器.
    pub fn blind_spot_mean(spatial_dims: usize, kernel: usize) -> Result<Self> {
        let mut ans = Self::new(spatial_dims, kernel, true)?;
        ans.trainable = false;
        Ok(ans)
    }

    /// 卷积核权重, 按 `([Z], Y, X)` 行优先排列.
    #[inline]
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// 偏置.
    #[inline]
    pub fn bias(&self) -> f32 {
        self.bias
    }

    #[inline]
    fn center(&self) -> usize {
        self.weights.len() / 2
    }

    /// 各权重对应的窗口偏移, 与 `weights` 顺序一致.
    fn offsets(&self) -> Vec<Vec<usize>> {
        (0..self.spatial_dims)
            .map(|_| 0..self.kernel)
            .multi_cartesian_product()
            .collect()
    }

    fn check_input(&self, input: &ArrayViewD<f32>) -> Result<()> {
        if input.ndim() != self.spatial_dims + 2 {
            return Err(Error::Dimension {
                expected: format!("(B, C) + {} spatial axes", self.spatial_dims),
                shape: input.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// 在空间轴两侧各复制填充 `kernel / 2` 个边缘像素.
    fn pad(&self, input: &ArrayViewD<f32>) -> ArrayD<f32> {
        let r = self.kernel / 2;
        let shape = input.shape();
        let padded: Vec<usize> = shape
            .iter()
            .enumerate()
            .map(|(i, &s)| if i < 2 { s } else { s + 2 * r })
            .collect();
        ArrayD::from_shape_fn(IxDyn(&padded), |idx| {
            let src: Vec<usize> = (0..shape.len())
                .map(|i| {
                    if i < 2 {
                        idx[i]
                    } else {
                        idx[i].saturating_sub(r).min(shape[i] - 1)
                    }
                })
                .collect();
            input[src.as_slice()]
        })
    }

    /// 填充后数组中, 与原图对齐并平移 `offset` 的窗口.
    fn window<'a>(padded: &'a ArrayD<f32>, offset: &[usize], spatial: &[usize]) -> ArrayViewD<'a, f32> {
        let mut v = padded.view();
        for (i, (&o, &s)) in offset.iter().zip(spatial).enumerate() {
            v.slice_axis_inplace(Axis(i + 2), Slice::from(o..o + s));
        }
        v
    }
}

impl Model for LinearFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: ArrayViewD<f32>) -> Result<ArrayD<f32>> {
        self.check_input(&input)?;
        let padded = self.pad(&input);
        let spatial = &input.shape()[2..];
        let mut out = ArrayD::from_elem(input.raw_dim(), self.bias);
        for (&w, off) in self.weights.iter().zip(self.offsets()) {
            if w != 0.0 {
                out.scaled_add(w, &Self::window(&padded, &off, spatial));
            }
        }
        Ok(out)
    }

    fn train_step(&mut self, batch: &Batch, loss: &Loss, opts: &StepOptions) -> Result<f32> {
        let input = batch.input.view();
        let pred = self.forward(input.view())?;
        let mask = batch.mask.as_ref().map(|m| m.view());
        let value = loss.compute(pred.view(), batch.target.view(), mask.clone())?;
        if !self.trainable {
            return Ok(value);
        }

        let grad_out = loss.gradient(pred.view(), batch.target.view(), mask)?;
        let padded = self.pad(&input);
        let spatial = &input.shape()[2..];
        // 权重梯度在前, 偏置梯度在最后.
        let mut grads: Vec<f32> = self
            .offsets()
            .iter()
            .map(|off| {
                Zip::from(&grad_out)
                    .and(&Self::window(&padded, off, spatial))
                    .fold(0.0f32, |acc, &g, &x| acc + g * x)
            })
            .collect();
        if self.blind_spot {
            let c = self.center();
            grads[c] = 0.0;
        }
        grads.push(grad_out.sum());

        if let Some(max) = opts.max_grad_norm {
            clip_grad_norm(&mut grads, max);
        }
        let lr = opts.learning_rate;
        for (w, g) in self.weights.iter_mut().zip(&grads) {
            *w -= lr * g;
        }
        self.bias -= lr * grads[grads.len() - 1];
        Ok(value)
    }

    fn state(&self) -> ModelState {
        let mut params = self.weights.clone();
        params.push(self.bias);
        ModelState {
            name: self.name.clone(),
            params,
        }
    }

    fn load_state(&mut self, state: &ModelState) -> Result<()> {
        if state.name != self.name || state.params.len() != self.weights.len() + 1 {
            return Err(Error::Model(format!(
                "state of `{}` ({} params) does not fit `{}`",
                state.name,
                state.params.len(),
                self.name
            )));
        }
        let (weights, bias) = state.params.split_at(self.weights.len());
        self.weights.copy_from_slice(weights);
        self.bias = bias[0];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::LossType;
    use crate::patch::tests::ramp;

    #[test]
    fn test_identity_and_mean() {
        let x = ramp(&[1, 1, 4, 5]);
        let id = LinearFilter::new(2, 3, false).unwrap();
        assert_eq!(id.forward(x.view()).unwrap(), x);

        let mean = LinearFilter::blind_spot_mean(2, 3).unwrap();
        let y = mean.forward(x.view()).unwrap();
        // 内部像素: 线性 ramp 的邻域均值等于中心值.
        assert!((y[[0, 0, 1, 1]] - x[[0, 0, 1, 1]]).abs() < 1e-4);
        // 角点: 边缘复制后的邻域为 0, 1, 0, 0, 1, 5, 5, 6, 共 8 个.
        assert!((y[[0, 0, 0, 0]] - 18.0 / 8.0).abs() < 1e-4);

        assert!(LinearFilter::new(2, 4, true).is_err());
        assert!(LinearFilter::new(4, 3, true).is_err());
        assert!(id.forward(ramp(&[1, 4, 5]).view()).is_err());
    }

    #[test]
    fn test_train_step_reduces_loss() {
        let input = ramp(&[2, 1, 6, 6]).mapv(|v| v / 72.0);
        let batch = Batch {
            target: input.mapv(|v| 2.0 * v + 0.1),
            input,
            mask: None,
        };
        let loss = Loss::new(LossType::Mse).unwrap();
        let opts = StepOptions {
            learning_rate: 0.05,
            max_grad_norm: Some(1.0),
        };
        let mut f = LinearFilter::new(2, 3, false).unwrap();
        let first = f.train_step(&batch, &loss, &opts).unwrap();
        let mut last = first;
        for _ in 0..20 {
            last = f.train_step(&batch, &loss, &opts).unwrap();
        }
        assert!(last < first);

        let mut frozen = LinearFilter::blind_spot_mean(2, 3).unwrap();
        let before = frozen.clone();
        frozen.train_step(&batch, &loss, &opts).unwrap();
        assert_eq!(frozen, before);
    }

    #[test]
    fn test_blind_spot_stays_blind() {
        let input = ramp(&[1, 1, 8, 8]).mapv(|v| v / 64.0);
        let mask = input.mapv(|_| true);
        let batch = Batch {
            target: input.clone(),
            input,
            mask: Some(mask),
        };
        let loss = Loss::new(LossType::N2v).unwrap();
        let opts = StepOptions {
            learning_rate: 0.1,
            max_grad_norm: None,
        };
        let mut f = LinearFilter::new(2, 3, true).unwrap();
        for _ in 0..5 {
            f.train_step(&batch, &loss, &opts).unwrap();
        }
        assert_eq!(f.weights()[4], 0.0);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut a = LinearFilter::new(3, 3, true).unwrap();
        let mut state = a.state();
        assert_eq!(state.params.len(), 28);
        state.params[0] = 7.0;
        a.load_state(&state).unwrap();
        assert_eq!(a.weights()[0], 7.0);

        let mut b = LinearFilter::new(2, 3, true).unwrap();
        assert!(b.load_state(&state).is_err());
    }
}
