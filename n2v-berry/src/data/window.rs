use ndarray::ArrayView2;

/// 强度显示窗口, 用于把任意浮点强度映射为 8-bit 灰度值.
///
/// 该窗口是只读的. 若要修改窗口参数, 你应该创建新的实例.
#[derive(Copy, Clone, Debug)]
pub struct DisplayWindow {
    lower: f32,
    upper: f32,
}

impl DisplayWindow {
    /// 构建窗口.
    ///
    /// `lower` 和 `upper` 必须有限且 `lower < upper`, 否则返回 `None`.
    pub fn new(lower: f32, upper: f32) -> Option<Self> {
        (lower.is_finite() && upper.is_finite() && lower < upper).then_some(Self { lower, upper })
    }

    /// 以图像中有限像素的最小值和最大值构建窗口.
    ///
    /// 图像为常数或没有有限像素时返回 `None`.
    pub fn from_min_max(plane: ArrayView2<f32>) -> Option<Self> {
        let (lo, hi) = plane
            .iter()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        Self::new(lo, hi)
    }

    /// 窗下限.
    #[inline]
    pub fn lower_bound(&self) -> f32 {
        self.lower
    }

    /// 窗上限.
    #[inline]
    pub fn upper_bound(&self) -> f32 {
        self.upper
    }

    /// 窗宽.
    #[inline]
    pub fn width(&self) -> f32 {
        self.upper - self.lower
    }

    /// 求在当前窗口设置下, 强度 `v` 对应的灰度图像素整数值 (0 <= value <= 255).
    ///
    /// 如果 `v` 无意义 (如 inf, NaN), 则返回 `None`.
    pub fn eval(&self, v: f32) -> Option<u8> {
        if !v.is_finite() {
            return None;
        }
        if v <= self.lower {
            Some(u8::MIN)
        } else if v >= self.upper {
            Some(u8::MAX)
        } else {
            // 255, not 256.
            Some((((v - self.lower) / self.width()) * 255.0) as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DisplayWindow;
    use ndarray::arr2;

    #[test]
    fn test_display_window_invalid_input() {
        assert!(DisplayWindow::new(1.0, 1.0).is_none());
        assert!(DisplayWindow::new(2.0, 1.0).is_none());
        assert!(DisplayWindow::new(f32::NAN, 1.0).is_none());
        assert!(DisplayWindow::from_min_max(arr2(&[[3.0f32, 3.0]]).view()).is_none());
    }

    #[test]
    fn test_display_window_generic() {
        let w = DisplayWindow::from_min_max(arr2(&[[60.0f32, f32::NAN], [100.0, 80.0]]).view())
            .unwrap();
        assert_eq!(w.eval(f32::NAN), None);
        assert_eq!(w.eval(f32::MIN), Some(0));
        assert_eq!(w.eval(f32::MAX), Some(255));
        assert_eq!(w.eval(60.0), Some(0));
        assert_eq!(w.eval(70.0).unwrap(), (255.0 * 0.25) as u8);
        assert_eq!(w.eval(80.0).unwrap(), (255.0 * 0.5) as u8);
        assert_eq!(w.eval(99.999), Some(254));
        assert_eq!(w.eval(100.0), Some(255));
    }
}
