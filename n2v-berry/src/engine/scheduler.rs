//! 学习率调度.

use serde::{Deserialize, Serialize};

/// 学习率调度策略.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LrScheduler {
    /// 学习率保持不变.
    Constant,

    /// 验证损失连续 `patience` 个 epoch 没有改善 (相对下降不足 `threshold`) 时,
    /// 学习率乘以 `factor`, 但不低于 `min_lr`.
    ReduceOnPlateau {
        /// 衰减系数, 位于 `(0, 1)`.
        factor: f32,
        /// 可容忍的无改善 epoch 数.
        patience: usize,
        /// 学习率下限.
        min_lr: f32,
        /// 相对改善阈值.
        threshold: f32,
    },

    /// 每 `step_size` 个 epoch 学习率乘以 `gamma`.
    StepLr {
        /// 步长 (epoch).
        step_size: usize,
        /// 衰减系数.
        gamma: f32,
    },
}

impl Default for LrScheduler {
    fn default() -> Self {
        Self::ReduceOnPlateau {
            factor: 0.5,
            patience: 20,
            min_lr: 0.0,
            threshold: 1e-4,
        }
    }
}

impl LrScheduler {
    /// 检查参数合法性, 返回错误描述.
    pub(crate) fn check(&self) -> Option<String> {
        match *self {
            Self::Constant => None,
            Self::ReduceOnPlateau { factor, min_lr, .. } if !(factor > 0.0 && factor < 1.0) || min_lr < 0.0 => {
                Some(format!("invalid plateau scheduler: factor {factor}, min lr {min_lr}"))
            }
            Self::StepLr { step_size, gamma } if step_size == 0 || !(gamma > 0.0) => {
                Some(format!("invalid step scheduler: step {step_size}, gamma {gamma}"))
            }
            _ => None,
        }
    }
}

/// 运行中的学习率调度器.
#[derive(Clone, Debug)]
pub struct Scheduler {
    policy: LrScheduler,
    lr: f32,
    epoch: usize,
    best: f32,
    bad_epochs: usize,
}

impl Scheduler {
    /// 以初始学习率 `lr` 构建.
    pub fn new(policy: LrScheduler, lr: f32) -> Self {
        Self {
            policy,
            lr,
            epoch: 0,
            best: f32::INFINITY,
            bad_epochs: 0,
        }
    }

    /// 当前学习率.
    #[inline]
    pub fn learning_rate(&self) -> f32 {
        self.lr
    }

    /// 覆盖当前学习率, 用于从检查点恢复.
    #[inline]
    pub fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }

    /// 一个 epoch 结束后调用, 返回新的学习率.
    pub fn step(&mut self, val_loss: f32) -> f32 {
        self.epoch += 1;
        match self.policy {
            LrScheduler::Constant => {}
            LrScheduler::ReduceOnPlateau {
                factor,
                patience,
                min_lr,
                threshold,
            } => {
                if val_loss < self.best * (1.0 - threshold) {
                    self.best = val_loss;
                    self.bad_epochs = 0;
                } else {
                    self.bad_epochs += 1;
                }
                if self.bad_epochs > patience {
                    let lr = (self.lr * factor).max(min_lr);
                    if lr < self.lr {
                        log::info!("Reducing learning rate to {lr:e}");
                    }
                    self.lr = lr;
                    self.bad_epochs = 0;
                }
            }
            LrScheduler::StepLr { step_size, gamma } => {
                if self.epoch % step_size == 0 {
                    self.lr *= gamma;
                }
            }
        }
        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plateau() {
        let policy = LrScheduler::ReduceOnPlateau {
            factor: 0.5,
            patience: 1,
            min_lr: 0.2,
            threshold: 0.0,
        };
        let mut s = Scheduler::new(policy, 1.0);
        assert_eq!(s.step(1.0), 1.0);
        assert_eq!(s.step(1.0), 1.0);
        assert_eq!(s.step(1.0), 0.5);
        assert_eq!(s.step(0.5), 0.5);
        assert_eq!(s.step(0.6), 0.5);
        assert_eq!(s.step(0.6), 0.25);
        s.step(0.6);
        assert_eq!(s.step(0.6), 0.2);
    }

    #[test]
    fn test_step_lr() {
        let mut s = Scheduler::new(LrScheduler::StepLr { step_size: 2, gamma: 0.1 }, 1.0);
        assert_eq!(s.step(0.0), 1.0);
        assert!((s.step(0.0) - 0.1).abs() < 1e-7);
        assert!((s.step(0.0) - 0.1).abs() < 1e-7);

        let mut c = Scheduler::new(LrScheduler::Constant, 0.3);
        assert_eq!(c.step(9.0), 0.3);
    }

    #[test]
    fn test_check() {
        assert!(LrScheduler::default().check().is_none());
        assert!(LrScheduler::StepLr { step_size: 0, gamma: 0.5 }.check().is_some());
        let bad = LrScheduler::ReduceOnPlateau {
            factor: 1.5,
            patience: 1,
            min_lr: 0.0,
            threshold: 0.0,
        };
        assert!(bad.check().is_some());
    }
}
