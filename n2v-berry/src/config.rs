//! 实验配置.
//!
//! 配置是普通的强类型结构体, 可通过 `serde` 与任意格式互转; 本 crate 不负责解析配置文件.
//! 使用前必须调用 [`Configuration::validate`].

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::axes::Axes;
use crate::consts::MIN_PATCH_SIZE;
use crate::data::{home_dataset_dir_with, Stats};
use crate::dataset::DatasetOptions;
use crate::engine::LrScheduler;
use crate::loss::LossType;
use crate::manipulate::{ManipulationStrategy, N2vManipulate, StructMask};
use crate::patch::ExtractionStrategy;
use crate::transforms::Augmentation;
use crate::{Error, Result};

/// 算法.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Algorithm {
    /// Noise2Void.
    N2v,

    /// N2V2: 邻域中值替换.
    N2v2,

    /// structN2V: 额外的线状掩码.
    StructN2v,

    /// 概率 N2V, 需要噪声模型.
    Pn2v,

    /// Noise2Noise, 需要第二份独立噪声数据作为目标.
    N2n,

    /// CARE, 需要干净数据作为目标.
    Care,
}

impl Algorithm {
    /// 是否自监督 (需要盲点像素操作).
    #[inline]
    pub fn is_self_supervised(&self) -> bool {
        matches!(self, Self::N2v | Self::N2v2 | Self::StructN2v | Self::Pn2v)
    }

    /// 该算法允许的损失.
    pub fn allowed_losses(&self) -> &'static [LossType] {
        match self {
            Self::N2v | Self::N2v2 | Self::StructN2v => &[LossType::N2v],
            Self::Pn2v => &[LossType::Pn2v],
            Self::N2n | Self::Care => &[LossType::Mse, LossType::Mae],
        }
    }
}

/// 算法相关配置.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    /// 算法.
    pub algorithm: Algorithm,

    /// 损失.
    pub loss: LossType,

    /// 被掩码像素百分比.
    pub masked_pixel_percentage: f32,

    /// 盲点替换邻域边长.
    pub roi_size: usize,

    /// structN2V 线状掩码, 仅 [`Algorithm::StructN2v`] 使用.
    pub struct_mask: Option<StructMask>,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        let m = N2vManipulate::default();
        Self {
            algorithm: Algorithm::N2v,
            loss: LossType::N2v,
            masked_pixel_percentage: m.masked_pixel_percentage(),
            roi_size: m.roi_size(),
            struct_mask: None,
        }
    }
}

/// 数据相关配置.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// 原始数据的轴描述.
    pub axes: Axes,

    /// 数据文件扩展名, 例如 `"npy"`, `"tif"`.
    pub extension: String,

    /// 训练数据路径.
    pub train_path: Option<PathBuf>,

    /// 训练目标路径, 仅有监督算法使用.
    pub train_target_path: Option<PathBuf>,

    /// 验证数据路径.
    pub val_path: Option<PathBuf>,

    /// 验证目标路径.
    pub val_target_path: Option<PathBuf>,

    /// 推理数据路径.
    pub predict_path: Option<PathBuf>,

    /// 预先给定的统计量. `None` 时由训练数据计算.
    pub stats: Option<Stats>,

    /// 是否一次性载入全部训练数据.
    pub in_memory: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            axes: Axes::yx(),
            extension: "npy".to_string(),
            train_path: None,
            train_target_path: None,
            val_path: None,
            val_target_path: None,
            predict_path: None,
            stats: None,
            in_memory: true,
        }
    }
}

/// 训练相关配置.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// epoch 数.
    pub num_epochs: usize,

    /// batch 大小.
    pub batch_size: usize,

    /// patch 大小, 按 `([Z], Y, X)` 顺序.
    pub patch_size: Vec<usize>,

    /// 切块策略.
    pub extraction: ExtractionStrategy,

    /// 数据增强.
    pub augmentations: Vec<Augmentation>,

    /// 初始学习率.
    pub learning_rate: f32,

    /// 梯度范数上限.
    pub max_grad_norm: Option<f32>,

    /// 学习率调度.
    pub scheduler: LrScheduler,

    /// 逐文件数据集是否使用逐像素的在线统计量.
    pub running_stats: bool,

    /// 随机种子.
    pub seed: u64,

    /// 是否写入检查点.
    pub save_checkpoints: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: 100,
            batch_size: 128,
            patch_size: vec![64, 64],
            extraction: ExtractionStrategy::Random,
            augmentations: vec![Augmentation::NdFlip, Augmentation::XyRandomRotate90],
            learning_rate: 1e-4,
            max_grad_norm: None,
            scheduler: LrScheduler::default(),
            running_stats: false,
            seed: 42,
            save_checkpoints: true,
        }
    }
}

/// 推理相关配置.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionConfig {
    /// tile 大小. `None` 表示整幅推理.
    pub tile_size: Option<Vec<usize>>,

    /// tile 重叠. 必须与 `tile_size` 同时给出.
    pub tile_overlap: Option<Vec<usize>>,

    /// batch 大小, 0 按 1 处理.
    pub batch_size: usize,

    /// 是否使用推理时增强.
    pub tta: bool,
}

/// 完整的实验配置.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// 实验名, 只能包含字母, 数字, `-` 和 `_`.
    pub experiment_name: String,

    /// 工作目录, 检查点写入此处.
    pub working_directory: PathBuf,

    /// 算法.
    pub algorithm: AlgorithmConfig,

    /// 数据.
    pub data: DataConfig,

    /// 训练.
    pub training: TrainingConfig,

    /// 推理.
    pub prediction: PredictionConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            experiment_name: "n2v".to_string(),
            working_directory: PathBuf::from("."),
            algorithm: AlgorithmConfig::default(),
            data: DataConfig::default(),
            training: TrainingConfig::default(),
            prediction: PredictionConfig::default(),
        }
    }
}

fn invalid<T>(msg: String) -> Result<T> {
    Err(Error::Config(msg))
}

impl Configuration {
    /// 检查配置的一致性.
    pub fn validate(&self) -> Result<()> {
        let name = &self.experiment_name;
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return invalid(format!("invalid experiment name `{name}`"));
        }

        let alg = &self.algorithm;
        if !alg.algorithm.allowed_losses().contains(&alg.loss) {
            return invalid(format!(
                "loss {:?} is not compatible with algorithm {:?}",
                alg.loss, alg.algorithm
            ));
        }
        if alg.struct_mask.is_some() != (alg.algorithm == Algorithm::StructN2v) {
            return invalid("a struct mask is required by, and only by, StructN2v".to_string());
        }
        self.manipulate()?;

        let spatial = self.data.axes.spatial_dims();
        let t = &self.training;
        if t.patch_size.len() != spatial {
            return invalid(format!(
                "patch size {:?} does not match axes `{}`",
                t.patch_size, self.data.axes
            ));
        }
        if let Some(&p) = t
            .patch_size
            .iter()
            .find(|&&p| p < MIN_PATCH_SIZE || !p.is_power_of_two())
        {
            return invalid(format!(
                "patch size must be a power of two >= {MIN_PATCH_SIZE}, got {p}"
            ));
        }
        if t.num_epochs == 0 || t.batch_size == 0 || !(t.learning_rate > 0.0) {
            return invalid("epochs, batch size and learning rate must be positive".to_string());
        }
        if t.extraction == ExtractionStrategy::Tiled {
            return invalid("tiled extraction is only available for prediction".to_string());
        }
        if let Some(msg) = t.scheduler.check() {
            return invalid(msg);
        }

        if !alg.algorithm.is_self_supervised()
            && self.data.train_path.is_some()
            && self.data.train_target_path.is_none()
        {
            return invalid(format!("{:?} requires training targets", alg.algorithm));
        }

        let p = &self.prediction;
        match (&p.tile_size, &p.tile_overlap) {
            (None, None) => {}
            (Some(tile), Some(overlap)) => {
                if tile.len() != spatial || overlap.len() != spatial {
                    return invalid(format!(
                        "tile size {tile:?} / overlap {overlap:?} do not match axes `{}`",
                        self.data.axes
                    ));
                }
                if tile.iter().zip(overlap).any(|(&t, &o)| t == 0 || o >= t) {
                    return invalid(format!(
                        "tile overlap {overlap:?} must be smaller than tile size {tile:?}"
                    ));
                }
            }
            _ => return invalid("tile size and overlap must be given together".to_string()),
        }
        Ok(())
    }

    /// 盲点像素操作. 有监督算法返回 `None`.
    pub fn manipulate(&self) -> Result<Option<N2vManipulate>> {
        let alg = &self.algorithm;
        if !alg.algorithm.is_self_supervised() {
            return Ok(None);
        }
        let strategy = if alg.algorithm == Algorithm::N2v2 {
            ManipulationStrategy::Median
        } else {
            ManipulationStrategy::Uniform
        };
        N2vManipulate::new(
            alg.masked_pixel_percentage,
            alg.roi_size,
            strategy,
            true,
            alg.struct_mask,
        )
        .map(Some)
    }

    /// 训练数据集参数.
    pub fn dataset_options(&self) -> Result<DatasetOptions> {
        let t = &self.training;
        Ok(DatasetOptions {
            patch_size: t.patch_size.clone(),
            strategy: t.extraction,
            augmentations: t.augmentations.clone(),
            manipulate: self.manipulate()?,
            shuffle: true,
            seed: t.seed,
        })
    }

    /// 验证数据集参数: 顺序切块, 不增强, 不打乱.
    pub fn val_dataset_options(&self) -> Result<DatasetOptions> {
        Ok(DatasetOptions {
            strategy: ExtractionStrategy::Sequential,
            augmentations: vec![],
            shuffle: false,
            ..self.dataset_options()?
        })
    }
}

/// 获取数据目录.
///
/// 1. 若环境变量 `var` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/{fallback...}`.
pub fn data_dir_from_env_or_home(var: &str, fallback: &[&str]) -> Option<PathBuf> {
    match env::var_os(var) {
        Some(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => home_dataset_dir_with(fallback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manipulate::StructAxis;

    fn config() -> Configuration {
        Configuration::default()
    }

    #[test]
    fn test_default_is_valid() {
        config().validate().unwrap();
        let m = config().manipulate().unwrap().unwrap();
        assert_eq!(m.strategy(), ManipulationStrategy::Uniform);
    }

    #[test]
    fn test_losses() {
        let mut c = config();
        c.algorithm.loss = LossType::Mse;
        assert!(c.validate().is_err());

        c.algorithm.algorithm = Algorithm::Care;
        c.validate().unwrap();
        assert!(c.manipulate().unwrap().is_none());

        c.data.train_path = Some(PathBuf::from("train"));
        assert!(c.validate().is_err());
        c.data.train_target_path = Some(PathBuf::from("target"));
        c.validate().unwrap();

        let mut c = config();
        c.algorithm.algorithm = Algorithm::N2v2;
        c.validate().unwrap();
        assert_eq!(
            c.manipulate().unwrap().unwrap().strategy(),
            ManipulationStrategy::Median
        );

        c.algorithm.algorithm = Algorithm::StructN2v;
        assert!(c.validate().is_err());
        c.algorithm.struct_mask = Some(StructMask {
            axis: StructAxis::Vertical,
            span: 3,
        });
        c.validate().unwrap();
    }

    #[test]
    fn test_patch_size() {
        let mut c = config();
        for bad in [vec![64], vec![4, 4], vec![48, 64], vec![64, 64, 64]] {
            c.training.patch_size = bad;
            assert!(c.validate().is_err());
        }
        c.data.axes = Axes::new("ZYX").unwrap();
        c.training.patch_size = vec![16, 64, 64];
        c.validate().unwrap();
    }

    #[test]
    fn test_prediction() {
        let mut c = config();
        c.prediction.tile_size = Some(vec![128, 128]);
        assert!(c.validate().is_err());
        c.prediction.tile_overlap = Some(vec![48, 128]);
        assert!(c.validate().is_err());
        c.prediction.tile_overlap = Some(vec![48, 48]);
        c.validate().unwrap();
    }

    #[test]
    fn test_misc() {
        let mut c = config();
        c.experiment_name = "bad name".to_string();
        assert!(c.validate().is_err());

        let v = config().val_dataset_options().unwrap();
        assert_eq!(v.strategy, ExtractionStrategy::Sequential);
        assert!(!v.shuffle && v.augmentations.is_empty());

        let dir = data_dir_from_env_or_home("N2V_BERRY_SURELY_UNSET", &["train"]);
        if let Some(d) = dir {
            assert!(d.ends_with("dataset/train"));
        }
    }
}
