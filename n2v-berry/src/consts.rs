//! 通用常量.

/// 盲点像素操作的默认参数.
pub mod manipulation {
    /// 默认被掩码像素的百分比.
    pub const DEFAULT_MASKED_PIXEL_PERCENTAGE: f32 = 0.2;

    /// 默认邻域边长 (像素).
    pub const DEFAULT_ROI_SIZE: usize = 11;

    /// 默认 structN2V 线状掩码长度 (像素).
    pub const DEFAULT_STRUCT_SPAN: usize = 5;
}

/// 规范化时分母的保护值, 避免常数图像除零.
pub const NORM_EPS: f32 = 1e-6;

/// patch 每一空间维度的最小边长.
pub const MIN_PATCH_SIZE: usize = 8;

/// 原始数据允许出现的全部轴, 按照合法的相对顺序排列.
pub const ALLOWED_AXES: &str = "STCZYX";

/// 检查点文件名.
pub const CHECKPOINT_NAME: &str = "checkpoint.bin";

/// 最佳检查点文件名.
pub const BEST_CHECKPOINT_NAME: &str = "best_checkpoint.bin";

/// 训练数据目录环境变量名.
pub const ENV_TRAIN_DIR: &str = "N2V_TRAIN_DIR";

/// 推理数据目录环境变量名.
pub const ENV_PREDICT_DIR: &str = "N2V_PREDICT_DIR";
