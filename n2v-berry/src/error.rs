//! 运行时错误.

use std::path::PathBuf;

/// 本 crate 通用的运行时错误.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 底层 I/O 错误.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 读取 npy 文件错误.
    #[error("failed to read npy: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    /// 写入 npy 文件错误.
    #[error("failed to write npy: {0}")]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    /// 读取 npz 文件错误.
    #[error("failed to read npz: {0}")]
    ReadNpz(#[from] ndarray_npy::ReadNpzError),

    /// 读取 nifti 文件错误.
    #[error("failed to read nifti: {0}")]
    Nifti(#[from] nifti::NiftiError),

    /// 读取 tiff 文件错误.
    #[error("failed to read tiff: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// 读写普通图像错误.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// 检查点序列化/反序列化错误.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] bincode::Error),

    /// 数据形状错误.
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// 轴描述字符串非法.
    #[error("invalid axes `{axes}`: {reason}")]
    InvalidAxes {
        /// 原始轴描述.
        axes: String,
        /// 非法原因.
        reason: &'static str,
    },

    /// 数据维度与期望不符.
    #[error("incorrect dimensions: expected {expected}, got shape {shape:?}")]
    Dimension {
        /// 期望的维度描述.
        expected: String,
        /// 实际形状.
        shape: Vec<usize>,
    },

    /// patch / tile 参数与图像不匹配.
    #[error("invalid patch parameters: {0}")]
    Patch(String),

    /// 拼接错误.
    #[error("stitching error: {0}")]
    Stitch(String),

    /// 配置非法.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// 不支持的文件格式.
    #[error("unsupported file `{0}`")]
    UnsupportedFile(PathBuf),

    /// 数据彼此不一致, 如训练数据与监督目标, 或越界的数组序号.
    #[error("inconsistent data: {0}")]
    Mismatch(String),

    /// 没有可用的数据 (空文件列表, 空数组, 空的一轮训练等).
    #[error("no data: {0}")]
    Empty(String),

    /// 数据路径为空或不存在.
    #[error("data path `{0}` is empty or invalid")]
    EmptyPath(PathBuf),

    /// 模型 (外部协作者) 返回的错误.
    #[error("model error: {0}")]
    Model(String),
}

/// 本 crate 通用的运行时结果.
pub type Result<T> = std::result::Result<T, Error>;
