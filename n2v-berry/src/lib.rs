#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 为 Noise2Void (N2V) 系列自监督显微图像去噪算法提供数据切块、盲点像素操作、
//! 分块推理拼接, 以及训练/推理引擎.
//!
//! 神经网络本身不在本 crate 范围内, 它通过 [`model::Model`] trait 接入.
//! crate 自带一个线性卷积滤波器作为参考模型, 以便引擎可以独立运行.
//!
//! # 注意
//!
//! 1. 所有图像在进入流水线前都会被规范化为 `(N, C, [Z], Y, X)` 布局, 见 [`axes`].
//! 2. 单个 patch / tile 的布局为 `(C, [Z], Y, X)`; batch 布局为 `(B, C, [Z], Y, X)`.
//!
//! # 开发计划
//!
//! ### 轴规范化 ✅
//!
//! `STCZYX` 子集到 `(N, C, [Z], Y, X)` 的转换. S 与 T 合并为 N.
//!
//! 实现位于 `n2v-berry/src/axes.rs`.
//!
//! ### 切块 ✅
//!
//! 顺序 / 随机 / 带重叠分块三种策略, 均为惰性迭代器. 坐标先于数据计算,
//! 因此输入和监督目标总能使用完全相同的窗口.
//!
//! 实现位于 `n2v-berry/src/patch`.
//!
//! ### 盲点像素操作 ✅
//!
//! 分层随机采样掩码位置, 用邻域像素 (N2V) 或邻域中值 (N2V2) 替换,
//! 支持 structN2V 的线状掩码.
//!
//! 实现位于 `n2v-berry/src/manipulate`.
//!
//! ### 分块拼接 ✅
//!
//! 每个 tile 只贡献其重叠区中点之间的部分, 拼接区域互不相交且恰好覆盖原图.
//!
//! 实现位于 `n2v-berry/src/stitch.rs`.
//!
//! ### 训练/推理引擎 ✅
//!
//! 实现位于 `n2v-berry/src/engine`.
//!
//! ### 小功能 ✅
//!
//! 1. 数据增强 (翻转, 旋转) 及推理时增强 (TTA). ✅
//! 2. PN2V 直方图噪声模型. ✅
//! 3. PSNR 等指标. ✅

/// 空间索引 (2D 或 3D), 按 `([Z], Y, X)` 顺序存储.
pub type SpatialIdx = Vec<usize>;

pub mod consts;

mod error;

pub use error::{Error, Result};

pub mod axes;

pub mod data;

pub mod patch;

pub mod manipulate;

pub mod stitch;

pub mod transforms;

pub mod loss;

pub mod metrics;

pub mod dataset;

pub mod model;

pub mod config;

pub mod engine;

pub mod prelude;
