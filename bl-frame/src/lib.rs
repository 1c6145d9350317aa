#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 对小鼠脑的 MRI, micro-CT 与体素级解剖分割三模态体数据,
//! 计算可复现的颅骨标志点 (Bregma, Lambda) 与逐脑区立体定位统计量.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 所有体数据均按 `(z, y, x)` 访问. nifti 文件中的 `[x, y, z]` 存储在加载时被转置.
//! 2. 所有 "可恢复" 的异常 (配置替换, 元信息不一致, 单个脑区失败, 配准疑似未收敛)
//!   只通过 `log` 输出, 不会中断整批处理.
//!
//! # 开发计划
//!
//! ### 配准引擎 ✅
//!
//! 刚性 (2D/3D) 与 B 样条自由形变配准; 互信息/均方误差损失;
//! 梯度下降, L-BFGS 与穷举优化器; 多分辨率金字塔.
//! 字符串配置一次性解析为封闭枚举, 并记录所有默认值替换.
//!
//! 实现位于 `bl-frame/src/registrator`.
//!
//! ### Bregma-Lambda 重定向 ✅
//!
//! 将 bregma -> lambda 向量旋转到 y 轴, 之后可选地在垂直平面内微调.
//! 纯函数实现: 返回新的体数据与新的标志点.
//!
//! 实现位于 `bl-frame/src/align`.
//!
//! ### 标志点定位 ✅
//!
//! 颅骨表面投影与骨缝模板做 2D 形变配准, 把 bregma/lambda 标记模板反向映射回个体空间,
//! 再用 micro-CT 查表得到深度.
//!
//! 实现位于 `bl-frame/src/landmarks`.
//!
//! ### 逐脑区立体定位统计 ✅
//!
//! 左右半球分离, 平均/内核/形状质心与体积, `rayon` 并行.
//!
//! 实现位于 `bl-frame/src/stereotaxic`.
//!
//! ### 皮层分层合并 ✅
//!
//! 实现位于 `bl-frame/src/layers.rs`.
//!
//! ### 基于图谱模板的整体配准 ⌛️
//!
//! 尚未开始 (模板缩放方案仍未确定).

/// 二维索引 `(y, x)`, 同时也可一定程度上用作非负整数向量.
pub type Idx2d = (usize, usize);

/// 三维索引 `(z, y, x)`, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 高精度二维坐标 `(y, x)`.
pub type Idx2dF = (f64, f64);

/// 高精度三维坐标 / 向量 `[z, y, x]`.
pub type Vec3 = [f64; 3];

/// 压缩存储优化时会用到. 该结构不对外公开.
type Idx3dU16 = (u16, u16, u16);

/// 三模态体数据和 nifti 元信息.
mod data;

pub use data::{
    lr_pair, mul3, LrPair, Mouse, NiftiHeaderAttr, PairStats, ScanVolume, SegVolume,
    SubjectVolumes, VolumeBounds,
};

pub mod consts;

pub mod registrator;

pub mod align;

pub mod landmarks;

pub mod stereotaxic;

pub mod layers;

pub mod pipeline;

pub mod dataset;
pub mod prelude;
