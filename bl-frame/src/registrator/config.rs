//! 配准配置.
//!
//! 字符串形式的 [`RawRegistratorConfig`] 通过 [`RawRegistratorConfig::resolve`]
//! 一次性解析为封闭枚举组成的 [`RegistratorConfig`]. 所有不受支持的取值被替换为默认值,
//! 并作为 [`Substitution`] 记录下来.

use std::fmt;

use log::warn;

/// 相似性度量 (损失函数).
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Loss {
    /// 互信息, 以联合直方图估计. 损失取其相反数.
    MutualInformation {
        /// 直方图桶个数.
        bins: usize,
    },

    /// 均方误差.
    MeanSquares,
}

impl Loss {
    /// 默认直方图桶个数.
    pub const DEFAULT_BINS: usize = 50;

    /// 默认损失.
    pub const DEFAULT: Self = Self::MutualInformation {
        bins: Self::DEFAULT_BINS,
    };
}

/// 梯度下降参数.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GradientDescent {
    /// 学习率. `estimate_learning_rate` 为 `true` 时仅作为初值.
    pub learning_rate: f64,

    /// 最大迭代次数.
    pub iterations: usize,

    /// 收敛窗口内损失的相对变化小于该值时视为收敛.
    pub convergence_minimum: f64,

    /// 收敛窗口长度.
    pub convergence_window: usize,

    /// 是否在第一次迭代时按 `max_step` 估计学习率.
    pub estimate_learning_rate: bool,

    /// 单步最大位移, 以体素为单位.
    pub max_step: f64,
}

impl GradientDescent {
    /// 默认梯度下降参数.
    pub const DEFAULT: Self = Self {
        learning_rate: 1.0,
        iterations: 100,
        convergence_minimum: 1e-6,
        convergence_window: 10,
        estimate_learning_rate: true,
        max_step: 1.0,
    };
}

/// 有限内存拟牛顿 (L-BFGS) 参数. 本实现不带边界约束.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Lbfgs {
    /// 梯度无穷范数小于该值时停止.
    pub gradient_tolerance: f64,

    /// 最大迭代次数.
    pub iterations: usize,

    /// 保留的修正对个数.
    pub max_corrections: usize,
}

impl Lbfgs {
    /// 默认 L-BFGS 参数.
    pub const DEFAULT: Self = Self {
        gradient_tolerance: 1e-5,
        iterations: 100,
        max_corrections: 5,
    };
}

/// 穷举搜索参数.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Exhaustive {
    /// 每个参数在正负方向上的步数. 长度不足时以最后一个值补齐.
    pub steps: Vec<usize>,

    /// 步长, 以体素位移为单位.
    pub step_length: f64,
}

/// 优化器.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Optimizer {
    /// 梯度下降.
    GradientDescent(GradientDescent),

    /// L-BFGS.
    Lbfgs(Lbfgs),

    /// 穷举搜索. 仅适用于刚性变换.
    Exhaustive(Exhaustive),
}

impl Optimizer {
    /// 默认优化器.
    pub const DEFAULT: Self = Self::GradientDescent(GradientDescent::DEFAULT);

    /// 最大迭代次数 (穷举时为 `None`).
    pub fn iterations(&self) -> Option<usize> {
        match self {
            Self::GradientDescent(gd) => Some(gd.iterations),
            Self::Lbfgs(lb) => Some(lb.iterations),
            Self::Exhaustive(_) => None,
        }
    }
}

/// 变换维数.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Dimension {
    /// 2D 图像 (深度为 1 的体数据).
    Two,

    /// 3D 体数据.
    Three,
}

impl Dimension {
    /// 默认维数.
    pub const DEFAULT: Self = Self::Three;
}

/// 插值方式.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Interpolator {
    /// 线性插值. 适用于强度数据.
    Linear,

    /// 最近邻插值. 适用于标签数据.
    Nearest,
}

impl Interpolator {
    /// 默认插值方式.
    pub const DEFAULT: Self = Self::Linear;
}

/// 刚性变换中心的初始化方式.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CenterType {
    /// 强度质心.
    Moments,

    /// 几何中心.
    Geometric,
}

impl CenterType {
    /// 默认中心类型.
    pub const DEFAULT: Self = Self::Moments;
}

/// 变换模型.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Method {
    /// 刚性变换.
    Rigid {
        /// 中心初始化方式.
        center: CenterType,
    },

    /// 三次 B 样条自由形变.
    Deform {
        /// 每个维度上的网格单元个数.
        grid_size: usize,
    },
}

impl Method {
    /// 默认网格大小.
    pub const DEFAULT_GRID: usize = 10;

    /// 默认变换模型.
    pub const DEFAULT: Self = Self::Rigid {
        center: CenterType::DEFAULT,
    };

    /// 是否是形变模型.
    #[inline]
    pub fn is_deformable(&self) -> bool {
        matches!(self, Self::Deform { .. })
    }
}

/// 多分辨率金字塔. 两个列表等长, 每项对应一层, 从粗到细.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Pyramid {
    /// 每层的整数缩小倍数.
    pub shrink_factors: Vec<usize>,

    /// 每层的高斯平滑标准差, 以原分辨率体素为单位.
    pub smoothing_sigmas: Vec<f64>,
}

/// 解析完毕的配准配置. 所有字段都是合法值.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegistratorConfig {
    /// 变换模型.
    pub method: Method,

    /// 损失.
    pub loss: Loss,

    /// 优化器.
    pub optimizer: Optimizer,

    /// 维数.
    pub dimension: Dimension,

    /// 配准时的插值方式.
    pub registration_interpolator: Interpolator,

    /// 重采样时的插值方式.
    pub resample_interpolator: Interpolator,

    /// 可选的多分辨率金字塔.
    pub pyramid: Option<Pyramid>,

    /// 参与度量计算的采样比例, `(0, 1]`.
    pub sampling_percentage: f64,

    /// 形状不一致时是否先把浮动图像缩放到固定图像的网格.
    pub check_shape: bool,
}

impl Default for RegistratorConfig {
    fn default() -> Self {
        Self {
            method: Method::DEFAULT,
            loss: Loss::DEFAULT,
            optimizer: Optimizer::DEFAULT,
            dimension: Dimension::DEFAULT,
            registration_interpolator: Interpolator::DEFAULT,
            resample_interpolator: Interpolator::DEFAULT,
            pyramid: None,
            sampling_percentage: 1.0,
            check_shape: false,
        }
    }
}

/// 一次默认值替换.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Substitution {
    /// 字段名.
    pub field: &'static str,

    /// 原始取值.
    pub given: String,

    /// 实际使用的取值.
    pub used: String,
}

impl fmt::Display for Substitution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}` = `{}` is not supported, defaulted to `{}`",
            self.field, self.given, self.used
        )
    }
}

/// `resolve` 的结果: 合法配置以及过程中发生的所有替换.
#[derive(Clone, Debug)]
pub struct Resolved {
    /// 合法配置.
    pub config: RegistratorConfig,

    /// 所有替换. 为空说明原始配置完全合法.
    pub substitutions: Vec<Substitution>,
}

impl Resolved {
    /// 原始配置是否完全合法?
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.substitutions.is_empty()
    }
}

/// 字符串键值形式的配准配置, 字段含义与常见的配准工具保持一致.
///
/// 通过 [`Self::resolve`] 转换为 [`RegistratorConfig`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct RawRegistratorConfig {
    /// `"rigid"` 或 `"deform"`.
    pub method: String,
    /// `"MI"` 或 `"LS"`.
    pub loss: String,
    /// `"GD"`, `"LBFGS"` 或 `"Exhaustive"`.
    pub optimizer: String,
    /// `2` 或 `3`.
    pub dimension: u32,
    /// `"linear"` 或 `"nearest"`.
    pub reg_interpolator: String,
    /// `"linear"` 或 `"nearest"`.
    pub res_interpolator: String,
    /// `"moments"` 或 `"geometric"`.
    pub rigid_type: String,
    /// B 样条网格单元个数.
    pub grid_size: usize,
    /// 互信息直方图桶个数.
    pub bin_size: usize,
    /// 梯度下降学习率.
    pub learning_rate: f64,
    /// 最大迭代次数.
    pub iterations: usize,
    /// 梯度下降收敛阈值.
    pub convergence_minimum: f64,
    /// 梯度下降收敛窗口.
    pub convergence_window: usize,
    /// 是否估计学习率.
    pub estimate_learning_rate: bool,
    /// 单步最大位移.
    pub max_step: f64,
    /// L-BFGS 梯度阈值.
    pub gradient_tolerance: f64,
    /// L-BFGS 修正对个数.
    pub max_corrections: usize,
    /// 穷举步数.
    pub steps: Vec<usize>,
    /// 穷举步长.
    pub step_length: f64,
    /// 是否启用多分辨率.
    pub multiple_resolutions: bool,
    /// 金字塔缩小倍数.
    pub shrink_factors: Vec<usize>,
    /// 金字塔平滑标准差.
    pub smoothing_sigmas: Vec<f64>,
    /// 采样比例.
    pub sampling_percentage: f64,
    /// 是否检查形状.
    pub check_shape: bool,
}

impl Default for RawRegistratorConfig {
    fn default() -> Self {
        let gd = GradientDescent::DEFAULT;
        let lb = Lbfgs::DEFAULT;
        Self {
            method: "rigid".to_string(),
            loss: "MI".to_string(),
            optimizer: "GD".to_string(),
            dimension: 3,
            reg_interpolator: "linear".to_string(),
            res_interpolator: "linear".to_string(),
            rigid_type: "moments".to_string(),
            grid_size: Method::DEFAULT_GRID,
            bin_size: Loss::DEFAULT_BINS,
            learning_rate: gd.learning_rate,
            iterations: gd.iterations,
            convergence_minimum: gd.convergence_minimum,
            convergence_window: gd.convergence_window,
            estimate_learning_rate: gd.estimate_learning_rate,
            max_step: gd.max_step,
            gradient_tolerance: lb.gradient_tolerance,
            max_corrections: lb.max_corrections,
            steps: vec![1],
            step_length: 1.0,
            multiple_resolutions: false,
            shrink_factors: vec![4, 2, 1],
            smoothing_sigmas: vec![2.0, 1.0, 0.0],
            sampling_percentage: 1.0,
            check_shape: false,
        }
    }
}

/// 记录替换的小工具.
struct Ledger(Vec<Substitution>);

impl Ledger {
    fn record<G: fmt::Debug, U: fmt::Debug>(&mut self, field: &'static str, given: G, used: U) {
        let sub = Substitution {
            field,
            given: format!("{given:?}"),
            used: format!("{used:?}"),
        };
        warn!("Registrator configuration: {sub}.");
        self.0.push(sub);
    }
}

impl RawRegistratorConfig {
    /// 单次解析. 所有不受支持的值都被替换为对应枚举的默认值, 每次替换输出一条 `warn`.
    pub fn resolve(&self) -> Resolved {
        let mut ledger = Ledger(vec![]);

        let bins = if self.bin_size >= 2 {
            self.bin_size
        } else {
            ledger.record("bin_size", self.bin_size, Loss::DEFAULT_BINS);
            Loss::DEFAULT_BINS
        };
        let loss = match self.loss.as_str() {
            "MI" => Loss::MutualInformation { bins },
            "LS" => Loss::MeanSquares,
            other => {
                ledger.record("loss", other, "MI");
                Loss::MutualInformation { bins }
            }
        };

        let center = match self.rigid_type.as_str() {
            "moments" => CenterType::Moments,
            "geometric" => CenterType::Geometric,
            other => {
                ledger.record("rigid_type", other, "moments");
                CenterType::DEFAULT
            }
        };
        let grid_size = if self.grid_size > 0 {
            self.grid_size
        } else {
            ledger.record("grid_size", self.grid_size, Method::DEFAULT_GRID);
            Method::DEFAULT_GRID
        };
        let method = match self.method.as_str() {
            "rigid" => Method::Rigid { center },
            "deform" => Method::Deform { grid_size },
            other => {
                ledger.record("method", other, "rigid");
                Method::Rigid { center }
            }
        };

        let iterations = if self.iterations > 0 {
            self.iterations
        } else {
            ledger.record("iterations", self.iterations, GradientDescent::DEFAULT.iterations);
            GradientDescent::DEFAULT.iterations
        };
        let gd = GradientDescent {
            learning_rate: self.learning_rate,
            iterations,
            convergence_minimum: self.convergence_minimum,
            convergence_window: self.convergence_window.max(1),
            estimate_learning_rate: self.estimate_learning_rate,
            max_step: self.max_step,
        };
        let optimizer = match self.optimizer.as_str() {
            "GD" => Optimizer::GradientDescent(gd),
            "LBFGS" => Optimizer::Lbfgs(Lbfgs {
                gradient_tolerance: self.gradient_tolerance,
                iterations,
                max_corrections: self.max_corrections.max(1),
            }),
            "Exhaustive" if method.is_deformable() => {
                ledger.record("optimizer", "Exhaustive (with deform)", "GD");
                Optimizer::GradientDescent(gd)
            }
            "Exhaustive" => Optimizer::Exhaustive(Exhaustive {
                steps: if self.steps.is_empty() {
                    vec![1]
                } else {
                    self.steps.clone()
                },
                step_length: self.step_length,
            }),
            other => {
                ledger.record("optimizer", other, "GD");
                Optimizer::GradientDescent(gd)
            }
        };

        let dimension = match self.dimension {
            2 => Dimension::Two,
            3 => Dimension::Three,
            other => {
                ledger.record("dimension", other, 3);
                Dimension::DEFAULT
            }
        };

        let mut interpolator = |field: &'static str, s: &str| match s {
            "linear" => Interpolator::Linear,
            "nearest" => Interpolator::Nearest,
            other => {
                ledger.record(field, other, "linear");
                Interpolator::DEFAULT
            }
        };
        let registration_interpolator = interpolator("reg_interpolator", &self.reg_interpolator);
        let resample_interpolator = interpolator("res_interpolator", &self.res_interpolator);

        let pyramid = if !self.multiple_resolutions {
            None
        } else if self.shrink_factors.is_empty()
            || self.shrink_factors.len() != self.smoothing_sigmas.len()
            || self.shrink_factors.contains(&0)
        {
            ledger.record(
                "multiple_resolutions",
                (&self.shrink_factors, &self.smoothing_sigmas),
                "disabled",
            );
            None
        } else {
            Some(Pyramid {
                shrink_factors: self.shrink_factors.clone(),
                smoothing_sigmas: self.smoothing_sigmas.clone(),
            })
        };

        let sampling_percentage =
            if self.sampling_percentage > 0.0 && self.sampling_percentage <= 1.0 {
                self.sampling_percentage
            } else {
                ledger.record("sampling_percentage", self.sampling_percentage, 1.0);
                1.0
            };

        Resolved {
            config: RegistratorConfig {
                method,
                loss,
                optimizer,
                dimension,
                registration_interpolator,
                resample_interpolator,
                pyramid,
                sampling_percentage,
                check_shape: self.check_shape,
            },
            substitutions: ledger.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_raw_is_clean() {
        let r = RawRegistratorConfig::default().resolve();
        assert!(r.is_clean());
        assert_eq!(r.config, RegistratorConfig::default());
    }

    #[test]
    fn test_unsupported_values_are_substituted() {
        let raw = RawRegistratorConfig {
            loss: "NCC".to_string(),
            optimizer: "Adam".to_string(),
            dimension: 4,
            reg_interpolator: "bspline".to_string(),
            ..Default::default()
        };
        let r = raw.resolve();
        assert_eq!(r.substitutions.len(), 4);
        assert_eq!(r.config.loss, Loss::DEFAULT);
        assert_eq!(r.config.optimizer, Optimizer::DEFAULT);
        assert_eq!(r.config.dimension, Dimension::Three);
        assert_eq!(r.config.registration_interpolator, Interpolator::Linear);
        let fields: Vec<_> = r.substitutions.iter().map(|s| s.field).collect();
        assert_eq!(
            fields,
            vec!["loss", "optimizer", "dimension", "reg_interpolator"]
        );
    }

    #[test]
    fn test_exhaustive_with_deform_falls_back_to_gd() {
        let raw = RawRegistratorConfig {
            method: "deform".to_string(),
            optimizer: "Exhaustive".to_string(),
            ..Default::default()
        };
        let r = raw.resolve();
        assert!(matches!(r.config.optimizer, Optimizer::GradientDescent(_)));
        assert_eq!(r.substitutions.len(), 1);
        assert!(r.config.method.is_deformable());
    }

    #[test]
    fn test_mismatched_pyramid_is_disabled() {
        let raw = RawRegistratorConfig {
            multiple_resolutions: true,
            shrink_factors: vec![4, 2, 1],
            smoothing_sigmas: vec![2.0, 1.0],
            ..Default::default()
        };
        let r = raw.resolve();
        assert!(r.config.pyramid.is_none());
        assert_eq!(r.substitutions[0].field, "multiple_resolutions");

        let raw = RawRegistratorConfig {
            multiple_resolutions: true,
            ..Default::default()
        };
        let r = raw.resolve();
        assert!(r.is_clean());
        assert_eq!(r.config.pyramid.unwrap().shrink_factors, vec![4, 2, 1]);
    }

    #[test]
    fn test_substitution_display() {
        let raw = RawRegistratorConfig {
            method: "affine".to_string(),
            ..Default::default()
        };
        let r = raw.resolve();
        assert_eq!(
            r.substitutions[0].to_string(),
            "`method` = `\"affine\"` is not supported, defaulted to `\"rigid\"`"
        );
    }
}
