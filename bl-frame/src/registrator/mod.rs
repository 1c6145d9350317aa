//! 图像配准引擎.
//!
//! 支持刚性 (2D/3D) 与三次 B 样条自由形变两种变换模型. 2D 图像一律视为深度为 1 的体数据,
//! 所有坐标均为 `(z, y, x)` 体素坐标. 变换的方向约定为: 固定图像网格 -> 浮动图像空间.

use log::{debug, trace, warn};
use ndarray::{Array3, ArrayView2, ArrayView3, Axis};
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::Vec3;

pub mod config;
mod interp;
mod metric;
mod optimizer;
pub mod pyramid;
pub mod transform;

pub use config::{
    CenterType, Dimension, Exhaustive, GradientDescent, Interpolator, Lbfgs, Loss, Method,
    Optimizer, Pyramid, RawRegistratorConfig, RegistratorConfig, Resolved, Substitution,
};
pub use transform::{BSplineGrid, BSplineTransform, RigidTransform, Transform};

pub(crate) use interp::{fill_grid, sample_linear, sample_nearest};

use metric::{Metric, Range};

/// 配准运行时错误.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    /// 固定图像或浮动图像为空.
    #[error("Cannot register an empty image")]
    EmptyImage,

    /// 2D 配准的输入深度不为 1.
    #[error("2D registration expects images of depth 1, got depth {0}")]
    DimensionMismatch(usize),

    /// 度量或梯度出现 NaN / 无穷.
    #[error("The similarity metric became non-finite")]
    NonFiniteMetric,
}

/// 配准结果类型.
pub type RegResult<T> = Result<T, RegistrationError>;

/// 优化器停止的原因.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StopReason {
    /// 收敛窗口内损失不再变化, 或无法继续下降.
    Converged,

    /// 达到最大迭代次数.
    MaxIterations,

    /// 梯度小于阈值.
    GradientTolerance,

    /// 穷举完毕.
    ExhaustiveDone,
}

/// 配准过程摘要.
#[derive(Clone, Debug)]
pub struct RegistrationReport {
    /// 所有金字塔层的迭代次数之和.
    pub iterations: usize,

    /// 最终度量值.
    pub metric: f64,

    /// 最后一层的停止原因.
    pub stop: StopReason,

    /// 金字塔层数 (未启用时为 1).
    pub levels: usize,
}

/// 一次配准的输出.
#[derive(Clone, Debug)]
pub struct Registered {
    /// 浮动图像重采样到固定网格后的结果.
    pub image: Array3<f32>,

    /// 固定网格 -> 浮动空间的变换.
    pub transform: Transform,

    /// 过程摘要.
    pub report: RegistrationReport,
}

/// 待优化的参数化变换模型.
enum Model {
    Rigid { planar: bool, center: Vec3 },
    BSpline(BSplineGrid),
}

impl Model {
    /// 刚性模型参数的有限差分步长.
    const PARAM_DELTA: f64 = 1e-6;

    fn n_params(&self) -> usize {
        match self {
            Self::Rigid { planar, .. } => RigidTransform::n_params(*planar),
            Self::BSpline(grid) => grid.n_params(),
        }
    }

    fn build(&self, params: &[f64]) -> Transform {
        match self {
            Self::Rigid { planar, center } => {
                Transform::Rigid(RigidTransform::from_parameters(*planar, *center, params))
            }
            Self::BSpline(grid) => Transform::BSpline(BSplineTransform {
                grid: grid.clone(),
                coefficients: params.to_vec(),
            }),
        }
    }

    /// 参数变化 1 引起的典型位移. 角度以图像半径计.
    fn scales(&self, radius: f64) -> Vec<f64> {
        match self {
            Self::Rigid { planar: true, .. } => vec![radius, 1.0, 1.0],
            Self::Rigid { planar: false, .. } => vec![radius, radius, radius, 1.0, 1.0, 1.0],
            Self::BSpline(grid) => vec![1.0; grid.n_params()],
        }
    }

    /// 刚性模型: 每个参数扰动后的变换, 用于对点求雅可比矩阵.
    fn perturbed(&self, params: &[f64]) -> Vec<(Transform, f64)> {
        match self {
            Self::Rigid { .. } => (0..params.len())
                .map(|i| {
                    let mut p = params.to_vec();
                    p[i] += Self::PARAM_DELTA;
                    (self.build(&p), Self::PARAM_DELTA)
                })
                .collect(),
            Self::BSpline(_) => vec![],
        }
    }

    /// 累加 `coeff * (∇M · dT/dθ)` 到 `out`.
    fn accumulate(
        &self,
        p: &Vec3,
        mapped: &Vec3,
        perturbed: &[(Transform, f64)],
        coeff: f64,
        grad_m: &Vec3,
        out: &mut [f64],
    ) {
        match self {
            Self::Rigid { .. } => {
                for ((t, h), o) in perturbed.iter().zip(out.iter_mut()) {
                    let q = t.apply(p);
                    let dot: f64 = (0..3).map(|a| (q[a] - mapped[a]) / h * grad_m[a]).sum();
                    *o += coeff * dot;
                }
            }
            Self::BSpline(grid) => {
                let n = grid.len();
                let weights = grid.weights(p);
                for axis in 0..3 {
                    let Some(slot) = grid.active_slot(axis) else {
                        continue;
                    };
                    for (k, w) in weights.iter() {
                        out[slot * n + k] += coeff * grad_m[axis] * w;
                    }
                }
            }
        }
    }
}

/// 以强度 (减去最小值后) 为权重的质心. 全零图像返回几何中心.
fn center_of_mass(img: &ArrayView3<f32>) -> Vec3 {
    let min = img.iter().copied().fold(f32::INFINITY, f32::min) as f64;
    let mut acc = [0.0; 3];
    let mut total = 0.0;
    for ((z, y, x), v) in img.indexed_iter() {
        let w = *v as f64 - min;
        if w > 0.0 {
            acc[0] += w * z as f64;
            acc[1] += w * y as f64;
            acc[2] += w * x as f64;
            total += w;
        }
    }
    if total > 0.0 {
        acc.map(|a| a / total)
    } else {
        geometric_center(img.dim())
    }
}

#[inline]
fn geometric_center((d, h, w): (usize, usize, usize)) -> Vec3 {
    [
        (d as f64 - 1.0) / 2.0,
        (h as f64 - 1.0) / 2.0,
        (w as f64 - 1.0) / 2.0,
    ]
}

/// 将 `image` 缩放到 `reference_shape` 的网格上 (两端对齐).
pub fn fit_to_shape(
    reference_shape: (usize, usize, usize),
    image: ArrayView3<f32>,
    interpolator: Interpolator,
) -> Array3<f32> {
    if image.dim() == reference_shape {
        return image.to_owned();
    }
    let src = {
        let (d, h, w) = image.dim();
        [d, h, w]
    };
    let dst = [reference_shape.0, reference_shape.1, reference_shape.2];
    let ratio: [f64; 3] = std::array::from_fn(|a| {
        if dst[a] > 1 {
            (src[a] as f64 - 1.0) / (dst[a] as f64 - 1.0)
        } else {
            0.0
        }
    });
    debug!("Fitting image of shape {src:?} onto {dst:?}");
    fill_grid(reference_shape, |p| {
        interpolator.sample(&image, &[p[0] * ratio[0], p[1] * ratio[1], p[2] * ratio[2]])
    })
}

/// 配准引擎. 配置在创建时解析完毕, 之后不可变.
#[derive(Clone, Debug)]
pub struct Registrator {
    config: RegistratorConfig,
    substitutions: Vec<Substitution>,
}

/// 骨缝模板配准预设: 2D 形变, 100 桶互信息, 梯度下降 1000 次迭代, 网格 10.
static SUTURE_REGISTRATOR: Lazy<Registrator> = Lazy::new(|| {
    Registrator::from_raw(&RawRegistratorConfig {
        method: "deform".to_string(),
        loss: "MI".to_string(),
        optimizer: "GD".to_string(),
        dimension: 2,
        iterations: 1000,
        check_shape: true,
        grid_size: 10,
        convergence_minimum: 1e-25,
        convergence_window: 100,
        learning_rate: 1e-20,
        sampling_percentage: 1.0,
        bin_size: 100,
        ..Default::default()
    })
});

/// 获取骨缝模板配准预设.
#[inline]
pub fn suture_registrator() -> &'static Registrator {
    &SUTURE_REGISTRATOR
}

impl Default for Registrator {
    fn default() -> Self {
        Self::new(RegistratorConfig::default())
    }
}

impl Registrator {
    /// 由合法配置创建.
    pub fn new(config: RegistratorConfig) -> Self {
        Self {
            config,
            substitutions: vec![],
        }
    }

    /// 由字符串配置创建. 替换记录保留在 [`Self::substitutions`] 中.
    pub fn from_raw(raw: &RawRegistratorConfig) -> Self {
        let Resolved {
            config,
            substitutions,
        } = raw.resolve();
        Self {
            config,
            substitutions,
        }
    }

    /// 当前配置.
    #[inline]
    pub fn config(&self) -> &RegistratorConfig {
        &self.config
    }

    /// 创建时发生的默认值替换.
    #[inline]
    pub fn substitutions(&self) -> &[Substitution] {
        &self.substitutions
    }

    /// 2D 便捷接口. 等价于在两幅图像前插入深度轴后调用 [`Self::register`].
    pub fn register_2d(
        &self,
        moving: ArrayView2<f32>,
        fixed: ArrayView2<f32>,
    ) -> RegResult<Registered> {
        self.register(moving.insert_axis(Axis(0)), fixed.insert_axis(Axis(0)))
    }

    /// 寻找使损失最小的变换 `T: 固定网格 -> 浮动空间`, 返回重采样后的浮动图像与变换.
    pub fn register(
        &self,
        moving: ArrayView3<f32>,
        fixed: ArrayView3<f32>,
    ) -> RegResult<Registered> {
        if moving.is_empty() || fixed.is_empty() {
            return Err(RegistrationError::EmptyImage);
        }
        let planar = self.config.dimension == Dimension::Two;
        if planar {
            for depth in [moving.len_of(Axis(0)), fixed.len_of(Axis(0))] {
                if depth != 1 {
                    return Err(RegistrationError::DimensionMismatch(depth));
                }
            }
        }

        let moving = if self.config.check_shape && moving.dim() != fixed.dim() {
            warn!(
                "Moving shape {:?} differs from fixed shape {:?}, resizing moving image.",
                moving.dim(),
                fixed.dim()
            );
            fit_to_shape(fixed.dim(), moving, Interpolator::Linear)
        } else {
            moving.to_owned()
        };

        let (model, mut params) = match self.config.method {
            Method::Rigid { .. } => {
                let (center, offset) = self.initial_center(&fixed, &moving.view());
                // 平移总是最后三个参数; 平面模型中 offset[0] 恒为 0, 恰好占据角度位.
                let mut init = vec![0.0; RigidTransform::n_params(planar)];
                let n = init.len();
                init[n - 3..].copy_from_slice(&offset);
                (Model::Rigid { planar, center }, init)
            }
            Method::Deform { grid_size } => {
                let grid = BSplineGrid::new(fixed.dim(), grid_size, planar);
                let n = grid.n_params();
                (Model::BSpline(grid), vec![0.0; n])
            }
        };

        let radius = {
            let (d, h, w) = fixed.dim();
            (((d * d + h * h + w * w) as f64).sqrt() / 2.0).max(1.0)
        };
        let scales = model.scales(radius);

        let levels: Vec<pyramid::Level> = match &self.config.pyramid {
            Some(p) => pyramid::build(fixed, moving.view(), &p.shrink_factors, &p.smoothing_sigmas),
            None => vec![pyramid::Level {
                fixed: fixed.to_owned(),
                moving: moving.clone(),
                factor: [1.0; 3],
            }],
        };

        let mut report = RegistrationReport {
            iterations: 0,
            metric: f64::NAN,
            stop: StopReason::MaxIterations,
            levels: levels.len(),
        };
        for (i, level) in levels.iter().enumerate() {
            let outcome = self.optimize_level(&model, level, params, &scales)?;
            debug!(
                "Level {i}: {} iterations, metric = {:.6e}, stop = {:?}",
                outcome.iterations, outcome.value, outcome.stop
            );
            params = outcome.params;
            report.iterations += outcome.iterations;
            report.metric = outcome.value;
            report.stop = outcome.stop;
        }

        let transform = model.build(&params);
        trace!("Registration transform parameters: {:?}", transform.parameters());
        let image = self.resample(fixed, moving.view(), &transform);
        Ok(Registered {
            image,
            transform,
            report,
        })
    }

    /// 刚性模型的中心与初始平移.
    fn initial_center(&self, fixed: &ArrayView3<f32>, moving: &ArrayView3<f32>) -> (Vec3, Vec3) {
        let center = match self.config.method {
            Method::Rigid {
                center: CenterType::Geometric,
            } => (geometric_center(fixed.dim()), geometric_center(moving.dim())),
            _ => (center_of_mass(fixed), center_of_mass(moving)),
        };
        let (cf, cm) = center;
        let mut offset = [cm[0] - cf[0], cm[1] - cf[1], cm[2] - cf[2]];
        if self.config.dimension == Dimension::Two {
            offset[0] = 0.0;
        }
        (cf, offset)
    }

    /// 在一层金字塔上运行优化器.
    fn optimize_level(
        &self,
        model: &Model,
        level: &pyramid::Level,
        init: Vec<f64>,
        scales: &[f64],
    ) -> RegResult<optimizer::Outcome> {
        let stride = (1.0 / self.config.sampling_percentage).round().max(1.0) as usize;
        let samples: Vec<(Vec3, f64)> = level
            .fixed
            .indexed_iter()
            .step_by(stride)
            .map(|((z, y, x), v)| {
                (
                    [
                        z as f64 * level.factor[0],
                        y as f64 * level.factor[1],
                        x as f64 * level.factor[2],
                    ],
                    *v as f64,
                )
            })
            .collect();
        let fixed_values: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
        let moving = level.moving.view();
        let metric = Metric {
            loss: self.config.loss,
            fixed_range: Range::of(fixed_values.iter().copied()),
            moving_range: Range::of(moving.iter().map(|v| *v as f64)),
        };
        let interpolator = self.config.registration_interpolator;
        let factor = level.factor;
        let to_level = |p: &Vec3| [p[0] / factor[0], p[1] / factor[1], p[2] / factor[2]];

        let objective = |params: &[f64]| -> RegResult<(f64, Vec<f64>)> {
            let transform = model.build(params);
            let perturbed = model.perturbed(params);
            let mapped: Vec<Vec3> = samples.iter().map(|(p, _)| transform.apply(p)).collect();
            let moving_values: Vec<f64> = mapped
                .iter()
                .map(|q| interpolator.sample(&moving, &to_level(q)) as f64)
                .collect();
            let (loss, dl_dm) = metric.evaluate(&fixed_values, &moving_values);

            let mut grad = vec![0.0; model.n_params()];
            for (((p, _), q), coeff) in samples.iter().zip(&mapped).zip(&dl_dm) {
                if *coeff == 0.0 {
                    continue;
                }
                let g = interp::gradient_linear(&moving, &to_level(q));
                // 层坐标梯度 -> 原分辨率坐标梯度
                let g = [g[0] / factor[0], g[1] / factor[1], g[2] / factor[2]];
                model.accumulate(p, q, &perturbed, *coeff, &g, &mut grad);
            }
            Ok((loss, grad))
        };

        optimizer::optimize(&self.config.optimizer, init, scales, objective)
    }

    /// 用已有变换把 `moving` 重采样到 `fixed` 的网格上, 使用重采样插值方式.
    /// `moving` 范围外读作 `0`.
    pub fn resample(
        &self,
        fixed: ArrayView3<f32>,
        moving: ArrayView3<f32>,
        transform: &Transform,
    ) -> Array3<f32> {
        let interpolator = self.config.resample_interpolator;
        debug!(
            "Resampling {:?} onto {:?} with {interpolator:?} interpolation",
            moving.dim(),
            fixed.dim()
        );
        fill_grid(fixed.dim(), |p| interpolator.sample(&moving, &transform.apply(p)))
    }

    /// 以图像自身的网格作为目标网格应用变换.
    #[inline]
    pub fn apply_transform(&self, image: ArrayView3<f32>, transform: &Transform) -> Array3<f32> {
        self.resample(image, image, transform)
    }
}
