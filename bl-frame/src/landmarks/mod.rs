//! 颅骨标志点 (bregma, lambda) 自动定位.
//!
//! 流程:
//!
//! 1. 颅骨表面投影 (micro-CT 沿 `z` 的最大强度投影) 与骨缝模板做 2D 形变配准;
//! 2. 把 bregma/lambda 标记模板经过逆形变映射回个体的投影网格, 取前景像素的平均位置;
//! 3. 用 [`DepthLookup`] 在 micro-CT 中查询 `z`;
//! 4. 计算中线偏移与倾斜角, 做可信度检查.
//!
//! 可信度检查的结果只以 `warn` 输出并随报告返回, 不会中断处理.

use std::fmt;
use std::path::PathBuf;

use log::{info, trace, warn};
use ndarray::{Array2, ArrayView2, ArrayView3, Axis};
use thiserror::Error;

use crate::registrator::{
    fit_to_shape, Interpolator, RegistrationError, Registrator, RegistratorConfig, Transform,
};
use crate::{Idx2d, Idx2dF, Idx3d};

mod depth;
mod templates;

pub use depth::{skull_projection, DepthLookup, SurfaceDepth};
pub use templates::SutureTemplates;

/// 标志点定位错误.
#[derive(Error, Debug)]
pub enum LandmarkError {
    /// 模板图像读取失败.
    #[error("Cannot read template {path:?}: {source}")]
    Template {
        /// 模板路径.
        path: PathBuf,
        /// 底层错误.
        source: image::ImageError,
    },

    /// 模板中没有任何前景像素.
    #[error("Template `{0}` has no foreground pixel")]
    EmptyTemplate(&'static str),

    /// 配准失败.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// 该 `(y, x)` 位置的 micro-CT 列中找不到颅骨表面.
    #[error("No skull surface found in the micro-CT column at (y, x) = {0:?}")]
    NoSurface(Idx2d),

    /// 颅骨投影与 micro-CT 的平面形状不一致.
    #[error("Skull projection shape {projection:?} does not match micro-CT slice shape {ct:?}")]
    ShapeMismatch {
        /// 投影形状.
        projection: Idx2d,
        /// micro-CT 水平切片形状.
        ct: Idx2d,
    },
}

/// 标志点定位结果类型.
pub type LandmarkResult<T> = Result<T, LandmarkError>;

/// 可信度检查的阈值.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PlausibilityLimits {
    /// 标志点偏离中线的最大允许距离 (毫米).
    pub max_deviation_mm: f64,

    /// bregma-lambda 连线与前后轴的最大允许夹角 (度).
    pub max_angle_deg: f64,

    /// 变换参数都不超过该值时视为恒等 (配准未移动).
    pub identity_epsilon: f64,
}

impl Default for PlausibilityLimits {
    fn default() -> Self {
        Self {
            max_deviation_mm: 2.0,
            max_angle_deg: 10.0,
            identity_epsilon: 1e-9,
        }
    }
}

/// 定位结果中的可疑之处.
#[derive(Clone, Debug, PartialEq)]
pub enum LandmarkAnomaly {
    /// 形变配准没有移动任何控制点.
    IdentityTransform,

    /// 标记模板经形变后为空, 改用未形变模板的质心.
    MarkerLost(&'static str),

    /// 标志点偏离中线过远.
    MidlineDeviation {
        /// `"bregma"` 或 `"lambda"`.
        landmark: &'static str,
        /// 偏移 (毫米).
        mm: f64,
    },

    /// bregma-lambda 连线倾斜过大.
    AngleDeviation(f64),

    /// bregma 与 lambda 在 `(y, x)` 平面上重合.
    CoincidentLandmarks,
}

impl fmt::Display for LandmarkAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdentityTransform => write!(f, "suture registration left the grid untouched"),
            Self::MarkerLost(name) => write!(f, "deformed `{name}` marker is empty"),
            Self::MidlineDeviation { landmark, mm } => {
                write!(f, "`{landmark}` is {mm:.2} mm away from the midline")
            }
            Self::AngleDeviation(deg) => write!(f, "BL axis is tilted by {deg:.2} degrees"),
            Self::CoincidentLandmarks => write!(f, "bregma and lambda coincide"),
        }
    }
}

/// 中线偏移与倾斜角.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Deviation {
    /// bregma 相对中线 `x = w / 2` 的偏移 (毫米), 正值表示位于中线左侧.
    pub bregma_mm: f64,

    /// lambda 相对中线的偏移 (毫米).
    pub lambda_mm: f64,

    /// bregma - lambda 向量在 `(x, y)` 平面内与前后轴的夹角 (度).
    /// 两点重合时为 `NaN`.
    pub angle_deg: f64,
}

/// 一次定位的完整输出.
#[derive(Clone, Debug)]
pub struct LandmarkReport {
    /// Bregma `(z, y, x)`.
    pub bregma: Idx3d,

    /// Lambda `(z, y, x)`.
    pub lambda: Idx3d,

    /// 中线偏移与倾斜角.
    pub deviation: Deviation,

    /// 检查出的可疑之处, 可能为空.
    pub anomalies: Vec<LandmarkAnomaly>,
}

impl LandmarkReport {
    /// 没有任何可疑之处?
    #[inline]
    pub fn is_plausible(&self) -> bool {
        self.anomalies.is_empty()
    }
}

/// 标记模板在投影网格上的位置.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MarkerHit {
    /// 平均 `(y, x)`.
    pub position: Idx2dF,

    /// 形变后的模板为空, `position` 来自未形变的模板.
    pub lost: bool,
}

/// 二维数组中正值像素的平均 `(y, x)`.
fn positive_centroid(img: &ArrayView2<f32>) -> Option<Idx2dF> {
    let (mut sy, mut sx, mut n) = (0.0, 0.0, 0usize);
    for ((y, x), v) in img.indexed_iter() {
        if *v > 0.0 {
            sy += y as f64;
            sx += x as f64;
            n += 1;
        }
    }
    (n > 0).then(|| (sy / n as f64, sx / n as f64))
}

/// 把骨缝模板缩放到颅骨投影的网格上, 然后以投影为浮动图像做 2D 形变配准.
/// 只保留变换 `T: 投影网格 -> 投影网格`.
pub fn extract_deformation_map(
    skull_surface: ArrayView2<f32>,
    suture_template: ArrayView2<f32>,
    registrator: &Registrator,
) -> LandmarkResult<Transform> {
    let shape = (1, skull_surface.nrows(), skull_surface.ncols());
    let suture = fit_to_shape(shape, suture_template.insert_axis(Axis(0)), Interpolator::Linear);
    let registered = registrator.register(skull_surface.insert_axis(Axis(0)), suture.view())?;
    trace!(
        "Obtained transform parameters: {:?}",
        registered.transform.parameters()
    );
    Ok(registered.transform)
}

/// 把标记模板经逆形变映射到投影网格 (最近邻), 返回正值像素的平均位置.
///
/// 形变后为空时退回到 (缩放后) 未形变模板的质心, 并在结果中标记 `lost`.
pub fn get_reference_point(
    marker: ArrayView2<f32>,
    skull_shape: Idx2d,
    transform: &Transform,
) -> LandmarkResult<MarkerHit> {
    let shape = (1, skull_shape.0, skull_shape.1);
    let marker = fit_to_shape(shape, marker.insert_axis(Axis(0)), Interpolator::Nearest);
    let undeformed = positive_centroid(&marker.index_axis(Axis(0), 0))
        .ok_or(LandmarkError::EmptyTemplate("marker"))?;

    let resampler = Registrator::new(RegistratorConfig {
        resample_interpolator: Interpolator::Nearest,
        ..Default::default()
    });
    let deformed = resampler.resample(marker.view(), marker.view(), &transform.inverse());
    Ok(match positive_centroid(&deformed.index_axis(Axis(0), 0)) {
        Some(position) => MarkerHit {
            position,
            lost: false,
        },
        None => MarkerHit {
            position: undeformed,
            lost: true,
        },
    })
}

/// 计算中线偏移 (毫米) 与倾斜角 (度).
///
/// 中线取 `shape / 2` (整数除法), `voxel_size` 为 `[z, y, x]`.
pub fn compute_deviation(
    bregma: &Idx3d,
    lambda: &Idx3d,
    shape: Idx3d,
    voxel_size: [f64; 3],
) -> Deviation {
    let mid_x = (shape.2 / 2) as f64;
    let bregma_mm = (mid_x - bregma.2 as f64) * voxel_size[2];
    let lambda_mm = (mid_x - lambda.2 as f64) * voxel_size[2];

    // (x, y) 分量
    let v = [
        bregma.2 as f64 - lambda.2 as f64,
        bregma.1 as f64 - lambda.1 as f64,
    ];
    let norm = v[0].hypot(v[1]);
    let angle_deg = if norm > 0.0 {
        let cos = (v[1] / norm).clamp(-1.0, 1.0);
        180.0 - cos.acos().to_degrees()
    } else {
        f64::NAN
    };
    Deviation {
        bregma_mm,
        lambda_mm,
        angle_deg,
    }
}

/// 根据阈值检查一次定位结果.
fn check_plausibility(
    transform: &Transform,
    hits: &[(&'static str, MarkerHit); 2],
    deviation: &Deviation,
    limits: &PlausibilityLimits,
) -> Vec<LandmarkAnomaly> {
    let mut anomalies = vec![];
    if transform.is_identity(limits.identity_epsilon) {
        anomalies.push(LandmarkAnomaly::IdentityTransform);
    }
    for (name, hit) in hits.iter() {
        if hit.lost {
            anomalies.push(LandmarkAnomaly::MarkerLost(*name));
        }
    }
    for (landmark, mm) in [
        ("bregma", deviation.bregma_mm),
        ("lambda", deviation.lambda_mm),
    ] {
        if mm.abs() > limits.max_deviation_mm {
            anomalies.push(LandmarkAnomaly::MidlineDeviation { landmark, mm });
        }
    }
    if deviation.angle_deg.is_nan() {
        anomalies.push(LandmarkAnomaly::CoincidentLandmarks);
    } else if deviation.angle_deg.abs() > limits.max_angle_deg {
        anomalies.push(LandmarkAnomaly::AngleDeviation(deviation.angle_deg));
    }
    anomalies
}

/// 四舍五入并截断到 `shape` 内.
fn round_into(p: &Idx2dF, (h, w): Idx2d) -> Idx2d {
    let y = p.0.round().clamp(0.0, h.saturating_sub(1) as f64) as usize;
    let x = p.1.round().clamp(0.0, w.saturating_sub(1) as f64) as usize;
    (y, x)
}

/// 自动定位 bregma 与 lambda.
///
/// `skull_surface` 为颅骨表面投影 (见 [`skull_projection`]), 须与 `ct` 的水平切片同形状.
/// `voxel_size` 为 `[z, y, x]`.
pub fn get_bregma_lambda(
    ct: ArrayView3<f32>,
    skull_surface: ArrayView2<f32>,
    voxel_size: [f64; 3],
    templates: &SutureTemplates,
    registrator: &Registrator,
    depth: &dyn DepthLookup,
    limits: &PlausibilityLimits,
) -> LandmarkResult<LandmarkReport> {
    let (d, h, w) = ct.dim();
    if skull_surface.dim() != (h, w) {
        return Err(LandmarkError::ShapeMismatch {
            projection: skull_surface.dim(),
            ct: (h, w),
        });
    }

    let transform = extract_deformation_map(skull_surface, templates.suture(), registrator)?;
    let hits = [
        ("bregma", get_reference_point(templates.bregma(), (h, w), &transform)?),
        ("lambda", get_reference_point(templates.lambda(), (h, w), &transform)?),
    ];

    let locate = |hit: &MarkerHit| -> LandmarkResult<Idx3d> {
        let (y, x) = round_into(&hit.position, (h, w));
        let z = depth
            .depth(&ct, (y, x))
            .ok_or(LandmarkError::NoSurface((y, x)))?;
        Ok((z.min(d.saturating_sub(1)), y, x))
    };
    let bregma = locate(&hits[0].1)?;
    let lambda = locate(&hits[1].1)?;
    info!("Bregma coordinates: {bregma:?} (z, y, x)");
    info!("Lambda coordinates: {lambda:?} (z, y, x)");

    let deviation = compute_deviation(&bregma, &lambda, (d, h, w), voxel_size);
    info!("Deviation bregma {:.1} mm", deviation.bregma_mm);
    info!("Deviation lambda {:.1} mm", deviation.lambda_mm);
    info!("Angle: {:.2} degrees", deviation.angle_deg);

    let anomalies = check_plausibility(&transform, &hits, &deviation, limits);
    for anomaly in anomalies.iter() {
        warn!("Implausible landmark localisation: {anomaly}");
    }
    Ok(LandmarkReport {
        bregma,
        lambda,
        deviation,
        anomalies,
    })
}

/// 从 micro-CT 生成投影后定位. 见 [`get_bregma_lambda`].
pub fn locate_landmarks(
    ct: ArrayView3<f32>,
    voxel_size: [f64; 3],
    templates: &SutureTemplates,
    registrator: &Registrator,
    depth: &dyn DepthLookup,
    limits: &PlausibilityLimits,
) -> LandmarkResult<LandmarkReport> {
    let skull: Array2<f32> = skull_projection(&ct);
    get_bregma_lambda(
        ct,
        skull.view(),
        voxel_size,
        templates,
        registrator,
        depth,
        limits,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registrator::RigidTransform;
    use ndarray::{s, Array3};

    fn square(h: usize, w: usize, y: std::ops::Range<usize>, x: std::ops::Range<usize>) -> Array2<f32> {
        let mut a = Array2::<f32>::zeros((h, w));
        a.slice_mut(s![y, x]).fill(255.0);
        a
    }

    /// 一横一竖两条高斯骨缝, 交点在 `(cy, cx)`.
    fn suture_bars(h: usize, w: usize, cy: f64, cx: f64) -> Array2<f32> {
        Array2::from_shape_fn((h, w), |(y, x)| {
            let gy = (-(y as f64 - cy).powi(2) / 18.0).exp();
            let gx = (-(x as f64 - cx).powi(2) / 18.0).exp();
            (255.0 * gy.max(gx)) as f32
        })
    }

    fn bar_templates() -> SutureTemplates {
        SutureTemplates::from_arrays(
            suture_bars(48, 60, 24.0, 30.0),
            square(48, 60, 23..26, 29..32),
            square(48, 60, 35..38, 29..32),
        )
        .unwrap()
    }

    #[test]
    fn test_suture_deformation_follows_shift() {
        // 颅骨相对模板平移 (dy, dx) = (3, 2)
        let templates = bar_templates();
        let skull = suture_bars(48, 60, 27.0, 32.0);
        let registrator = crate::registrator::suture_registrator();
        let t = extract_deformation_map(skull.view(), templates.suture(), registrator).unwrap();
        assert!(matches!(t, Transform::BSpline(_)));
        assert!(!t.is_identity(1e-9));

        let hit = get_reference_point(templates.bregma(), (48, 60), &t).unwrap();
        assert!(!hit.lost);
        // 未形变质心 (24, 30). 每个分量沿平移方向移动, 且不超过三倍平移量.
        let (dy, dx) = (hit.position.0 - 24.0, hit.position.1 - 30.0);
        assert!(dy > 0.0 && dy <= 9.0, "{hit:?}");
        assert!(dx > 0.0 && dx <= 6.0, "{hit:?}");
    }

    #[test]
    fn test_bregma_lambda_on_shifted_skull() {
        let templates = bar_templates();
        let skull = suture_bars(48, 60, 27.0, 32.0);
        // 颅骨只在 z = 5 一层, 每列都有正值
        let mut ct = Array3::<f32>::zeros((8, 48, 60));
        ct.index_axis_mut(Axis(0), 5).assign(&skull.mapv(|v| v + 1.0));

        let report = locate_landmarks(
            ct.view(),
            [0.1; 3],
            &templates,
            crate::registrator::suture_registrator(),
            &SurfaceDepth::default(),
            &PlausibilityLimits::default(),
        )
        .unwrap();
        for (z, y, x) in [report.bregma, report.lambda] {
            assert_eq!(z, 5);
            assert!(y < 48 && x < 60);
        }
        assert!(report.lambda.1 > report.bregma.1);
        assert!(report.bregma.1 >= 24 && report.bregma.2 >= 30);
        assert!(!report.anomalies.contains(&LandmarkAnomaly::IdentityTransform));
        assert!(!report
            .anomalies
            .iter()
            .any(|a| matches!(a, LandmarkAnomaly::MarkerLost(_))));
    }

    #[test]
    fn test_compute_deviation() {
        let dev = compute_deviation(&(5, 40, 50), &(5, 60, 50), (100, 100, 100), [0.025; 3]);
        assert_eq!(dev.bregma_mm, 0.0);
        assert_eq!(dev.lambda_mm, 0.0);
        assert!(dev.angle_deg.abs() < 1e-9);

        let dev = compute_deviation(&(5, 40, 46), &(5, 60, 54), (100, 100, 100), [0.025; 3]);
        assert!((dev.bregma_mm - 0.1).abs() < 1e-12);
        assert!((dev.lambda_mm + 0.1).abs() < 1e-12);
        // tan = 8 / 20
        assert!((dev.angle_deg - (8.0f64 / 20.0).atan().to_degrees()).abs() < 1e-9);

        let dev = compute_deviation(&(5, 40, 50), &(9, 40, 50), (100, 100, 100), [0.025; 3]);
        assert!(dev.angle_deg.is_nan());
    }

    #[test]
    fn test_reference_point_identity() {
        let marker = square(20, 30, 4..7, 10..13);
        let t = Transform::identity(true, [0.0, 9.5, 14.5]);
        let hit = get_reference_point(marker.view(), (20, 30), &t).unwrap();
        assert!(!hit.lost);
        assert_eq!(hit.position, (5.0, 11.0));
    }

    #[test]
    fn test_reference_point_follows_translation() {
        let marker = square(20, 30, 4..7, 10..13);
        let t = Transform::Rigid(RigidTransform::from_parameters(
            true,
            [0.0, 9.5, 14.5],
            &[0.0, 3.0, -2.0],
        ));
        let hit = get_reference_point(marker.view(), (20, 30), &t).unwrap();
        assert!((hit.position.0 - 8.0).abs() < 1e-9);
        assert!((hit.position.1 - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_marker_pushed_out_is_lost() {
        let marker = square(20, 30, 4..7, 10..13);
        let t = Transform::Rigid(RigidTransform::from_parameters(
            true,
            [0.0, 9.5, 14.5],
            &[0.0, 100.0, 0.0],
        ));
        let hit = get_reference_point(marker.view(), (20, 30), &t).unwrap();
        assert!(hit.lost);
        assert_eq!(hit.position, (5.0, 11.0));
    }

    #[test]
    fn test_reference_point_resizes_marker() {
        // 10x15 模板放大到 19x29 (比例恰为 0.5)
        let marker = square(10, 15, 2..3, 5..6);
        let t = Transform::identity(true, [0.0; 3]);
        let hit = get_reference_point(marker.view(), (19, 29), &t).unwrap();
        assert!((hit.position.0 - 4.0).abs() <= 0.5);
        assert!((hit.position.1 - 10.0).abs() <= 0.5);
    }

    #[test]
    fn test_plausibility() {
        let t = Transform::identity(true, [0.0; 3]);
        let lost = |lost| MarkerHit {
            position: (0.0, 0.0),
            lost,
        };
        let hits = [("bregma", lost(true)), ("lambda", lost(false))];
        let deviation = compute_deviation(&(5, 40, 0), &(5, 60, 50), (100, 100, 100), [0.1; 3]);
        let anomalies = check_plausibility(&t, &hits, &deviation, &PlausibilityLimits::default());
        assert!(anomalies.contains(&LandmarkAnomaly::IdentityTransform));
        assert!(anomalies.contains(&LandmarkAnomaly::MarkerLost("bregma")));
        assert!(anomalies.contains(&LandmarkAnomaly::MidlineDeviation {
            landmark: "bregma",
            mm: 5.0
        }));
        assert!(anomalies
            .iter()
            .any(|a| matches!(a, LandmarkAnomaly::AngleDeviation(_))));
    }

    #[test]
    fn test_shape_mismatch() {
        let ct = Array3::<f32>::zeros((4, 10, 10));
        let skull = Array2::<f32>::zeros((10, 12));
        let templates = SutureTemplates::from_arrays(
            Array2::ones((10, 10)),
            square(10, 10, 1..2, 1..2),
            square(10, 10, 5..6, 1..2),
        )
        .unwrap();
        let err = get_bregma_lambda(
            ct.view(),
            skull.view(),
            [0.1; 3],
            &templates,
            crate::registrator::suture_registrator(),
            &SurfaceDepth::default(),
            &PlausibilityLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, LandmarkError::ShapeMismatch { .. }));
    }
}
