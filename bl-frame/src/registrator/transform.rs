//! 空间变换. 约定变换将固定图像网格上的点映射到浮动图像空间.
//!
//! 变换一经创建便不可变, 使用方只持有 `&Transform`.

use nalgebra::{Matrix3, Vector3};

use crate::Vec3;

/// 刚性变换: `T(p) = R (p - c) + c + t`.
#[derive(Clone, Debug, PartialEq)]
pub struct RigidTransform {
    /// 是否仅在 `(y, x)` 平面内旋转.
    pub planar: bool,

    /// 旋转中心.
    pub center: Vec3,

    /// 旋转矩阵, 作用于 `(z, y, x)` 分量.
    pub matrix: Matrix3<f64>,

    /// 平移.
    pub translation: Vec3,
}

/// 绕 z 轴旋转 (只影响 `y`, `x` 分量).
fn rot_z(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(1.0, 0.0, 0.0, 0.0, c, -s, 0.0, s, c)
}

/// 绕 y 轴旋转 (只影响 `z`, `x` 分量).
fn rot_y(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c)
}

/// 绕 x 轴旋转 (只影响 `z`, `y` 分量).
fn rot_x(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0)
}

#[inline]
pub(crate) fn to_vector(p: &Vec3) -> Vector3<f64> {
    Vector3::new(p[0], p[1], p[2])
}

#[inline]
pub(crate) fn from_vector(v: &Vector3<f64>) -> Vec3 {
    [v[0], v[1], v[2]]
}

impl RigidTransform {
    /// 参数个数: 平面 3 个 `[angle, ty, tx]`, 空间 6 个 `[az, ay, ax, tz, ty, tx]`.
    #[inline]
    pub fn n_params(planar: bool) -> usize {
        if planar {
            3
        } else {
            6
        }
    }

    /// 由参数向量构造.
    pub fn from_parameters(planar: bool, center: Vec3, params: &[f64]) -> Self {
        let (matrix, translation) = if planar {
            (rot_z(params[0]), [0.0, params[1], params[2]])
        } else {
            (
                rot_z(params[0]) * rot_y(params[1]) * rot_x(params[2]),
                [params[3], params[4], params[5]],
            )
        };
        Self {
            planar,
            center,
            matrix,
            translation,
        }
    }

    /// 映射一个点.
    #[inline]
    pub fn apply(&self, p: &Vec3) -> Vec3 {
        let c = to_vector(&self.center);
        let q = self.matrix * (to_vector(p) - c) + c + to_vector(&self.translation);
        from_vector(&q)
    }

    /// 精确逆变换.
    pub fn inverse(&self) -> Self {
        let rt = self.matrix.transpose();
        let t = -(rt * to_vector(&self.translation));
        Self {
            planar: self.planar,
            center: self.center,
            matrix: rt,
            translation: from_vector(&t),
        }
    }

    /// 是否为恒等变换 (误差 `eps` 以内).
    pub fn is_identity(&self, eps: f64) -> bool {
        (self.matrix - Matrix3::identity()).abs().max() <= eps
            && self.translation.iter().all(|t| t.abs() <= eps)
    }
}

/// 三次 B 样条基函数在 `t ∈ [0, 1]` 处的四个权重.
#[inline]
fn cubic_weights(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        (1.0 - t).powi(3) / 6.0,
        (3.0 * t3 - 6.0 * t2 + 4.0) / 6.0,
        (-3.0 * t3 + 3.0 * t2 + 3.0 * t + 1.0) / 6.0,
        t3 / 6.0,
    ]
}

/// B 样条控制网格. 只描述几何, 不含系数.
#[derive(Clone, Debug, PartialEq)]
pub struct BSplineGrid {
    /// 每个轴上的控制点个数. 非活动轴为 1.
    pub nodes: [usize; 3],

    /// 控制点间距.
    pub spacing: Vec3,

    /// 第 0 个控制点的位置.
    pub origin: Vec3,

    /// 参与形变的轴.
    pub active: [bool; 3],
}

impl BSplineGrid {
    /// 在形状为 `shape` 的图像上建立每轴 `grid_size` 个单元的网格.
    /// 深度为 1 (或 `planar` 时的 z 轴) 的轴不参与形变.
    pub fn new(shape: (usize, usize, usize), grid_size: usize, planar: bool) -> Self {
        let dims = [shape.0, shape.1, shape.2];
        let g = grid_size.max(1);
        let mut nodes = [1; 3];
        let mut spacing = [1.0; 3];
        let mut origin = [0.0; 3];
        let mut active = [false; 3];
        for axis in 0..3 {
            if dims[axis] <= 1 || (planar && axis == 0) {
                continue;
            }
            active[axis] = true;
            nodes[axis] = g + 3;
            spacing[axis] = (dims[axis] - 1) as f64 / g as f64;
            origin[axis] = -spacing[axis];
        }
        Self {
            nodes,
            spacing,
            origin,
            active,
        }
    }

    /// 控制点总数.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.iter().product()
    }

    /// 是否没有控制点.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 活动轴个数.
    #[inline]
    pub fn n_active(&self) -> usize {
        self.active.iter().filter(|a| **a).count()
    }

    /// 系数个数: 每个活动轴一组.
    #[inline]
    pub fn n_params(&self) -> usize {
        self.len() * self.n_active()
    }

    /// 活动轴在系数向量中的序号.
    pub(crate) fn active_slot(&self, axis: usize) -> Option<usize> {
        self.active[axis].then(|| self.active[..axis].iter().filter(|a| **a).count())
    }

    /// 一个轴上的 (起始控制点, 四个权重).
    fn axis_support(&self, axis: usize, coord: f64) -> (usize, [f64; 4]) {
        let g = self.nodes[axis] - 3;
        let u = ((coord - self.origin[axis]) / self.spacing[axis]).clamp(1.0, (g + 1) as f64);
        let mut i = u.floor() as usize;
        let mut t = u - i as f64;
        if i > g {
            i = g;
            t = 1.0;
        }
        (i - 1, cubic_weights(t))
    }

    /// 点 `p` 处所有非零权重 `(控制点扁平下标, 权重)`.
    pub fn weights(&self, p: &Vec3) -> Vec<(usize, f64)> {
        let support: [(usize, Vec<f64>); 3] = std::array::from_fn(|axis| {
            if self.active[axis] {
                let (start, w) = self.axis_support(axis, p[axis]);
                (start, w.to_vec())
            } else {
                (0, vec![1.0])
            }
        });
        let [ny, nx] = [self.nodes[1], self.nodes[2]];

        let mut ans = Vec::with_capacity(64);
        for (dz, wz) in support[0].1.iter().enumerate() {
            for (dy, wy) in support[1].1.iter().enumerate() {
                for (dx, wx) in support[2].1.iter().enumerate() {
                    let w = wz * wy * wx;
                    if w == 0.0 {
                        continue;
                    }
                    let (z, y, x) = (support[0].0 + dz, support[1].0 + dy, support[2].0 + dx);
                    ans.push(((z * ny + y) * nx + x, w));
                }
            }
        }
        ans
    }
}

/// 三次 B 样条自由形变: `T(p) = p + Σ w_k(p) c_k`.
#[derive(Clone, Debug, PartialEq)]
pub struct BSplineTransform {
    /// 控制网格.
    pub grid: BSplineGrid,

    /// 系数, 按活动轴分组: `[axis_slot * grid.len() + node]`.
    pub coefficients: Vec<f64>,
}

impl BSplineTransform {
    /// 点 `p` 处的位移.
    pub fn displacement(&self, p: &Vec3) -> Vec3 {
        let n = self.grid.len();
        let weights = self.grid.weights(p);
        let mut d = [0.0; 3];
        for (axis, v) in d.iter_mut().enumerate() {
            if let Some(slot) = self.grid.active_slot(axis) {
                let coef = &self.coefficients[slot * n..(slot + 1) * n];
                *v = weights.iter().map(|(k, w)| w * coef[*k]).sum();
            }
        }
        d
    }

    /// 映射一个点.
    #[inline]
    pub fn apply(&self, p: &Vec3) -> Vec3 {
        let d = self.displacement(p);
        [p[0] + d[0], p[1] + d[1], p[2] + d[2]]
    }
}

/// 由配准产生的空间变换.
#[derive(Clone, Debug, PartialEq)]
pub enum Transform {
    /// 刚性变换 (2D 或 3D).
    Rigid(RigidTransform),

    /// B 样条自由形变.
    BSpline(BSplineTransform),

    /// 另一个变换的逆, 以不动点迭代求值.
    Inverse(Box<Transform>),
}

impl Transform {
    /// 不动点迭代次数.
    const INVERSE_ITERATIONS: usize = 32;

    /// 恒等变换.
    pub fn identity(planar: bool, center: Vec3) -> Self {
        let n = RigidTransform::n_params(planar);
        Self::Rigid(RigidTransform::from_parameters(planar, center, &vec![0.0; n]))
    }

    /// 映射一个点 (固定网格 -> 浮动空间).
    pub fn apply(&self, p: &Vec3) -> Vec3 {
        match self {
            Self::Rigid(r) => r.apply(p),
            Self::BSpline(b) => b.apply(p),
            Self::Inverse(inner) => inner.apply_inverse(p),
        }
    }

    /// 求 `self` 的逆在 `q` 处的值.
    fn apply_inverse(&self, q: &Vec3) -> Vec3 {
        match self {
            Self::Rigid(r) => r.inverse().apply(q),
            Self::Inverse(inner) => inner.apply(q),
            Self::BSpline(b) => {
                // x = q - d(x)
                let mut x = *q;
                for _ in 0..Self::INVERSE_ITERATIONS {
                    let d = b.displacement(&x);
                    let next = [q[0] - d[0], q[1] - d[1], q[2] - d[2]];
                    let step = next
                        .iter()
                        .zip(x.iter())
                        .fold(0f64, |m, (a, b)| m.max((a - b).abs()));
                    x = next;
                    if step < 1e-6 {
                        break;
                    }
                }
                x
            }
        }
    }

    /// 逆变换. 刚性变换的逆是精确的, 形变的逆以包装形式延迟求值.
    pub fn inverse(&self) -> Self {
        match self {
            Self::Rigid(r) => Self::Rigid(r.inverse()),
            Self::Inverse(inner) => inner.as_ref().clone(),
            Self::BSpline(_) => Self::Inverse(Box::new(self.clone())),
        }
    }

    /// 变换是否 (在 `eps` 以内) 退化为恒等变换.
    pub fn is_identity(&self, eps: f64) -> bool {
        match self {
            Self::Rigid(r) => r.is_identity(eps),
            Self::BSpline(b) => b.coefficients.iter().all(|c| c.abs() <= eps),
            Self::Inverse(inner) => inner.is_identity(eps),
        }
    }

    /// 参数摘要, 用于日志.
    pub fn parameters(&self) -> Vec<f64> {
        match self {
            Self::Rigid(r) => r
                .matrix
                .iter()
                .copied()
                .chain(r.translation.iter().copied())
                .collect(),
            Self::BSpline(b) => b.coefficients.clone(),
            Self::Inverse(inner) => inner.parameters(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &Vec3, b: &Vec3, eps: f64) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= eps)
    }

    #[test]
    fn test_rigid_inverse_roundtrip() {
        let r = RigidTransform::from_parameters(false, [5.0, 5.0, 5.0], &[0.3, -0.2, 0.1, 1.0, 2.0, -3.0]);
        let p = [1.0, 7.0, 3.5];
        let q = r.apply(&p);
        assert!(close(&r.inverse().apply(&q), &p, 1e-9));
        assert!(!r.is_identity(1e-9));
    }

    #[test]
    fn test_planar_rotation_keeps_z() {
        let r = RigidTransform::from_parameters(
            true,
            [0.0, 0.0, 0.0],
            &[std::f64::consts::FRAC_PI_2, 0.0, 0.0],
        );
        let q = r.apply(&[3.0, 1.0, 0.0]);
        assert!(close(&q, &[3.0, 0.0, 1.0], 1e-12));
    }

    #[test]
    fn test_bspline_partition_of_unity() {
        let grid = BSplineGrid::new((1, 21, 31), 4, true);
        assert_eq!(grid.nodes, [1, 7, 7]);
        assert_eq!(grid.n_params(), 98);
        for p in [[0.0, 0.0, 0.0], [0.0, 20.0, 30.0], [0.0, 7.3, 12.9]] {
            let s: f64 = grid.weights(&p).iter().map(|(_, w)| w).sum();
            assert!((s - 1.0).abs() < 1e-12);
        }

        // 所有系数相等 => 平移.
        let n = grid.len();
        let mut coefficients = vec![0.0; grid.n_params()];
        coefficients[n..].fill(2.0);
        let t = Transform::BSpline(BSplineTransform { grid, coefficients });
        let q = t.apply(&[0.0, 4.0, 4.0]);
        assert!(close(&q, &[0.0, 4.0, 6.0], 1e-9));
        let back = t.inverse().apply(&q);
        assert!(close(&back, &[0.0, 4.0, 4.0], 1e-6));
    }

    #[test]
    fn test_identity() {
        let t = Transform::identity(true, [0.0, 10.0, 10.0]);
        assert!(t.is_identity(1e-12));
        assert!(t.inverse().is_identity(1e-12));
        assert_eq!(t.apply(&[0.0, 2.0, 3.0]), [0.0, 2.0, 3.0]);
    }
}
