//! 左右半球成对数值.

use std::ops::{Add, Mul, Sub};

use itertools::izip;
use num::Float;

use crate::consts::Side;
use crate::Vec3;

/// 左右成对的数值, 例如左右半球的质心或体积.
///
/// 两侧总是同时存在. 空的一侧用 `0` (体积) 或 `NaN` (质心) 表示, 而不是被省略.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LrPair<T> {
    /// 左侧 (`x` 较小).
    pub left: T,

    /// 右侧 (`x` 较大).
    pub right: T,
}

/// 构造 `LrPair`.
#[inline]
pub const fn lr_pair<T>(left: T, right: T) -> LrPair<T> {
    LrPair { left, right }
}

impl<T> LrPair<T> {
    /// 按侧获取.
    #[inline]
    pub fn get(&self, side: Side) -> &T {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    /// 对两侧分别施加 `f`.
    #[inline]
    pub fn map<U, F: FnMut(T) -> U>(self, mut f: F) -> LrPair<U> {
        LrPair {
            left: f(self.left),
            right: f(self.right),
        }
    }

    /// 两侧逐一组合.
    #[inline]
    pub fn zip_with<U, V, F: FnMut(T, U) -> V>(self, other: LrPair<U>, mut f: F) -> LrPair<V> {
        LrPair {
            left: f(self.left, other.left),
            right: f(self.right, other.right),
        }
    }

    /// 以数组形式获取 `[left, right]`.
    #[inline]
    pub fn into_array(self) -> [T; 2] {
        [self.left, self.right]
    }
}

impl<T: Add<Output = T>> Add for LrPair<T> {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self::Output {
        self.zip_with(rhs, |a, b| a + b)
    }
}

impl<T: Sub<Output = T>> Sub for LrPair<T> {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.zip_with(rhs, |a, b| a - b)
    }
}

impl Mul<f64> for LrPair<f64> {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: f64) -> Self::Output {
        self.map(|v| v * rhs)
    }
}

impl Mul<f64> for LrPair<Vec3> {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: f64) -> Self::Output {
        self.map(|v| v.map(|c| c * rhs))
    }
}

/// 逐分量相乘, 用于体素坐标到物理坐标的换算.
impl Mul<Vec3> for LrPair<Vec3> {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: Vec3) -> Self::Output {
        self.map(|v| mul3(&v, &rhs))
    }
}

/// 三维向量逐分量相乘.
#[inline]
pub fn mul3(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] * b[0], a[1] * b[1], a[2] * b[2]]
}

/// 左右两侧的摘要统计量.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PairStats<T> {
    /// 均值.
    pub mean: T,

    /// 标准差.
    pub std: T,

    /// 标准误差.
    pub ste: T,
}

/// 对一对标量计算统计量. 只考虑有限值:
///
/// 1. 两侧均有限: 均值, 自由度修正为 `ddof` 的样本标准差, `std / sqrt(2)`;
/// 2. 只有一侧有限: 该值, `0`, `0`;
/// 3. 两侧均非有限: 全为 `NaN`.
fn scalar_stats<T: Float>(left: T, right: T, ddof: u32) -> PairStats<T> {
    let nan = PairStats {
        mean: T::nan(),
        std: T::nan(),
        ste: T::nan(),
    };
    let finite: Vec<T> = [left, right].into_iter().filter(|v| v.is_finite()).collect();
    match finite.as_slice() {
        [] => nan,
        [v] => PairStats {
            mean: *v,
            std: T::zero(),
            ste: T::zero(),
        },
        values => {
            let (Some(n), Some(ddof)) = (T::from(values.len()), T::from(ddof)) else {
                return nan;
            };
            let mean = values.iter().fold(T::zero(), |acc, v| acc + *v) / n;
            let dof = n - ddof;
            let std = if dof > T::zero() {
                (values
                    .iter()
                    .fold(T::zero(), |acc, v| acc + (*v - mean).powi(2))
                    / dof)
                    .sqrt()
            } else {
                T::nan()
            };
            PairStats {
                mean,
                std,
                ste: std / n.sqrt(),
            }
        }
    }
}

impl LrPair<f64> {
    /// 左右两侧统计量. 见 [`scalar_stats`] 的取值规则.
    pub fn stats(&self, ddof: u32) -> PairStats<f64> {
        scalar_stats(self.left, self.right, ddof)
    }

    /// 两侧之和 (非有限值视为 0).
    #[inline]
    pub fn total(&self) -> f64 {
        [self.left, self.right]
            .into_iter()
            .filter(|v| v.is_finite())
            .sum()
    }
}

impl LrPair<Vec3> {
    /// 逐分量的左右统计量.
    pub fn stats(&self, ddof: u32) -> PairStats<Vec3> {
        let mut ans = PairStats {
            mean: [0.0; 3],
            std: [0.0; 3],
            ste: [0.0; 3],
        };
        for (i, (l, r)) in izip!(self.left, self.right).enumerate() {
            let s = scalar_stats(l, r, ddof);
            (ans.mean[i], ans.std[i], ans.ste[i]) = (s.mean, s.std, s.ste);
        }
        ans
    }
}
