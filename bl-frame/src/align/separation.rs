//! 半球分离度: 前景体素在中线平面 `x = (w - 1) / 2` 两侧的百分比.
//!
//! 每次旋转前后都重新计算, 不做缓存.

use log::info;
use ndarray::{ArrayView3, Axis};

use crate::consts::is_foreground;

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelIterator, ParallelIterator};
    }
}

/// 半球分离度.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Separation {
    /// 左侧 (`x` 较小) 前景百分比.
    pub left: f64,

    /// 右侧 (`x` 较大) 前景百分比.
    pub right: f64,
}

impl Separation {
    /// 两侧百分比之差的绝对值. 越接近 0 说明越平衡.
    #[inline]
    pub fn imbalance(&self) -> f64 {
        (self.left - self.right).abs()
    }

    /// 由两侧 (可带半个体素的) 计数构造. 无前景时两侧均为 `NaN`.
    fn from_counts(left: f64, right: f64) -> Self {
        let total = left + right;
        if total > 0.0 {
            Self {
                left: 100.0 * left / total,
                right: 100.0 * right / total,
            }
        } else {
            Self {
                left: f64::NAN,
                right: f64::NAN,
            }
        }
    }
}

/// 每一列 `x` 上的前景体素个数.
fn column_counts(seg: &ArrayView3<u32>) -> Vec<u64> {
    let w = seg.len_of(Axis(2));
    let count_slice = |sli: ndarray::ArrayView2<u32>| {
        let mut acc = vec![0u64; w];
        for ((_, x), v) in sli.indexed_iter() {
            if is_foreground(*v) {
                acc[x] += 1;
            }
        }
        acc
    };
    let merge = |mut a: Vec<u64>, b: Vec<u64>| {
        a.iter_mut().zip(b).for_each(|(a, b)| *a += b);
        a
    };

    #[cfg(feature = "rayon")]
    let counts = seg
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(count_slice)
        .reduce(|| vec![0u64; w], merge);

    #[cfg(not(feature = "rayon"))]
    let counts = seg
        .axis_iter(Axis(0))
        .map(count_slice)
        .fold(vec![0u64; w], merge);

    counts
}

/// 计算 `seg` 的半球分离度. 恰好位于中线上的体素各计一半.
pub fn separation(seg: &ArrayView3<u32>) -> Separation {
    let counts = column_counts(seg);
    let mid = (counts.len() as f64 - 1.0) / 2.0;
    let (mut left, mut right) = (0.0, 0.0);
    for (x, c) in counts.iter().enumerate() {
        let c = *c as f64;
        let x = x as f64;
        if x < mid {
            left += c;
        } else if x > mid {
            right += c;
        } else {
            left += c / 2.0;
            right += c / 2.0;
        }
    }
    Separation::from_counts(left, right)
}

/// 计算并以 `info` 输出分离度. 若给出 `previous`, 一并输出不平衡度的变化.
pub fn log_separation(
    seg: &ArrayView3<u32>,
    stage: &str,
    previous: Option<&Separation>,
) -> Separation {
    let current = separation(seg);
    match previous {
        Some(prev) => info!(
            "Separation {stage}: left {:.3}%, right {:.3}% (imbalance {:+.3})",
            current.left,
            current.right,
            current.imbalance() - prev.imbalance()
        ),
        None => info!(
            "Separation {stage}: left {:.3}%, right {:.3}%",
            current.left, current.right
        ),
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array3};

    #[test]
    fn test_balanced_and_unbalanced() {
        // w = 5, mid = 2
        let mut seg = Array3::<u32>::zeros((2, 3, 5));
        seg.slice_mut(s![.., .., 1..4]).fill(7);
        let sep = separation(&seg.view());
        assert_eq!(sep.left, 50.0);
        assert_eq!(sep.imbalance(), 0.0);

        seg.slice_mut(s![.., .., 0..1]).fill(7);
        let sep = separation(&seg.view());
        // left: 2 列 + 半列, right: 1 列 + 半列
        assert!((sep.left - 62.5).abs() < 1e-12);
        assert!((sep.right - 37.5).abs() < 1e-12);
    }

    #[test]
    fn test_even_width_and_empty() {
        // w = 4, mid = 1.5, 没有体素恰好在中线上
        let mut seg = Array3::<u32>::zeros((1, 1, 4));
        seg[(0, 0, 1)] = 1;
        seg[(0, 0, 2)] = 1;
        seg[(0, 0, 3)] = 1;
        let sep = separation(&seg.view());
        assert!((sep.left - 100.0 / 3.0).abs() < 1e-12);

        let empty = Array3::<u32>::zeros((1, 2, 2));
        assert!(separation(&empty.view()).left.is_nan());
    }
}
