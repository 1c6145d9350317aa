//! 颅骨表面投影与深度查询.

use ndarray::{Array2, ArrayView3, Axis};

use crate::Idx2d;

/// 给定 `(y, x)`, 在 micro-CT 中查询颅骨表面的 `z`.
pub trait DepthLookup {
    /// 查询失败 (例如整列都是背景) 时返回 `None`.
    fn depth(&self, ct: &ArrayView3<f32>, yx: Idx2d) -> Option<usize>;
}

/// 默认深度查询: 从 `z` 最大处 (背侧) 向下扫描,
/// 返回第一个强度不低于 `fraction * 列最大值` 的体素.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SurfaceDepth {
    /// 相对列最大值的阈值比例, 取值 `(0, 1]`.
    pub fraction: f32,
}

impl SurfaceDepth {
    /// 默认阈值比例.
    pub const DEFAULT_FRACTION: f32 = 0.5;
}

impl Default for SurfaceDepth {
    fn default() -> Self {
        Self {
            fraction: Self::DEFAULT_FRACTION,
        }
    }
}

impl DepthLookup for SurfaceDepth {
    fn depth(&self, ct: &ArrayView3<f32>, (y, x): Idx2d) -> Option<usize> {
        let (_, h, w) = ct.dim();
        if y >= h || x >= w {
            return None;
        }
        let column = ct.slice(ndarray::s![.., y, x]);
        let max = column.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if !(max > 0.0) {
            return None;
        }
        let threshold = max * self.fraction.clamp(f32::EPSILON, 1.0);
        column
            .iter()
            .enumerate()
            .rev()
            .find(|(_, v)| **v >= threshold)
            .map(|(z, _)| z)
    }
}

/// 颅骨表面投影: micro-CT 沿 `z` 的最大强度投影, 形状 `(y, x)`.
pub fn skull_projection(ct: &ArrayView3<f32>) -> Array2<f32> {
    ct.fold_axis(Axis(0), f32::NEG_INFINITY, |m, v| m.max(*v))
        .mapv(|v| if v.is_finite() { v } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_surface_depth_scans_from_top() {
        let mut ct = Array3::<f32>::zeros((10, 2, 2));
        ct[(3, 1, 1)] = 100.0;
        ct[(6, 1, 1)] = 60.0;
        ct[(8, 1, 1)] = 20.0;
        let lookup = SurfaceDepth::default();
        assert_eq!(lookup.depth(&ct.view(), (1, 1)), Some(6));
        assert_eq!(lookup.depth(&ct.view(), (0, 0)), None);
        assert_eq!(lookup.depth(&ct.view(), (5, 0)), None);

        let strict = SurfaceDepth { fraction: 1.0 };
        assert_eq!(strict.depth(&ct.view(), (1, 1)), Some(3));
    }

    #[test]
    fn test_projection_is_max_along_z() {
        let mut ct = Array3::<f32>::zeros((3, 2, 3));
        ct[(0, 0, 0)] = 1.0;
        ct[(2, 0, 0)] = 4.0;
        ct[(1, 1, 2)] = 7.0;
        let proj = skull_projection(&ct.view());
        assert_eq!(proj.dim(), (2, 3));
        assert_eq!(proj[(0, 0)], 4.0);
        assert_eq!(proj[(1, 2)], 7.0);
        assert_eq!(proj[(1, 1)], 0.0);
    }
}
