//! 体数据插值. 坐标均为 `(z, y, x)` 体素坐标, 数据范围外读作 `0`.

use ndarray::{Array3, ArrayView3, Axis};

use super::config::Interpolator;
use crate::Vec3;

impl Interpolator {
    /// 在连续坐标 `p` 处对 `img` 插值.
    #[inline]
    pub fn sample(&self, img: &ArrayView3<f32>, p: &Vec3) -> f32 {
        match self {
            Self::Linear => sample_linear(img, p),
            Self::Nearest => sample_nearest(img, p),
        }
    }
}

/// 最近邻插值. 对标签数据同样适用, 越界读作 `T::default()`.
pub(crate) fn sample_nearest<T: Copy + Default>(img: &ArrayView3<T>, p: &Vec3) -> T {
    let (d, h, w) = img.dim();
    let [z, y, x] = p.map(f64::round);
    if z < 0.0 || y < 0.0 || x < 0.0 {
        return T::default();
    }
    let (z, y, x) = (z as usize, y as usize, x as usize);
    if z < d && y < h && x < w {
        img[(z, y, x)]
    } else {
        T::default()
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
    }
}

/// 在形状为 `shape` 的网格上逐体素求值 `f((z, y, x))`.
/// 启用 `rayon` 时按水平切片并行.
pub(crate) fn fill_grid<T, F>(shape: (usize, usize, usize), f: F) -> Array3<T>
where
    T: Clone + Default + Send + Sync,
    F: Fn(&Vec3) -> T + Sync,
{
    let mut out = Array3::<T>::from_elem(shape, T::default());

    #[cfg(feature = "rayon")]
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(z, mut sli)| {
            sli.indexed_iter_mut()
                .for_each(|((y, x), v)| *v = f(&[z as f64, y as f64, x as f64]));
        });

    #[cfg(not(feature = "rayon"))]
    out.indexed_iter_mut()
        .for_each(|((z, y, x), v)| *v = f(&[z as f64, y as f64, x as f64]));

    out
}

/// 三线性插值. 越界的角点按 `0` 参与插值.
pub(crate) fn sample_linear(img: &ArrayView3<f32>, p: &Vec3) -> f32 {
    let (d, h, w) = img.dim();
    let [z, y, x] = *p;
    // 完全在数据外
    if z <= -1.0 || y <= -1.0 || x <= -1.0 || z >= d as f64 || y >= h as f64 || x >= w as f64 {
        return 0.0;
    }
    let (z0, y0, x0) = (z.floor(), y.floor(), x.floor());
    let (tz, ty, tx) = (z - z0, y - y0, x - x0);
    let (z0, y0, x0) = (z0 as isize, y0 as isize, x0 as isize);

    let fetch = |zz: isize, yy: isize, xx: isize| -> f64 {
        if zz < 0 || yy < 0 || xx < 0 {
            return 0.0;
        }
        let (zz, yy, xx) = (zz as usize, yy as usize, xx as usize);
        if zz < d && yy < h && xx < w {
            img[(zz, yy, xx)] as f64
        } else {
            0.0
        }
    };

    let mut acc = 0.0;
    for (dz, wz) in [(0, 1.0 - tz), (1, tz)] {
        if wz == 0.0 {
            continue;
        }
        for (dy, wy) in [(0, 1.0 - ty), (1, ty)] {
            if wy == 0.0 {
                continue;
            }
            for (dx, wx) in [(0, 1.0 - tx), (1, tx)] {
                if wx == 0.0 {
                    continue;
                }
                acc += wz * wy * wx * fetch(z0 + dz, y0 + dy, x0 + dx);
            }
        }
    }
    acc as f32
}

/// 线性插值图像在 `p` 处的梯度 (中心差分). 深度为 1 的轴梯度恒为 `0`.
pub(crate) fn gradient_linear(img: &ArrayView3<f32>, p: &Vec3) -> Vec3 {
    const H: f64 = 0.5;
    let dims = {
        let (d, h, w) = img.dim();
        [d, h, w]
    };
    let mut g = [0.0; 3];
    for axis in 0..3 {
        if dims[axis] <= 1 {
            continue;
        }
        let mut lo = *p;
        let mut hi = *p;
        lo[axis] -= H;
        hi[axis] += H;
        g[axis] = (sample_linear(img, &hi) as f64 - sample_linear(img, &lo) as f64) / (2.0 * H);
    }
    g
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_on_ramp() {
        let img = Array3::from_shape_fn((1, 4, 5), |(_, _, x)| x as f32);
        let v = img.view();
        assert!((sample_linear(&v, &[0.0, 1.0, 2.25]) - 2.25).abs() < 1e-6);
        assert!((sample_linear(&v, &[0.0, 3.0, 4.0]) - 4.0).abs() < 1e-6);
        assert_eq!(sample_linear(&v, &[0.0, 1.0, 7.0]), 0.0);

        let g = gradient_linear(&v, &[0.0, 1.5, 2.0]);
        assert_eq!(g[0], 0.0);
        assert!(g[1].abs() < 1e-6);
        assert!((g[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_nearest_rounds() {
        let img = Array3::from_shape_fn((2, 2, 2), |(z, y, x)| (z * 4 + y * 2 + x) as f32);
        let v = img.view();
        assert_eq!(sample_nearest(&v, &[0.6, 0.4, 0.51]), 5.0);
        assert_eq!(sample_nearest(&v, &[-0.6, 0.0, 0.0]), 0.0);
        assert_eq!(Interpolator::Nearest.sample(&v, &[1.0, 1.0, 1.0]), 7.0);

        let labels = Array3::from_shape_fn((1, 3, 3), |(_, y, x)| (y * 3 + x) as u32);
        assert_eq!(sample_nearest(&labels.view(), &[0.0, 1.2, 1.7]), 5);
        assert_eq!(sample_nearest(&labels.view(), &[0.0, 3.6, 0.0]), 0);
    }

    #[test]
    fn test_fill_grid() {
        let g = fill_grid((2, 3, 4), |p| (p[0] * 100.0 + p[1] * 10.0 + p[2]) as u32);
        assert_eq!(g[(1, 2, 3)], 123);
        assert_eq!(g[(0, 0, 0)], 0);

        // 切片数多于线程数时与逐点求值一致
        let img = Array3::from_shape_fn((17, 5, 6), |(z, y, x)| (z * 30 + y * 6 + x) as f32);
        let v = img.view();
        let g = fill_grid(img.dim(), |p| sample_linear(&v, &[p[0], p[1], p[2] + 0.5]));
        for ((z, y, x), &got) in g.indexed_iter() {
            let want = sample_linear(&v, &[z as f64, y as f64, x as f64 + 0.5]);
            assert_eq!(got, want);
        }
    }
}
