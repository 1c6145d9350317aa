//! 多分辨率金字塔: 高斯平滑后按整数倍缩小.

use ndarray::{s, Array3, ArrayView3, Axis};

/// 一维归一化高斯核, 半径 `ceil(3σ)`.
fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (3.0 * sigma).ceil() as isize;
    let k: Vec<f64> = (-radius..=radius)
        .map(|i| (-(i * i) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f64 = k.iter().sum();
    k.into_iter().map(|v| v / sum).collect()
}

/// 沿 `axis` 做一维卷积, 边界取最近值.
fn convolve_axis(img: &ArrayView3<f32>, axis: usize, kernel: &[f64]) -> Array3<f32> {
    let radius = (kernel.len() / 2) as isize;
    let n = img.len_of(Axis(axis)) as isize;
    Array3::from_shape_fn(img.dim(), |(z, y, x)| {
        let mut idx = [z, y, x];
        let center = idx[axis] as isize;
        let mut acc = 0.0;
        for (j, w) in kernel.iter().enumerate() {
            let at = (center + j as isize - radius).clamp(0, n - 1);
            idx[axis] = at as usize;
            acc += w * img[(idx[0], idx[1], idx[2])] as f64;
        }
        acc as f32
    })
}

/// 各向同性高斯平滑. `sigma` 以体素为单位; 长度为 1 的轴跳过.
pub fn smooth(img: ArrayView3<f32>, sigma: f64) -> Array3<f32> {
    if sigma <= 0.0 {
        return img.to_owned();
    }
    let kernel = gaussian_kernel(sigma);
    let mut out = img.to_owned();
    for axis in 0..3 {
        if out.len_of(Axis(axis)) > 1 {
            out = convolve_axis(&out.view(), axis, &kernel);
        }
    }
    out
}

/// 每隔 `factor` 个体素取一个. 长度为 1 的轴保持不变.
pub fn shrink(img: ArrayView3<f32>, factor: usize) -> Array3<f32> {
    let f = factor.max(1) as isize;
    let step = |n: usize| if n > 1 { f } else { 1 };
    let (d, h, w) = img.dim();
    img.slice(s![..;step(d), ..;step(h), ..;step(w)]).to_owned()
}

/// 金字塔中的一层.
pub(crate) struct Level {
    pub fixed: Array3<f32>,
    pub moving: Array3<f32>,

    /// 每个轴上的缩小倍数 (长度为 1 的轴为 1).
    pub factor: [f64; 3],
}

/// 构造金字塔各层, 从粗到细.
pub(crate) fn build(
    fixed: ArrayView3<f32>,
    moving: ArrayView3<f32>,
    shrink_factors: &[usize],
    sigmas: &[f64],
) -> Vec<Level> {
    shrink_factors
        .iter()
        .zip(sigmas)
        .map(|(&f, &sigma)| {
            let axis_factor = |n: usize| if n > 1 { f.max(1) as f64 } else { 1.0 };
            let (d, h, w) = fixed.dim();
            Level {
                fixed: shrink(smooth(fixed, sigma).view(), f),
                moving: shrink(smooth(moving, sigma).view(), f),
                factor: [axis_factor(d), axis_factor(h), axis_factor(w)],
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smooth_preserves_constant_and_mass() {
        let img = Array3::<f32>::from_elem((1, 9, 9), 2.0);
        let out = smooth(img.view(), 1.5);
        assert!(out.iter().all(|v| (v - 2.0).abs() < 1e-5));

        let mut spike = Array3::<f32>::zeros((1, 21, 21));
        spike[(0, 10, 10)] = 1.0;
        let out = smooth(spike.view(), 1.0);
        assert!((out.sum() - 1.0).abs() < 1e-4);
        assert!(out[(0, 10, 10)] < 1.0);
        assert_eq!(out.dim(), (1, 21, 21));
    }

    #[test]
    fn test_shrink_keeps_flat_axis() {
        let img = Array3::<f32>::zeros((1, 10, 7));
        assert_eq!(shrink(img.view(), 2).dim(), (1, 5, 4));
        assert_eq!(shrink(img.view(), 1).dim(), (1, 10, 7));
    }
}
