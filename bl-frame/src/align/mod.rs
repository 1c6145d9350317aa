//! 以 Bregma/Lambda 为基准对齐三模态体数据.
//!
//! 1. 粗对齐: 以体数据中心为旋转中心, 把 `lambda - bregma` 方向转到 `+y`.
//! 2. 微调 (可选): 在小窗口内搜索绕过 bregma 的 y 轴的旋转与 x 平移,
//!    使两半球前景体素尽量均衡.
//!
//! 每一步都会以 `info` 输出半球分离度. 所有函数都不修改输入.

use log::{info, warn};

use crate::consts::CANONICAL_AXIS;
use crate::{Idx3d, NiftiHeaderAttr, SubjectVolumes};

mod fine_tune;
mod rotation;
mod separation;

pub use fine_tune::{search as fine_tune_search, Candidate};
pub use rotation::{resample_segmentation, resample_volumes, roll, rotation_onto, RigidMap};
pub use separation::{log_separation, separation, Separation};

/// `align_to_bl` 的输出.
#[derive(Debug)]
pub struct Aligned {
    /// 对齐后的三模态体数据, 形状与输入相同.
    pub volumes: SubjectVolumes,

    /// 对齐后体数据中的 bregma.
    pub bregma: Idx3d,

    /// 对齐后体数据中的 lambda.
    pub lambda: Idx3d,

    /// 各阶段的分离度, 依次为 `start`, `after BL alignment`, 以及可能的 `after BL fine-tuning`.
    pub separations: Vec<(&'static str, Separation)>,

    /// 从原始体数据到对齐结果的总映射.
    pub map: RigidMap,
}

impl Aligned {
    /// 最后一个阶段的分离度.
    pub fn final_separation(&self) -> Option<&Separation> {
        self.separations.last().map(|(_, s)| s)
    }
}

#[inline]
fn as_vec3(p: &Idx3d) -> crate::Vec3 {
    [p.0 as f64, p.1 as f64, p.2 as f64]
}

/// 对齐三模态体数据, 使 bregma -> lambda 指向 `+y`, 且两半球尽量对称.
///
/// `deviation` 为微调的搜索半径, 为 `0` 时跳过微调.
pub fn align_to_bl(
    volumes: &SubjectVolumes,
    bregma: Idx3d,
    lambda: Idx3d,
    deviation: u32,
) -> Aligned {
    let shape = volumes.shape();
    let mut separations = Vec::with_capacity(3);
    let start = log_separation(&volumes.segmentation.data(), "start", None);
    separations.push(("start", start));

    let (b, l) = (as_vec3(&bregma), as_vec3(&lambda));
    let axis = [l[0] - b[0], l[1] - b[1], l[2] - b[2]];
    if bregma == lambda {
        warn!("Bregma and lambda coincide at {bregma:?}, BL axis is undefined.");
    }
    let center = volumes.segmentation.center();
    let coarse = RigidMap::about(&rotation_onto(&axis, &CANONICAL_AXIS), &center, &[0.0; 3]);

    let coarse_seg = resample_segmentation(volumes, &coarse);
    let after = log_separation(&coarse_seg.view(), "after BL alignment", Some(&start));
    separations.push(("after BL alignment", after));

    let coarse_bregma = coarse.push_landmark("bregma", &bregma, shape);
    let coarse_lambda = coarse.push_landmark("lambda", &lambda, shape);
    info!("Landmarks after BL alignment: bregma {coarse_bregma:?}, lambda {coarse_lambda:?}");

    if deviation == 0 {
        return Aligned {
            volumes: resample_volumes(volumes, &coarse),
            bregma: coarse_bregma,
            lambda: coarse_lambda,
            separations,
            map: coarse,
        };
    }

    let best = fine_tune_search(&coarse_seg.view(), &coarse_bregma, deviation);
    info!(
        "Fine-tune picked roll {:.4}° and shift {} voxel(s)",
        best.angle.to_degrees(),
        best.dx
    );
    let fine = best.map(&coarse_bregma);
    let total = coarse.then(&fine);

    // 从原始体数据一次性重采样, 避免两次插值.
    let aligned = resample_volumes(volumes, &total);
    let tuned = log_separation(
        &aligned.segmentation.data(),
        "after BL fine-tuning",
        Some(&after),
    );
    separations.push(("after BL fine-tuning", tuned));

    let bregma = fine.push_landmark("bregma", &coarse_bregma, shape);
    let lambda = fine.push_landmark("lambda", &coarse_lambda, shape);
    info!("Landmarks after BL fine-tuning: bregma {bregma:?}, lambda {lambda:?}");

    Aligned {
        volumes: aligned,
        bregma,
        lambda,
        separations,
        map: total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ScanVolume, SegVolume};
    use ndarray::Array3;

    fn sphere(c: [f64; 3], r: f64, label: u32, out: &mut Array3<u32>) {
        for ((z, y, x), v) in out.indexed_iter_mut() {
            let d2 = (z as f64 - c[0]).powi(2) + (y as f64 - c[1]).powi(2) + (x as f64 - c[2]).powi(2);
            if d2 <= r * r {
                *v = label;
            }
        }
    }

    fn volumes(seg: Array3<u32>) -> SubjectVolumes {
        let img = seg.mapv(|v| v as f32);
        SubjectVolumes::new(
            ScanVolume::from_array(img.clone(), [0.1; 3]),
            ScanVolume::from_array(img, [0.1; 3]),
            SegVolume::from_array(seg, [0.1; 3]),
        )
    }

    #[test]
    fn test_already_aligned_is_identity() {
        let shape = (21, 21, 21);
        let mut seg = Array3::<u32>::zeros(shape);
        sphere([10.0; 3], 6.0, 1, &mut seg);
        let vols = volumes(seg.clone());

        let out = align_to_bl(&vols, (10, 6, 10), (10, 14, 10), 0);
        assert_eq!(out.bregma, (10, 6, 10));
        assert_eq!(out.lambda, (10, 14, 10));
        assert_eq!(out.volumes.segmentation.data(), seg.view());
        assert_eq!(out.separations.len(), 2);
        assert_eq!(out.final_separation().map(|s| s.imbalance()), Some(0.0));
    }

    #[test]
    fn test_axis_along_x_is_turned_onto_y() {
        let shape = (21, 21, 21);
        let mut seg = Array3::<u32>::zeros(shape);
        sphere([10.0; 3], 5.0, 2, &mut seg);
        let vols = volumes(seg);

        let out = align_to_bl(&vols, (10, 10, 6), (10, 10, 14), 0);
        // 对齐后两点 z, x 相同, lambda 的 y 更大.
        assert_eq!(out.bregma.0, out.lambda.0);
        assert_eq!(out.bregma.2, out.lambda.2);
        assert!(out.lambda.1 > out.bregma.1);
        assert_eq!(out.volumes.shape(), shape);
    }

    #[test]
    fn test_fine_tune_recenters() {
        // 球心偏离中线 2 个体素, 微调应把它移回去.
        let shape = (17, 17, 21);
        let mut seg = Array3::<u32>::zeros(shape);
        sphere([8.0, 8.0, 8.0], 4.0, 3, &mut seg);
        let vols = volumes(seg);

        let out = align_to_bl(&vols, (8, 4, 8), (8, 12, 8), 3);
        assert_eq!(out.separations.len(), 3);
        let sep = out.final_separation().copied().unwrap();
        assert!(sep.imbalance() < 1e-9);
        assert_eq!(out.bregma.2, 10);
        assert_eq!(out.lambda.2, 10);
    }
}
