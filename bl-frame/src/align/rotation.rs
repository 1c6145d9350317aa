//! 体数据刚性旋转与重采样.

use std::f64::consts::PI;

use log::warn;
use nalgebra::{Matrix3, Rotation3, Unit, Vector3};

use crate::registrator::transform::{from_vector, to_vector};
use crate::registrator::{fill_grid, sample_linear, sample_nearest};
use crate::{Idx3d, NiftiHeaderAttr, SubjectVolumes, Vec3};

/// 刚性映射. `pull` 把输出网格上的点映射回输入体数据 (用于重采样),
/// `push` 把输入中的点映射到输出 (用于标志点).
#[derive(Clone, Debug, PartialEq)]
pub struct RigidMap {
    /// 输出 -> 输入 的线性部分.
    pub matrix: Matrix3<f64>,

    /// 输出 -> 输入 的平移部分.
    pub offset: Vec3,
}

impl RigidMap {
    /// 恒等映射.
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
            offset: [0.0; 3],
        }
    }

    /// 以 `pivot` 为中心施加旋转 `rotation`, 然后平移 `shift`:
    /// `push(p) = R (p - pivot) + pivot + shift`.
    pub fn about(rotation: &Rotation3<f64>, pivot: &Vec3, shift: &Vec3) -> Self {
        let rt = rotation.matrix().transpose();
        let pivot = to_vector(pivot);
        let offset = pivot - rt * (pivot + to_vector(shift));
        Self {
            matrix: rt,
            offset: from_vector(&offset),
        }
    }

    /// 输出 -> 输入.
    #[inline]
    pub fn pull(&self, p: &Vec3) -> Vec3 {
        from_vector(&(self.matrix * to_vector(p) + to_vector(&self.offset)))
    }

    /// 输入 -> 输出.
    #[inline]
    pub fn push(&self, p: &Vec3) -> Vec3 {
        from_vector(&(self.matrix.transpose() * (to_vector(p) - to_vector(&self.offset))))
    }

    /// 复合: 先 `self`, 再 `then` (按 `push` 方向).
    pub fn then(&self, then: &RigidMap) -> Self {
        // pull_total(o) = self.pull(then.pull(o))
        let matrix = self.matrix * then.matrix;
        let offset = self.matrix * to_vector(&then.offset) + to_vector(&self.offset);
        Self {
            matrix,
            offset: from_vector(&offset),
        }
    }

    /// 变换并取整一个标志点. 越界时截断到体数据内并输出 `warn`.
    pub fn push_landmark(&self, name: &str, p: &Idx3d, shape: Idx3d) -> Idx3d {
        let q = self.push(&[p.0 as f64, p.1 as f64, p.2 as f64]);
        let dims = [shape.0, shape.1, shape.2];
        let mut out = [0usize; 3];
        let mut clamped = false;
        for axis in 0..3 {
            let r = q[axis].round();
            let max = dims[axis].saturating_sub(1) as f64;
            let c = r.clamp(0.0, max);
            clamped |= c != r;
            out[axis] = c as usize;
        }
        if clamped {
            warn!("Landmark `{name}` left the volume at {q:?}, clamped to {out:?}.");
        }
        (out[0], out[1], out[2])
    }
}

/// 求把单位向量 `from` 转到 `to` 的旋转. 两者平行时为恒等, 反向时绕 z 轴转 180°.
pub fn rotation_onto(from: &Vec3, to: &Vec3) -> Rotation3<f64> {
    let (a, b) = (to_vector(from), to_vector(to));
    if a.norm() == 0.0 || b.norm() == 0.0 {
        warn!("Degenerate rotation request from {from:?} to {to:?}, using identity.");
        return Rotation3::identity();
    }
    let (a, b) = (a.normalize(), b.normalize());
    match Rotation3::rotation_between(&a, &b) {
        Some(r) => r,
        // 分量顺序为 (z, y, x), 因此 nalgebra 的第 0 轴就是 z 轴.
        None => Rotation3::from_axis_angle(&Vector3::x_axis(), PI),
    }
}

/// 绕平行于 y 轴 (分量 1) 的轴转 `angle`.
#[inline]
pub fn roll(angle: f64) -> Rotation3<f64> {
    Rotation3::from_axis_angle(&Unit::new_unchecked(Vector3::new(0.0, 1.0, 0.0)), angle)
}

/// 用映射 `map` 重采样三模态体数据: 强度线性插值, 分割最近邻.
/// 输出形状与输入相同.
pub fn resample_volumes(volumes: &SubjectVolumes, map: &RigidMap) -> SubjectVolumes {
    let shape = volumes.shape();
    let mri = volumes.mri.data();
    let ct = volumes.micro_ct.data();
    let seg = volumes.segmentation.data();

    let mri = fill_grid(shape, |p| sample_linear(&mri, &map.pull(p)));
    let ct = fill_grid(volumes.micro_ct.shape(), |p| sample_linear(&ct, &map.pull(p)));
    let seg = fill_grid(volumes.segmentation.shape(), |p| {
        sample_nearest(&seg, &map.pull(p))
    });

    SubjectVolumes {
        mri: volumes.mri.with_data(mri),
        micro_ct: volumes.micro_ct.with_data(ct),
        segmentation: volumes.segmentation.with_data(seg),
    }
}

/// 只重采样分割 (最近邻).
pub fn resample_segmentation(volumes: &SubjectVolumes, map: &RigidMap) -> ndarray::Array3<u32> {
    let seg = volumes.segmentation.data();
    fill_grid(volumes.segmentation.shape(), |p| {
        sample_nearest(&seg, &map.pull(p))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &Vec3, b: &Vec3) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn test_rotation_onto() {
        let r = rotation_onto(&[0.0, 0.6, 0.8], &[0.0, 1.0, 0.0]);
        let v = r * Vector3::new(0.0, 0.6, 0.8);
        assert!(close(&from_vector(&v), &[0.0, 1.0, 0.0]));

        let r = rotation_onto(&[0.0, -1.0, 0.0], &[0.0, 1.0, 0.0]);
        let v = r * Vector3::new(0.0, -1.0, 0.0);
        assert!(close(&from_vector(&v), &[0.0, 1.0, 0.0]));

        let r = rotation_onto(&[0.0, 1.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!((r.matrix() - Matrix3::identity()).abs().max() < 1e-12);
    }

    #[test]
    fn test_map_pull_push_inverse() {
        let m = RigidMap::about(&roll(0.3), &[10.0, 5.0, 7.0], &[0.0, 0.0, 2.0]);
        let p = [3.0, 4.0, 5.0];
        assert!(close(&m.pull(&m.push(&p)), &p));
        // 旋转轴上的点只被平移
        assert!(close(&m.push(&[10.0, 1.0, 7.0]), &[10.0, 1.0, 9.0]));

        let n = RigidMap::about(&rotation_onto(&[0.0, 0.0, 1.0], &[0.0, 1.0, 0.0]), &[1.0; 3], &[0.0; 3]);
        let both = m.then(&n);
        assert!(close(&both.push(&p), &n.push(&m.push(&p))));
        assert!(close(&both.pull(&both.push(&p)), &p));
    }

    #[test]
    fn test_landmark_is_clamped() {
        let m = RigidMap::about(&Rotation3::identity(), &[0.0; 3], &[0.0, 0.0, 5.0]);
        assert_eq!(m.push_landmark("bregma", &(1, 2, 3), (4, 4, 6)), (1, 2, 5));
        assert_eq!(m.push_landmark("bregma", &(1, 2, 0), (4, 4, 6)), (1, 2, 5));
    }
}
