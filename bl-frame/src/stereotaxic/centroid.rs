//! 质心计算: 平均质心, 内核质心与形状质心.

use std::collections::HashSet;
use std::mem;

use ordered_float::OrderedFloat;

use super::{idx3d_to_u16, idx3du16_to_usize, try_idx3d_to_u16};
use crate::{Idx3d, Idx3dU16, SegVolume, Vec3};

/// 平均质心. 空集合返回 `NaN`.
pub(crate) fn mean_centroid(voxels: &[Idx3d]) -> Vec3 {
    if voxels.is_empty() {
        return [f64::NAN; 3];
    }
    let n = voxels.len() as f64;
    let sum = voxels.iter().fold([0.0; 3], |acc, (z, y, x)| {
        [acc[0] + *z as f64, acc[1] + *y as f64, acc[2] + *x as f64]
    });
    sum.map(|s| s / n)
}

/// 形状质心: 集合中与平均质心物理距离最近的体素. 距离相同时取索引最小者.
pub(crate) fn shape_centroid(voxels: &[Idx3d], mean: &Vec3, voxel_size: &Vec3) -> Vec3 {
    let dist = |(z, y, x): &Idx3d| {
        let d = [
            (*z as f64 - mean[0]) * voxel_size[0],
            (*y as f64 - mean[1]) * voxel_size[1],
            (*x as f64 - mean[2]) * voxel_size[2],
        ];
        OrderedFloat(d.iter().map(|v| v * v).sum::<f64>())
    };
    voxels
        .iter()
        .min_by_key(|p| (dist(p), **p))
        .map_or([f64::NAN; 3], |(z, y, x)| [*z as f64, *y as f64, *x as f64])
}

/// 逐层腐蚀所需维护的数据结构集合.
struct ErosionMemento {
    alive: HashSet<Idx3dU16>,
    surf1: HashSet<Idx3dU16>,
    surf2: HashSet<Idx3dU16>,
}

impl ErosionMemento {
    /// 初始化: 所有体素存活, 表面为至少有一个 6-邻居不在集合内的体素.
    fn new(seg: &SegVolume, voxels: &[Idx3d]) -> Self {
        let alive: HashSet<Idx3dU16> = voxels.iter().map(idx3d_to_u16).collect();
        let surf1 = voxels
            .iter()
            .filter(|p| {
                let n = seg.diamond_neighbours(**p);
                n.len() < 6
                    || n.iter().any(|q| {
                        try_idx3d_to_u16(q).map_or(true, |k| !alive.contains(&k))
                    })
            })
            .map(idx3d_to_u16)
            .collect();
        Self {
            alive,
            surf1,
            surf2: HashSet::new(),
        }
    }

    /// 剥掉当前表面, 并把新暴露的体素作为下一层表面.
    fn step(&mut self, seg: &SegVolume) {
        let surf = mem::take(&mut self.surf1);
        for p in surf.iter() {
            self.alive.remove(p);
        }
        for p in surf.iter().map(idx3du16_to_usize) {
            for key in seg
                .diamond_neighbours(p)
                .iter()
                .filter_map(try_idx3d_to_u16)
            {
                if self.alive.contains(&key) {
                    self.surf2.insert(key);
                }
            }
        }
        mem::swap(&mut self.surf1, &mut self.surf2);
    }
}

/// 内核掩膜: 反复剥去 6-邻域表面, 直到再剥一层就会少于 `fraction * n` 个体素 (或为空) 为止.
/// 结果按行优先顺序排列.
pub(crate) fn inner_mask(seg: &SegVolume, voxels: &[Idx3d], fraction: f64) -> Vec<Idx3d> {
    if voxels.is_empty() {
        return vec![];
    }
    let keep = fraction * voxels.len() as f64;
    let mut db = ErosionMemento::new(seg, voxels);
    loop {
        let remain = db.alive.len() - db.surf1.len();
        if remain == 0 || (remain as f64) < keep {
            break;
        }
        db.step(seg);
    }
    let mut ans: Vec<Idx3d> = db.alive.iter().map(idx3du16_to_usize).collect();
    ans.sort_unstable();
    ans
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array3};

    fn cube(side: usize) -> (SegVolume, Vec<Idx3d>) {
        let n = side + 4;
        let mut data = Array3::<u32>::zeros((n, n, n));
        data.slice_mut(s![2..2 + side, 2..2 + side, 2..2 + side]).fill(1);
        let seg = SegVolume::from_array(data, [1.0; 3]);
        let vox = seg.filter_pos(|v| v == 1);
        (seg, vox)
    }

    #[test]
    fn test_mean_and_shape() {
        let (_, vox) = cube(3);
        assert_eq!(mean_centroid(&vox), [3.0; 3]);
        assert_eq!(shape_centroid(&vox, &[3.0; 3], &[1.0; 3]), [3.0; 3]);
        assert!(mean_centroid(&[]).iter().all(|v| v.is_nan()));

        // 平均质心落在集合外时, 取最近的体素
        let ring = vec![(0, 0, 0), (0, 0, 4), (0, 1, 2)];
        let mean = mean_centroid(&ring);
        assert_eq!(shape_centroid(&ring, &mean, &[1.0; 3]), [0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_inner_mask_peels_layers() {
        // 5^3 = 125, 剥一层剩 27, 再剥一层剩 1
        let (seg, vox) = cube(5);
        let inner = inner_mask(&seg, &vox, 0.2);
        assert_eq!(inner.len(), 27);
        let inner = inner_mask(&seg, &vox, 0.0);
        assert_eq!(inner, vec![(4, 4, 4)]);
        let inner = inner_mask(&seg, &vox, 0.25);
        assert_eq!(inner.len(), 125);
    }

    #[test]
    fn test_inner_mask_small_sets() {
        let (seg, _) = cube(1);
        assert_eq!(inner_mask(&seg, &[(2, 2, 2)], 0.25), vec![(2, 2, 2)]);
        assert!(inner_mask(&seg, &[], 0.25).is_empty());
    }
}
