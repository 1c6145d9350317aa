//! 粗对齐之后的微调.
//!
//! 候选变换为绕 "过 bregma 且平行于 y 轴" 的轴的小角度旋转 `atan(k / half_width)`
//! 与整数 x 平移的组合, `k` 与平移均在 `[-deviation, deviation]` 内.
//! 评分是按 z 分带的左右不平衡度之和, 越小越好.

use log::debug;
use ndarray::{Array2, ArrayView3, Axis};

use super::rotation::{roll, RigidMap};
use crate::consts::is_foreground;
use crate::{Idx3d, Vec3};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelIterator, ParallelIterator};
    }
}

/// 评分使用的 z 分带个数.
const BANDS: usize = 8;

/// 一个候选变换.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Candidate {
    /// 旋转步数 `k`, 角度为 `atan(k / half_width)`.
    pub k: i32,

    /// x 方向整数平移.
    pub dx: i32,

    /// 旋转角 (弧度).
    pub angle: f64,

    /// 分带不平衡度之和.
    pub score: f64,
}

/// 分割沿 y 方向的前景投影 `(z, x) -> 体素个数`.
fn zx_projection(seg: &ArrayView3<u32>) -> Array2<f64> {
    let (d, _, w) = seg.dim();
    let mut proj = Array2::<f64>::zeros((d, w));
    for (z, sli) in seg.axis_iter(Axis(0)).enumerate() {
        for ((_, x), v) in sli.indexed_iter() {
            if is_foreground(*v) {
                proj[(z, x)] += 1.0;
            }
        }
    }
    proj
}

/// 对一个旋转角, 计算所有 x 平移下的评分.
fn score_angle(
    proj: &Array2<f64>,
    pivot: &Vec3,
    angle: f64,
    deviation: i32,
) -> Vec<(i32, f64)> {
    let (d, w) = proj.dim();
    let mid = (w as f64 - 1.0) / 2.0;
    let r = roll(angle);
    let m = r.matrix();
    let n_shift = (2 * deviation + 1) as usize;

    // [shift][band] -> (left, right)
    let mut acc = vec![[(0.0f64, 0.0f64); BANDS]; n_shift];
    for ((z, x), c) in proj.indexed_iter() {
        if *c == 0.0 {
            continue;
        }
        let (rz, rx) = (z as f64 - pivot[0], x as f64 - pivot[2]);
        // 只有 z 与 x 分量参与, y 分量不影响.
        let nz = m[(0, 0)] * rz + m[(0, 2)] * rx + pivot[0];
        let nx = m[(2, 0)] * rz + m[(2, 2)] * rx + pivot[2];
        let band = ((nz / d as f64 * BANDS as f64).floor().max(0.0) as usize).min(BANDS - 1);
        for (s, slot) in acc.iter_mut().enumerate() {
            let rel = nx + (s as i32 - deviation) as f64 - mid;
            let entry = &mut slot[band];
            if rel < 0.0 {
                entry.0 += c;
            } else if rel > 0.0 {
                entry.1 += c;
            } else {
                entry.0 += c / 2.0;
                entry.1 += c / 2.0;
            }
        }
    }

    acc.iter()
        .enumerate()
        .map(|(s, bands)| {
            let score = bands.iter().map(|(l, r)| (l - r).abs()).sum();
            (s as i32 - deviation, score)
        })
        .collect()
}

/// 在窗口内搜索最佳候选. 平分时优先选择离恒等变换最近的.
pub fn search(seg: &ArrayView3<u32>, bregma: &Idx3d, deviation: u32) -> Candidate {
    let proj = zx_projection(seg);
    let w = proj.len_of(Axis(1));
    let half_width = ((w as f64 - 1.0) / 2.0).max(1.0);
    let deviation = deviation as i32;
    let pivot = [bregma.0 as f64, bregma.1 as f64, bregma.2 as f64];

    let ks: Vec<i32> = (-deviation..=deviation).collect();
    let per_k = |k: i32| -> Vec<Candidate> {
        let angle = (k as f64 / half_width).atan();
        score_angle(&proj, &pivot, angle, deviation)
            .into_iter()
            .map(|(dx, score)| Candidate {
                k,
                dx,
                angle,
                score,
            })
            .collect()
    };

    #[cfg(feature = "rayon")]
    let mut all: Vec<Candidate> = ks.into_par_iter().flat_map_iter(per_k).collect();

    #[cfg(not(feature = "rayon"))]
    let mut all: Vec<Candidate> = ks.into_iter().flat_map(per_k).collect();

    all.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then((a.k.abs() + a.dx.abs()).cmp(&(b.k.abs() + b.dx.abs())))
            .then(a.k.cmp(&b.k))
            .then(a.dx.cmp(&b.dx))
    });
    let best = all[0];
    debug!(
        "Fine-tune searched {} candidates, best k = {}, dx = {}, score = {:.1}",
        all.len(),
        best.k,
        best.dx,
        best.score
    );
    best
}

impl Candidate {
    /// 候选对应的刚性映射: 绕过 `bregma` 平行于 y 的轴旋转, 再沿 x 平移.
    pub fn map(&self, bregma: &Idx3d) -> RigidMap {
        let pivot = [bregma.0 as f64, bregma.1 as f64, bregma.2 as f64];
        RigidMap::about(&roll(self.angle), &pivot, &[0.0, 0.0, self.dx as f64])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array3};

    #[test]
    fn test_shift_recenters_slab() {
        // w = 21, mid = 10; 板块位于 x ∈ [3, 15], 中心 9, 需要 +1 平移.
        let mut seg = Array3::<u32>::zeros((8, 6, 21));
        seg.slice_mut(s![.., .., 3..16]).fill(1);
        let best = search(&seg.view(), &(4, 1, 9), 3);
        assert_eq!(best.dx, 1);
        assert_eq!(best.k, 0);
        assert_eq!(best.score, 0.0);
    }

    #[test]
    fn test_symmetric_volume_keeps_identity() {
        let mut seg = Array3::<u32>::zeros((8, 6, 21));
        seg.slice_mut(s![2..6, .., 5..16]).fill(3);
        let best = search(&seg.view(), &(4, 1, 10), 5);
        assert_eq!((best.k, best.dx), (0, 0));
        assert_eq!(best.map(&(4, 1, 10)), RigidMap::about(&roll(0.0), &[4.0, 1.0, 10.0], &[0.0; 3]));
    }
}
