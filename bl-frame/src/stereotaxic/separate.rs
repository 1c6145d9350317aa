//! 单个脑区的左右半球分离.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use super::{idx3d_to_u16, try_idx3d_to_u16};
use crate::consts::COMPONENT_SIDE_RATIO;
use crate::{lr_pair, Idx3d, Idx3dU16, LrPair, SegVolume};

/// 分离策略.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SeparationPolicy {
    /// 按体数据中线 `x = (w - 1) / 2` 切分.
    Midline,

    /// 按过 bregma 与 lambda 的竖直平面切分.
    SkullAnchored,

    /// 所有连通分量都 (几乎) 完整位于平面一侧时按分量整体分配, 否则退回平面切分.
    #[default]
    Auto,
}

/// 实际使用的分离方式, 会写入结果表.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SeparationMethod {
    /// 体数据中线.
    Midline,

    /// 过 bregma 与 lambda 的平面.
    Plane,

    /// 连通分量整体分配.
    Components,
}

impl fmt::Display for SeparationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Midline => "midline",
            Self::Plane => "plane",
            Self::Components => "components",
        };
        f.write_str(s)
    }
}

/// 竖直分离平面. `offset < 0` 为左侧, `> 0` 为右侧, `== 0` 恰在平面上.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Plane {
    Midline { mid: f64 },
    Anchored { y0: f64, x0: f64, slope: f64 },
}

impl Plane {
    /// 宽度为 `width` 的体数据的中线.
    #[inline]
    pub fn midline(width: usize) -> Self {
        Self::Midline {
            mid: (width as f64 - 1.0) / 2.0,
        }
    }

    /// 过 bregma 与 lambda 的平面. 两点 `y` 相同时退化为过 bregma 的 `x = const` 平面.
    pub fn through(bregma: &Idx3d, lambda: &Idx3d) -> Self {
        let dy = lambda.1 as f64 - bregma.1 as f64;
        let dx = lambda.2 as f64 - bregma.2 as f64;
        Self::Anchored {
            y0: bregma.1 as f64,
            x0: bregma.2 as f64,
            slope: if dy == 0.0 { 0.0 } else { dx / dy },
        }
    }

    /// 体素相对平面的有符号 `x` 距离.
    #[inline]
    pub fn offset(&self, &(_, y, x): &Idx3d) -> f64 {
        match *self {
            Self::Midline { mid } => x as f64 - mid,
            Self::Anchored { y0, x0, slope } => x as f64 - (x0 + slope * (y as f64 - y0)),
        }
    }
}

/// 一侧的体素与体积. 恰在平面上的体素两侧都收录, 体积各计一半.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SideVoxels {
    /// 体素坐标, 按行优先顺序.
    pub voxels: Vec<Idx3d>,

    /// 体素个数 (可为半整数).
    pub volume: f64,
}

impl SideVoxels {
    #[inline]
    fn push(&mut self, p: Idx3d, weight: f64) {
        self.voxels.push(p);
        self.volume += weight;
    }
}

/// 分离结果.
#[derive(Clone, Debug)]
pub struct Separated {
    /// 使用的方式.
    pub method: SeparationMethod,

    /// 左右两侧.
    pub sides: LrPair<SideVoxels>,
}

/// 按平面切分.
pub(crate) fn split_by_plane(voxels: &[Idx3d], plane: &Plane) -> LrPair<SideVoxels> {
    let mut sides = lr_pair(SideVoxels::default(), SideVoxels::default());
    for p in voxels.iter() {
        let o = plane.offset(p);
        if o < 0.0 {
            sides.left.push(*p, 1.0);
        } else if o > 0.0 {
            sides.right.push(*p, 1.0);
        } else {
            sides.left.push(*p, 0.5);
            sides.right.push(*p, 0.5);
        }
    }
    sides
}

/// 6-连通分量. 分量按首个体素的出现顺序排列, 分量内为广度优先顺序.
pub(crate) fn components(seg: &SegVolume, voxels: &[Idx3d]) -> Vec<Vec<Idx3d>> {
    let members: HashSet<Idx3dU16> = voxels.iter().map(idx3d_to_u16).collect();
    let mut visited = HashSet::<Idx3dU16>::with_capacity(voxels.len());
    let mut ans = vec![];
    let mut queue = VecDeque::new();

    for start in voxels.iter() {
        if !visited.insert(idx3d_to_u16(start)) {
            continue;
        }
        let mut comp = vec![];
        queue.push_back(*start);
        while let Some(p) = queue.pop_front() {
            comp.push(p);
            for n in seg.diamond_neighbours(p) {
                let Some(key) = try_idx3d_to_u16(&n) else {
                    continue;
                };
                if members.contains(&key) && visited.insert(key) {
                    queue.push_back(n);
                }
            }
        }
        ans.push(comp);
    }
    ans
}

/// 尝试按连通分量整体分配. 只要有一个分量跨越平面 (两侧都不足 95%) 就返回 `None`.
pub(crate) fn split_by_components(
    seg: &SegVolume,
    voxels: &[Idx3d],
    plane: &Plane,
) -> Option<LrPair<SideVoxels>> {
    let mut sides = lr_pair(SideVoxels::default(), SideVoxels::default());
    for comp in components(seg, voxels) {
        let left: f64 = comp
            .iter()
            .map(|p| {
                let o = plane.offset(p);
                if o < 0.0 {
                    1.0
                } else if o > 0.0 {
                    0.0
                } else {
                    0.5
                }
            })
            .sum();
        let frac = left / comp.len() as f64;
        let side = if frac >= COMPONENT_SIDE_RATIO {
            &mut sides.left
        } else if 1.0 - frac >= COMPONENT_SIDE_RATIO {
            &mut sides.right
        } else {
            return None;
        };
        side.volume += comp.len() as f64;
        side.voxels.extend(comp);
    }
    sides.left.voxels.sort_unstable();
    sides.right.voxels.sort_unstable();
    Some(sides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array3};

    fn voxels(seg: &SegVolume, label: u32) -> Vec<Idx3d> {
        seg.filter_pos(|v| v == label)
    }

    #[test]
    fn test_plane_offsets() {
        let p = Plane::midline(5);
        assert_eq!(p.offset(&(0, 0, 2)), 0.0);
        assert_eq!(p.offset(&(0, 0, 0)), -2.0);

        // 斜平面: (y, x) = (0, 2) -> (4, 6)
        let p = Plane::through(&(3, 0, 2), &(3, 4, 6));
        assert_eq!(p.offset(&(0, 2, 4)), 0.0);
        assert_eq!(p.offset(&(0, 2, 3)), -1.0);

        let p = Plane::through(&(3, 2, 7), &(3, 2, 9));
        assert_eq!(p.offset(&(0, 10, 7)), 0.0);
    }

    #[test]
    fn test_split_by_plane_halves_midline() {
        let mut data = Array3::<u32>::zeros((2, 2, 5));
        data.slice_mut(s![.., .., 1..4]).fill(4);
        let seg = SegVolume::from_array(data, [1.0; 3]);
        let sides = split_by_plane(&voxels(&seg, 4), &Plane::midline(5));
        assert_eq!(sides.left.volume, 6.0);
        assert_eq!(sides.right.volume, 6.0);
        assert_eq!(sides.left.voxels.len(), 8);
        assert_eq!(sides.left.volume + sides.right.volume, 12.0);
    }

    #[test]
    fn test_components_assigned_whole() {
        // 两块互不相连的区域, 一块完全在左, 另一块 4/5 在右, 1/5 恰在中线上.
        let mut data = Array3::<u32>::zeros((1, 3, 11));
        data.slice_mut(s![.., .., 0..3]).fill(9);
        data.slice_mut(s![0, 0, 5..10]).fill(9);
        let seg = SegVolume::from_array(data, [1.0; 3]);
        let vox = voxels(&seg, 9);

        let comps = components(&seg, &vox);
        assert_eq!(comps.len(), 2);
        assert_eq!(comps.iter().map(Vec::len).sum::<usize>(), 14);

        // 中线 x = 5: 右侧分量左侧占比 0.1, 不够整体分配
        let plane = Plane::midline(11);
        assert!(split_by_components(&seg, &vox, &plane).is_none());

        // 中线 x = 4.5: 完全分开
        let plane = Plane::Midline { mid: 4.5 };
        let sides = split_by_components(&seg, &vox, &plane).unwrap();
        assert_eq!(sides.left.volume, 9.0);
        assert_eq!(sides.right.volume, 5.0);
    }

    #[test]
    fn test_components_beyond_u16_do_not_wrap() {
        // x = 65536 的邻居不能折回 x = 0
        let mut data = Array3::<u32>::zeros((1, 1, 65537));
        data[(0, 0, 0)] = 4;
        data[(0, 0, 65535)] = 4;
        let seg = SegVolume::from_array(data, [1.0; 3]);

        let comps = components(&seg, &[(0, 0, 65535), (0, 0, 0)]);
        assert_eq!(comps, vec![vec![(0, 0, 65535)], vec![(0, 0, 0)]]);
        assert_eq!(try_idx3d_to_u16(&(0, 0, 65536)), None);
        assert_eq!(try_idx3d_to_u16(&(1, 2, 65535)), Some((1, 2, 65535)));
    }
}
