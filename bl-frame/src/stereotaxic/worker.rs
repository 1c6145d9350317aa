//! 逐脑区的计算任务.

use std::collections::HashMap;

use log::{trace, warn};

use super::centroid::{inner_mask, mean_centroid, shape_centroid};
use super::separate::{
    split_by_components, split_by_plane, Plane, Separated, SeparationMethod, SeparationPolicy,
};
use super::table::{SegmentRecord, SegmentRow};
use super::{StatsError, StatsMode, StatsResult, StereotaxicConfig};
use crate::{Idx3d, LrPair, NiftiHeaderAttr, SegVolume, Vec3, VolumeBounds};

/// 所有任务共享的只读上下文. 在分发前构建一次, 全部任务结束后释放.
#[derive(Debug)]
pub struct WorkerContext<'a> {
    /// 最终的分割体数据.
    pub seg: &'a SegVolume,

    /// 体素尺寸 `[z, y, x]`.
    pub voxel_size: Vec3,

    /// `(bregma, lambda)`.
    pub skull_points: Option<(Idx3d, Idx3d)>,

    /// 质心模式. 只影响日志.
    pub mode: StatsMode,

    /// 分离策略.
    pub policy: SeparationPolicy,

    /// 内核质心的保留比例.
    pub inner_fraction: f64,

    bounds: HashMap<u32, VolumeBounds>,
}

/// 计算时的日志详细程度. 失败重试时使用 `Detailed`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verbosity {
    /// 只输出必要信息.
    Normal,

    /// 以 `trace` 输出每个中间结果.
    Detailed,
}

impl<'a> WorkerContext<'a> {
    /// 一次遍历求出所有标签的包围盒.
    pub fn new(seg: &'a SegVolume, config: &StereotaxicConfig) -> Self {
        #[cfg(feature = "rayon")]
        let bounds = if config.is_parallelized {
            seg.par_label_bounds()
        } else {
            seg.label_bounds()
        };

        #[cfg(not(feature = "rayon"))]
        let bounds = seg.label_bounds();

        Self {
            seg,
            voxel_size: seg.voxel_size(),
            skull_points: config.skull_points,
            mode: config.mode,
            policy: config.policy,
            inner_fraction: config.inner_fraction,
            bounds,
        }
    }

    /// 标签的包围盒.
    #[inline]
    pub fn bounds(&self, label: u32) -> Option<&VolumeBounds> {
        self.bounds.get(&label)
    }

    /// 非中线策略使用的分离平面. 没有颅骨标志点时退回中线.
    fn plane(&self) -> Plane {
        match &self.skull_points {
            Some((bregma, lambda)) => Plane::through(bregma, lambda),
            None => Plane::midline(self.seg.shape().2),
        }
    }

    /// 标签在包围盒内的所有体素 (全局坐标, 行优先顺序).
    fn isolate(&self, label: u32) -> StatsResult<Vec<Idx3d>> {
        let bounds = self.bounds(label).ok_or(StatsError::EmptyLabel(label))?;
        let (z1, y1, x1) = bounds.max;
        if [z1, y1, x1].iter().any(|v| *v > u16::MAX as usize) {
            return Err(StatsError::VolumeTooLarge(self.seg.shape()));
        }
        let (z0, y0, x0) = bounds.min;
        Ok(self
            .seg
            .view_within(bounds)
            .indexed_iter()
            .filter(|(_, v)| **v == label)
            .map(|((z, y, x), _)| (z + z0, y + y0, x + x0))
            .collect())
    }

    /// 按策略分离左右.
    fn separate(&self, voxels: &[Idx3d]) -> Separated {
        let (method, sides) = match self.policy {
            SeparationPolicy::Midline => (
                SeparationMethod::Midline,
                split_by_plane(voxels, &Plane::midline(self.seg.shape().2)),
            ),
            SeparationPolicy::SkullAnchored => {
                (SeparationMethod::Plane, split_by_plane(voxels, &self.plane()))
            }
            SeparationPolicy::Auto => {
                let plane = self.plane();
                match split_by_components(self.seg, voxels, &plane) {
                    Some(sides) => (SeparationMethod::Components, sides),
                    None => (SeparationMethod::Plane, split_by_plane(voxels, &plane)),
                }
            }
        };
        Separated { method, sides }
    }
}

/// 计算单个脑区的质心, 内核掩膜与体积.
pub fn centroid_calculation(
    ctx: &WorkerContext,
    label: u32,
    verbosity: Verbosity,
) -> StatsResult<SegmentRecord> {
    let detailed = verbosity == Verbosity::Detailed;
    let voxels = ctx.isolate(label)?;
    if detailed {
        trace!("[{label}] {} voxels within {:?}", voxels.len(), ctx.bounds(label));
    }

    let Separated { method, sides } = ctx.separate(&voxels);
    if detailed {
        trace!(
            "[{label}] separated by {method}: left {} voxels ({}), right {} voxels ({})",
            sides.left.voxels.len(),
            sides.left.volume,
            sides.right.voxels.len(),
            sides.right.volume
        );
    }
    if sides.left.voxels.is_empty() && sides.right.voxels.is_empty() {
        return Err(StatsError::EmptyLabel(label));
    }

    let mean = LrPair {
        left: mean_centroid(&sides.left.voxels),
        right: mean_centroid(&sides.right.voxels),
    };
    let inner_mask = LrPair {
        left: inner_mask(ctx.seg, &sides.left.voxels, ctx.inner_fraction),
        right: inner_mask(ctx.seg, &sides.right.voxels, ctx.inner_fraction),
    };
    let inner = LrPair {
        left: mean_centroid(&inner_mask.left),
        right: mean_centroid(&inner_mask.right),
    };
    let shape = LrPair {
        left: shape_centroid(&sides.left.voxels, &mean.left, &ctx.voxel_size),
        right: shape_centroid(&sides.right.voxels, &mean.right, &ctx.voxel_size),
    };
    if detailed {
        trace!("[{label}] mean centroid {mean:?}");
        trace!(
            "[{label}] inner mask sizes ({}, {}), inner centroid {inner:?}",
            inner_mask.left.len(),
            inner_mask.right.len()
        );
        trace!("[{label}] shape centroid {shape:?}");
        trace!("[{label}] reporting the {:?} centroid", ctx.mode);
    }

    Ok(SegmentRecord {
        label,
        method,
        voxel_size: ctx.voxel_size,
        mean,
        inner,
        shape,
        volume: LrPair {
            left: sides.left.volume,
            right: sides.right.volume,
        },
        inner_mask,
    })
}

/// 计算一个脑区. 失败时以详细日志重试一次, 仍失败则返回带错误的行.
pub(crate) fn process_label(ctx: &WorkerContext, label: u32) -> SegmentRow {
    let outcome = centroid_calculation(ctx, label, Verbosity::Normal).or_else(|e| {
        warn!("Error processing segment {label}: {e}. Retrying with detailed logging.");
        centroid_calculation(ctx, label, Verbosity::Detailed).map_err(|e| {
            warn!("Segment {label} failed again: {e}");
            e
        })
    });
    SegmentRow { label, outcome }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array3};

    fn config(policy: SeparationPolicy) -> StereotaxicConfig {
        StereotaxicConfig {
            policy,
            ..Default::default()
        }
    }

    #[test]
    fn test_bilateral_label() {
        // w = 11, 中线 x = 5; 标签 2 在两侧对称, 标签 3 只在左侧
        let mut data = Array3::<u32>::zeros((4, 4, 11));
        data.slice_mut(s![1..3, 1..3, 1..3]).fill(2);
        data.slice_mut(s![1..3, 1..3, 8..10]).fill(2);
        data.slice_mut(s![0..1, 0..2, 0..2]).fill(3);
        let seg = SegVolume::from_array(data, [0.1; 3]);

        for policy in [SeparationPolicy::Midline, SeparationPolicy::Auto] {
            let cfg = config(policy);
            let ctx = WorkerContext::new(&seg, &cfg);
            let rec = centroid_calculation(&ctx, 2, Verbosity::Normal).unwrap();
            assert_eq!(rec.volume, LrPair { left: 8.0, right: 8.0 });
            assert_eq!(rec.mean.left, [1.5, 1.5, 1.5]);
            assert_eq!(rec.mean.right, [1.5, 1.5, 8.5]);

            let rec = centroid_calculation(&ctx, 3, Verbosity::Detailed).unwrap();
            assert_eq!(rec.volume.right, 0.0);
            assert!(rec.mean.right.iter().all(|v| v.is_nan()));
            assert!(rec.inner_mask.right.is_empty());
        }

        let cfg = config(SeparationPolicy::Auto);
        let ctx = WorkerContext::new(&seg, &cfg);
        assert_eq!(
            centroid_calculation(&ctx, 2, Verbosity::Normal).unwrap().method,
            SeparationMethod::Components
        );
    }

    #[test]
    fn test_skull_anchored_plane() {
        let mut data = Array3::<u32>::zeros((2, 4, 12));
        data.slice_mut(s![.., .., 2..8]).fill(5);
        let seg = SegVolume::from_array(data, [1.0; 3]);
        let cfg = StereotaxicConfig {
            policy: SeparationPolicy::SkullAnchored,
            skull_points: Some(((1, 0, 4), (1, 3, 4))),
            ..Default::default()
        };
        let ctx = WorkerContext::new(&seg, &cfg);
        let rec = centroid_calculation(&ctx, 5, Verbosity::Normal).unwrap();
        assert_eq!(rec.method, SeparationMethod::Plane);
        // x = 2, 3 在左, x = 4 各半, x = 5..7 在右
        assert_eq!(rec.volume.left, 2.0 * 8.0 + 4.0);
        assert_eq!(rec.volume.right, 3.0 * 8.0 + 4.0);
    }

    #[test]
    fn test_missing_label_becomes_error_row() {
        let seg = SegVolume::from_array(Array3::<u32>::zeros((2, 2, 2)), [1.0; 3]);
        let cfg = StereotaxicConfig::default();
        let ctx = WorkerContext::new(&seg, &cfg);
        let row = process_label(&ctx, 42);
        assert_eq!(row.label, 42);
        assert!(matches!(row.outcome, Err(StatsError::EmptyLabel(42))));
    }
}
