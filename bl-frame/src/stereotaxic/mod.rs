//! 逐脑区立体定位统计.
//!
//! 对分割中的每个标签分离左右半球, 计算平均/内核/形状质心与体积.
//! 标签之间互不依赖: 共享一个只读的 [`WorkerContext`], 启用 `rayon` 时并行计算,
//! 最后按标签排序汇总. 单个标签失败不会影响其他标签.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{info, warn};
use thiserror::Error;

use crate::consts::{DEFAULT_FILE_NAME, DEFAULT_INNER_FRACTION};
use crate::{Idx3d, Idx3dU16, SegVolume};

mod centroid;
mod separate;
mod table;
mod worker;

pub use separate::{Separated, SeparationMethod, SeparationPolicy, SideVoxels};
pub use table::{SegmentRecord, SegmentRow, StereotaxicTable};
pub use worker::{centroid_calculation, Verbosity, WorkerContext};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
    }
}

/// &Idx3d -> Idx3dU16
#[inline]
const fn idx3d_to_u16((z, h, w): &Idx3d) -> Idx3dU16 {
    (*z as u16, *h as u16, *w as u16)
}

/// &Idx3d -> Idx3dU16, 任一分量超出 `u16` 时为 `None`.
#[inline]
fn try_idx3d_to_u16((z, h, w): &Idx3d) -> Option<Idx3dU16> {
    Some((
        u16::try_from(*z).ok()?,
        u16::try_from(*h).ok()?,
        u16::try_from(*w).ok()?,
    ))
}

/// &Idx3dU16 -> Idx3d
#[inline]
const fn idx3du16_to_usize((z, h, w): &Idx3dU16) -> Idx3d {
    (*z as usize, *h as usize, *w as usize)
}

/// 单个脑区的计算错误.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    /// 分割中不存在该标签.
    #[error("Label {0} has no voxel in the segmentation")]
    EmptyLabel(u32),

    /// 坐标超出压缩存储能表示的范围.
    #[error("Volume of shape {0:?} is too large for 16-bit voxel bookkeeping")]
    VolumeTooLarge(Idx3d),
}

/// 单个脑区的计算结果类型.
pub type StatsResult<T> = Result<T, StatsError>;

/// 结果表中报告哪一种质心.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StatsMode {
    /// 全部体素的平均质心.
    #[default]
    FullMean,

    /// 腐蚀后内核的平均质心.
    Inner,

    /// 与平均质心最近的体素.
    Shape,
}

/// 统计配置.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StereotaxicConfig {
    /// 报告的质心.
    pub mode: StatsMode,

    /// 左右分离策略.
    pub policy: SeparationPolicy,

    /// 颅骨标志点 `(bregma, lambda)`, 用于非中线的分离策略.
    pub skull_points: Option<(Idx3d, Idx3d)>,

    /// 内核质心的保留比例.
    pub inner_fraction: f64,

    /// 标准差的自由度修正.
    pub ddof: u32,

    /// 结果文件名 (不含扩展名).
    pub file_name: String,

    /// 批处理时的统一输出目录. 为 `None` 时写入每只小鼠自己的目录.
    pub group_folder: Option<PathBuf>,

    /// 是否并行计算 (需要 `rayon` feature).
    pub is_parallelized: bool,
}

impl Default for StereotaxicConfig {
    fn default() -> Self {
        Self {
            mode: StatsMode::default(),
            policy: SeparationPolicy::default(),
            skull_points: None,
            inner_fraction: DEFAULT_INNER_FRACTION,
            ddof: 1,
            file_name: DEFAULT_FILE_NAME.to_string(),
            group_folder: None,
            is_parallelized: true,
        }
    }
}

/// 结果文件路径: 单独处理时为 `{folder}/{file_name}.csv`,
/// 指定统一目录时为 `{group}/{id 小写}_{file_name}.csv`.
pub fn results_path<P: AsRef<Path>>(
    folder: P,
    subject_id: &str,
    config: &StereotaxicConfig,
) -> PathBuf {
    match &config.group_folder {
        None => folder.as_ref().join(format!("{}.csv", config.file_name)),
        Some(group) => group.join(format!(
            "{}_{}.csv",
            subject_id.to_lowercase(),
            config.file_name
        )),
    }
}

/// 进度计数器. 每完成约 10% 输出一次 `info`.
struct Progress {
    done: AtomicUsize,
    total: usize,
    step: usize,
}

impl Progress {
    fn new(total: usize) -> Self {
        Self {
            done: AtomicUsize::new(0),
            total,
            step: (total / 10).max(1),
        }
    }

    fn tick(&self) {
        let done = self.done.fetch_add(1, Ordering::AcqRel) + 1;
        if done % self.step == 0 || done == self.total {
            info!(
                "Processed {done}/{} segments ({:.0}%)",
                self.total,
                100.0 * done as f64 / self.total as f64
            );
        }
    }
}

/// 计算 `labels` 中每个标签的立体定位统计量, 返回按标签排序的结果表.
///
/// `labels` 中的每个标签恰好对应一行; 计算失败的标签对应一行错误.
pub fn stereotaxic_coordinates(
    seg: &SegVolume,
    labels: &[u32],
    config: &StereotaxicConfig,
) -> StereotaxicTable {
    let ctx = WorkerContext::new(seg, config);
    let progress = Progress::new(labels.len());
    let run = |label: &u32| {
        let row = worker::process_label(&ctx, *label);
        progress.tick();
        row
    };
    info!(
        "Computing stereotaxic statistics for {} segments ({:?}, {:?})",
        labels.len(),
        config.mode,
        config.policy
    );

    #[cfg(feature = "rayon")]
    let rows: Vec<SegmentRow> = if config.is_parallelized {
        labels.par_iter().map(run).collect()
    } else {
        labels.iter().map(run).collect()
    };

    #[cfg(not(feature = "rayon"))]
    let rows: Vec<SegmentRow> = labels.iter().map(run).collect();

    let table = StereotaxicTable::new(rows, config.mode, config.ddof);
    let failed = table.failures().count();
    if failed > 0 {
        warn!("{failed} of {} segments failed", table.len());
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array3};

    #[test]
    fn test_results_path() {
        let mut cfg = StereotaxicConfig::default();
        assert_eq!(
            results_path("/data/P324", "P324", &cfg),
            PathBuf::from("/data/P324/stereotaxic_coordinates.csv")
        );
        cfg.group_folder = Some(PathBuf::from("/out"));
        cfg.file_name = "coords".to_string();
        assert_eq!(
            results_path("/data/P324", "P324", &cfg),
            PathBuf::from("/out/p324_coords.csv")
        );
    }

    #[test]
    fn test_every_label_gets_a_row() {
        let mut data = Array3::<u32>::zeros((6, 6, 9));
        data.slice_mut(s![1..3, 1..3, 1..3]).fill(4);
        data.slice_mut(s![3..5, 3..5, 5..8]).fill(2);
        data[(0, 0, 8)] = 7;
        let seg = SegVolume::from_array(data, [0.05; 3]);

        for is_parallelized in [true, false] {
            let cfg = StereotaxicConfig {
                is_parallelized,
                ..Default::default()
            };
            let table = stereotaxic_coordinates(&seg, &[7, 4, 99, 2], &cfg);
            let labels: Vec<u32> = table.rows().iter().map(|r| r.label).collect();
            assert_eq!(labels, vec![2, 4, 7, 99]);
            assert_eq!(table.records().count(), 3);
            assert_eq!(table.get(4).map(|r| r.total_volume()), Some(8.0));
            assert_eq!(table.get(2).map(|r| r.total_volume()), Some(12.0));
        }
    }
}
