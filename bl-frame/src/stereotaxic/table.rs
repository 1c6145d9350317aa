//! 逐脑区结果记录与结果表.

use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use itertools::iproduct;
use log::info;

use super::separate::SeparationMethod;
use super::{StatsError, StatsMode};
use crate::{Idx3d, LrPair, PairStats, Vec3};

/// 单个脑区的统计结果. 创建后不可变, 物理单位的数值按需换算.
#[derive(Clone, Debug)]
pub struct SegmentRecord {
    /// 标签.
    pub label: u32,

    /// 实际使用的分离方式.
    pub method: SeparationMethod,

    /// 体素尺寸 `[z, y, x]`.
    pub voxel_size: Vec3,

    /// 平均质心 (体素坐标).
    pub mean: LrPair<Vec3>,

    /// 内核质心 (体素坐标).
    pub inner: LrPair<Vec3>,

    /// 形状质心 (体素坐标).
    pub shape: LrPair<Vec3>,

    /// 体素个数.
    pub volume: LrPair<f64>,

    /// 内核掩膜.
    pub inner_mask: LrPair<Vec<Idx3d>>,
}

impl SegmentRecord {
    /// `mode` 对应的质心 (体素坐标).
    #[inline]
    pub fn centroid(&self, mode: StatsMode) -> LrPair<Vec3> {
        match mode {
            StatsMode::FullMean => self.mean,
            StatsMode::Inner => self.inner,
            StatsMode::Shape => self.shape,
        }
    }

    /// `mode` 对应的质心 (物理坐标), 即体素坐标逐分量乘以体素尺寸.
    #[inline]
    pub fn centroid_mm(&self, mode: StatsMode) -> LrPair<Vec3> {
        self.centroid(mode) * self.voxel_size
    }

    /// 物理体积.
    #[inline]
    pub fn volume_mm3(&self) -> LrPair<f64> {
        self.volume * self.voxel_size.iter().product::<f64>()
    }

    /// 总体素个数.
    #[inline]
    pub fn total_volume(&self) -> f64 {
        self.volume.total()
    }
}

/// 结果表中的一行. 失败的脑区也占一行.
#[derive(Debug)]
pub struct SegmentRow {
    /// 标签.
    pub label: u32,

    /// 结果或错误.
    pub outcome: Result<SegmentRecord, StatsError>,
}

/// 按标签排序的结果表.
#[derive(Debug)]
pub struct StereotaxicTable {
    rows: Vec<SegmentRow>,
    mode: StatsMode,
    ddof: u32,
}

const AXES: [&str; 3] = ["z", "y", "x"];

fn push_vec(line: &mut String, v: &Vec3) {
    for c in v.iter() {
        let _ = write!(line, ",{c}");
    }
}

fn push_stats3(line: &mut String, s: &PairStats<Vec3>) {
    push_vec(line, &s.mean);
    push_vec(line, &s.std);
    push_vec(line, &s.ste);
}

fn header_block(header: &mut String, unit: &str) {
    for (prefix, axis) in iproduct!(["l", "r", "mean", "std", "ste"], AXES) {
        let _ = write!(header, ",{prefix}_{axis}_{unit}");
    }
    for prefix in ["l", "r", "mean", "std", "ste"] {
        let _ = write!(header, ",{prefix}_volume_{unit}");
    }
}

impl StereotaxicTable {
    pub(crate) fn new(mut rows: Vec<SegmentRow>, mode: StatsMode, ddof: u32) -> Self {
        rows.sort_by_key(|r| r.label);
        Self { rows, mode, ddof }
    }

    /// 所有行.
    #[inline]
    pub fn rows(&self) -> &[SegmentRow] {
        &self.rows
    }

    /// 行数.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// 是否为空表.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 质心列使用的模式.
    #[inline]
    pub fn mode(&self) -> StatsMode {
        self.mode
    }

    /// 按标签查找成功的结果.
    pub fn get(&self, label: u32) -> Option<&SegmentRecord> {
        self.rows
            .binary_search_by_key(&label, |r| r.label)
            .ok()
            .and_then(|i| self.rows[i].outcome.as_ref().ok())
    }

    /// 成功的结果.
    pub fn records(&self) -> impl Iterator<Item = &SegmentRecord> {
        self.rows.iter().filter_map(|r| r.outcome.as_ref().ok())
    }

    /// 失败的行.
    pub fn failures(&self) -> impl Iterator<Item = (u32, &StatsError)> {
        self.rows
            .iter()
            .filter_map(|r| r.outcome.as_ref().err().map(|e| (r.label, e)))
    }

    /// CSV 表头.
    pub fn header() -> String {
        let mut header = String::from("id,separation_method,error");
        header_block(&mut header, "vox");
        header_block(&mut header, "mm");
        header
    }

    /// 一行 CSV.
    fn csv_line(&self, row: &SegmentRow) -> String {
        let mut line = row.label.to_string();
        let rec = match &row.outcome {
            Ok(rec) => rec,
            Err(e) => {
                // 错误信息中的逗号会破坏列.
                let _ = write!(line, ",,{}", e.to_string().replace(',', ";"));
                let n_cols = Self::header().split(',').count();
                line.push_str(&",".repeat(n_cols - 3));
                return line;
            }
        };
        let _ = write!(line, ",{},", rec.method);
        for (centroid, volume) in [
            (rec.centroid(self.mode), rec.volume),
            (rec.centroid_mm(self.mode), rec.volume_mm3()),
        ] {
            push_vec(&mut line, &centroid.left);
            push_vec(&mut line, &centroid.right);
            push_stats3(&mut line, &centroid.stats(self.ddof));
            let s = volume.stats(self.ddof);
            for v in [volume.left, volume.right, s.mean, s.std, s.ste] {
                let _ = write!(line, ",{v}");
            }
        }
        line
    }

    /// 写出 CSV. 父目录不存在时自动创建.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = io::BufWriter::new(fs::File::create(path)?);
        writeln!(file, "{}", Self::header())?;
        for row in self.rows.iter() {
            writeln!(file, "{}", self.csv_line(row))?;
        }
        file.flush()?;
        info!("Saved {} rows to {}", self.rows.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lr_pair;

    fn record(label: u32) -> SegmentRecord {
        let c = lr_pair([1.0, 2.0, 3.0], [1.0, 2.0, 7.0]);
        SegmentRecord {
            label,
            method: SeparationMethod::Midline,
            voxel_size: [0.5, 0.5, 0.25],
            mean: c,
            inner: c,
            shape: c,
            volume: lr_pair(8.0, 4.0),
            inner_mask: lr_pair(vec![], vec![]),
        }
    }

    #[test]
    fn test_physical_views() {
        let rec = record(3);
        let mm = rec.centroid_mm(StatsMode::FullMean);
        assert_eq!(mm.left, [0.5, 1.0, 0.75]);
        assert_eq!(mm.right, [0.5, 1.0, 1.75]);
        assert_eq!(rec.volume_mm3(), lr_pair(0.5, 0.25));
        assert_eq!(rec.total_volume(), 12.0);
    }

    #[test]
    fn test_rows_sorted_and_csv_width() {
        let rows = vec![
            SegmentRow {
                label: 9,
                outcome: Err(StatsError::EmptyLabel(9)),
            },
            SegmentRow {
                label: 3,
                outcome: Ok(record(3)),
            },
        ];
        let table = StereotaxicTable::new(rows, StatsMode::FullMean, 1);
        assert_eq!(table.rows()[0].label, 3);
        assert!(table.get(3).is_some());
        assert!(table.get(9).is_none());
        assert_eq!(table.failures().count(), 1);

        let n_cols = StereotaxicTable::header().split(',').count();
        for row in table.rows() {
            assert_eq!(table.csv_line(row).split(',').count(), n_cols);
        }
    }
}
