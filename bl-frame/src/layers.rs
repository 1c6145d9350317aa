//! 皮层分层合并.
//!
//! 图谱本体中名称含 "layer" (不区分大小写) 且父节点相同的连续条目,
//! 在分割中被统一替换为父节点的标签.

use std::collections::HashMap;

use log::{debug, info};
use thiserror::Error;

use crate::SegVolume;

/// 分层合并错误.
#[derive(Error, Debug)]
pub enum LayerError {
    /// 分层条目没有父节点, 无处合并.
    #[error("Layer entry {id} (`{name}`) has no parent")]
    MissingParent {
        /// 条目标签.
        id: u32,
        /// 条目名称.
        name: String,
    },

    /// 本体文件读取失败.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// 本体文件不是合法的 JSON.
    #[cfg(feature = "serde")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// 本体中的一个条目.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OntologyEntry {
    /// 标签.
    pub id: u32,

    /// 名称.
    pub name: String,

    /// 父节点标签.
    #[cfg_attr(feature = "serde", serde(default))]
    pub parent_id: Option<u32>,
}

impl OntologyEntry {
    /// 是否为分层条目?
    #[inline]
    pub fn is_layer(&self) -> bool {
        self.name.to_lowercase().contains("layer")
    }

    /// 去掉 "layer" 及其之后部分的名称.
    fn base_name(&self) -> &str {
        match self.name.to_lowercase().find("layer") {
            Some(i) if self.name.is_char_boundary(i) => self.name[..i].trim(),
            _ => self.name.trim(),
        }
    }
}

/// 从 JSON 数组读取本体.
#[cfg(feature = "serde")]
pub fn read_ontology<P: AsRef<std::path::Path>>(path: P) -> Result<Vec<OntologyEntry>, LayerError> {
    let file = std::fs::File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

/// 一段被合并的连续分层.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerRun {
    /// 父节点标签.
    pub parent_id: u32,

    /// 被合并的标签.
    pub ids: Vec<u32>,
}

/// 合并结果.
#[derive(Debug)]
pub struct Collapsed {
    /// 新的分割.
    pub segmentation: SegVolume,

    /// 新分割的标签 (升序, 不含背景).
    pub labels: Vec<u32>,

    /// 被合并的分层.
    pub runs: Vec<LayerRun>,
}

/// 结束一段分层.
fn close_run(run: &[&OntologyEntry]) -> Result<LayerRun, LayerError> {
    let first = run[0];
    let parent_id = first.parent_id.ok_or_else(|| LayerError::MissingParent {
        id: first.id,
        name: first.name.clone(),
    })?;
    debug!(
        "Layer: {} - Parent: {parent_id} ({:?})",
        first.base_name(),
        run.iter().map(|e| e.name.as_str()).collect::<Vec<_>>()
    );
    Ok(LayerRun {
        parent_id,
        ids: run.iter().map(|e| e.id).collect(),
    })
}

/// 找出本体中所有连续且同父的分层.
pub fn layer_runs(ontology: &[OntologyEntry]) -> Result<Vec<LayerRun>, LayerError> {
    let mut runs = vec![];
    let mut run: Vec<&OntologyEntry> = vec![];
    for entry in ontology.iter() {
        let continues = entry.is_layer()
            && run
                .first()
                .map_or(true, |first| first.parent_id == entry.parent_id);
        if continues {
            run.push(entry);
            continue;
        }
        if !run.is_empty() {
            runs.push(close_run(&run)?);
            run.clear();
        }
        if entry.is_layer() {
            run.push(entry);
        }
    }
    if !run.is_empty() {
        runs.push(close_run(&run)?);
    }
    Ok(runs)
}

/// 合并分层, 返回新的分割与标签. 原分割不变.
pub fn layer_collapse(seg: &SegVolume, ontology: &[OntologyEntry]) -> Result<Collapsed, LayerError> {
    let before = seg.labels().len();
    let runs = layer_runs(ontology)?;

    let mut mapping = HashMap::<u32, u32>::new();
    for r in runs.iter() {
        for id in r.ids.iter() {
            mapping.insert(*id, r.parent_id);
        }
    }
    // 父节点本身也可能是后面某段分层的成员.
    let resolve = |mut v: u32| {
        for _ in 0..mapping.len() {
            match mapping.get(&v) {
                Some(p) if *p != v => v = *p,
                _ => break,
            }
        }
        v
    };
    let resolved: HashMap<u32, u32> = mapping.keys().map(|k| (*k, resolve(*k))).collect();

    let data = seg
        .data()
        .mapv(|v| resolved.get(&v).copied().unwrap_or(v));
    let segmentation = seg.with_data(data);
    let labels = segmentation.labels();
    if labels.len() != before {
        info!("Reduced from {before} to {} segments", labels.len());
    } else {
        info!("No layers found to collapse.");
    }
    debug!("Labels after collapsing: {labels:?}");
    Ok(Collapsed {
        segmentation,
        labels,
        runs,
    })
}
