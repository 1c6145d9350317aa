//! 单只小鼠与整批数据的完整流程:
//! 颅骨投影 -> 标志点定位 -> Bregma-Lambda 重定向 -> (可选) 分层合并 -> 逐脑区统计 -> 写出结果.

use std::io;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use thiserror::Error;

use crate::align::{align_to_bl, Separation};
use crate::consts::DEFAULT_DEVIATION;
use crate::dataset::{LoadError, LoadResult};
use crate::landmarks::{
    locate_landmarks, LandmarkError, LandmarkReport, PlausibilityLimits, SurfaceDepth,
    SutureTemplates,
};
use crate::layers::{layer_collapse, LayerError, OntologyEntry};
use crate::registrator::{suture_registrator, RawRegistratorConfig, Registrator};
use crate::stereotaxic::{
    results_path, stereotaxic_coordinates, StereotaxicConfig, StereotaxicTable,
};
use crate::{Idx3d, Mouse};

/// 流程错误. 只有整只小鼠无法继续时才会出现.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// 数据加载失败.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// 标志点定位失败.
    #[error(transparent)]
    Landmark(#[from] LandmarkError),

    /// 分层合并失败.
    #[error(transparent)]
    Layer(#[from] LayerError),

    /// 结果写出失败.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// 配置文件不是合法的 JSON.
    #[cfg(feature = "serde")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// 流程结果类型.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// 流程配置. 启用 `serde` 时可以从 JSON 读取, 缺省字段取默认值.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PipelineConfig {
    /// 骨缝模板所在目录.
    pub templates_dir: PathBuf,

    /// 骨缝配准配置. 为 `None` 时使用 [`suture_registrator`] 预设.
    pub suture_registration: Option<RawRegistratorConfig>,

    /// 深度查询的相对阈值.
    pub depth_fraction: f32,

    /// 标志点可信度阈值.
    pub limits: PlausibilityLimits,

    /// 微调搜索半径. `0` 表示跳过微调.
    pub deviation: u32,

    /// 图谱本体 (JSON). 给出时先合并皮层分层再统计.
    pub ontology: Option<PathBuf>,

    /// 统计配置. 其中的 `skull_points` 会被对齐后的标志点覆盖.
    pub stereotaxic: StereotaxicConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            templates_dir: PathBuf::from("templates"),
            suture_registration: None,
            depth_fraction: SurfaceDepth::DEFAULT_FRACTION,
            limits: PlausibilityLimits::default(),
            deviation: DEFAULT_DEVIATION,
            ontology: None,
            stereotaxic: StereotaxicConfig::default(),
        }
    }
}

#[cfg(feature = "serde")]
impl PipelineConfig {
    /// 从 JSON 文件读取.
    pub fn from_json<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(io::BufReader::new(file))?)
    }
}

/// 单只小鼠的处理结果.
#[derive(Debug)]
pub struct SubjectOutcome {
    /// 小鼠编号.
    pub id: String,

    /// 原始空间中的标志点. 只有完整流程才有.
    pub landmarks: Option<LandmarkReport>,

    /// 对齐后的 bregma.
    pub bregma: Idx3d,

    /// 对齐后的 lambda.
    pub lambda: Idx3d,

    /// 各阶段分离度.
    pub separations: Vec<(&'static str, Separation)>,

    /// 统计结果.
    pub table: StereotaxicTable,

    /// 结果文件.
    pub path: PathBuf,
}

/// 可复用的流程: 模板, 配准器与本体只加载一次.
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    templates: SutureTemplates,
    registrator: Registrator,
    ontology: Option<Vec<OntologyEntry>>,
}

impl Pipeline {
    /// 按配置加载模板与本体.
    pub fn new(config: PipelineConfig) -> PipelineResult<Self> {
        let templates = SutureTemplates::open(&config.templates_dir)?;
        let ontology = match &config.ontology {
            None => None,
            #[cfg(feature = "serde")]
            Some(path) => Some(crate::layers::read_ontology(path)?),
            #[cfg(not(feature = "serde"))]
            Some(path) => {
                warn!(
                    "Ontology `{}` ignored: reading JSON requires the `serde` feature.",
                    path.display()
                );
                None
            }
        };
        Ok(Self::with_parts(config, templates).with_ontology(ontology))
    }

    /// 由已经加载好的模板创建.
    pub fn with_parts(config: PipelineConfig, templates: SutureTemplates) -> Self {
        let registrator = match &config.suture_registration {
            Some(raw) => Registrator::from_raw(raw),
            None => suture_registrator().clone(),
        };
        Self {
            config,
            templates,
            registrator,
            ontology: None,
        }
    }

    /// 替换本体.
    pub fn with_ontology(mut self, ontology: Option<Vec<OntologyEntry>>) -> Self {
        self.ontology = ontology;
        self
    }

    /// 当前配置.
    #[inline]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// 定位原始空间中的标志点.
    pub fn landmarks(&self, mouse: &Mouse) -> PipelineResult<LandmarkReport> {
        let depth = SurfaceDepth {
            fraction: self.config.depth_fraction,
        };
        Ok(locate_landmarks(
            mouse.volumes.micro_ct.data(),
            mouse.voxel_size(),
            &self.templates,
            &self.registrator,
            &depth,
            &self.config.limits,
        )?)
    }

    /// 完整处理一只小鼠.
    pub fn run_subject(&self, mouse: &Mouse) -> PipelineResult<SubjectOutcome> {
        info!("Processing mouse `{}` of shape {:?}", mouse.id(), mouse.shape());
        let report = self.landmarks(mouse)?;
        let mut outcome = self.run_with_landmarks(mouse, report.bregma, report.lambda)?;
        outcome.landmarks = Some(report);
        Ok(outcome)
    }

    /// 标志点已知时, 执行对齐, 统计与写出.
    pub fn run_with_landmarks(
        &self,
        mouse: &Mouse,
        bregma: Idx3d,
        lambda: Idx3d,
    ) -> PipelineResult<SubjectOutcome> {
        let aligned = align_to_bl(&mouse.volumes, bregma, lambda, self.config.deviation);

        let collapsed = match &self.ontology {
            Some(entries) => Some(layer_collapse(&aligned.volumes.segmentation, entries)?),
            None => None,
        };
        let (seg, labels) = match &collapsed {
            Some(c) => (&c.segmentation, c.labels.clone()),
            None => (
                &aligned.volumes.segmentation,
                aligned.volumes.segmentation.labels(),
            ),
        };

        let config = StereotaxicConfig {
            skull_points: Some((aligned.bregma, aligned.lambda)),
            ..self.config.stereotaxic.clone()
        };
        let table = stereotaxic_coordinates(seg, &labels, &config);
        let path = results_path(mouse.folder(), mouse.id(), &config);
        table.save(&path)?;

        Ok(SubjectOutcome {
            id: mouse.id().to_string(),
            landmarks: None,
            bregma: aligned.bregma,
            lambda: aligned.lambda,
            separations: aligned.separations,
            table,
            path,
        })
    }

    /// 依次处理每只小鼠. 单只小鼠失败只记录错误, 不影响其余.
    pub fn run_batch<I>(&self, subjects: I) -> Vec<(String, PipelineResult<SubjectOutcome>)>
    where
        I: IntoIterator<Item = (String, LoadResult<Mouse>)>,
    {
        let mut ans = vec![];
        for (id, mouse) in subjects {
            let outcome = mouse
                .map_err(PipelineError::from)
                .and_then(|m| self.run_subject(&m));
            match &outcome {
                Ok(o) => info!("Mouse `{id}` done: {} rows -> {}", o.table.len(), o.path.display()),
                Err(e) => error!("Mouse `{id}` failed: {e}"),
            }
            ans.push((id, outcome));
        }
        let failed = ans.iter().filter(|(_, r)| r.is_err()).count();
        if failed > 0 {
            warn!("{failed} of {} mice failed", ans.len());
        }
        ans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ScanVolume, SegVolume, SubjectVolumes};
    use ndarray::{s, Array2, Array3};

    fn mouse(folder: &Path) -> Mouse {
        let shape = (12, 16, 15);
        let mut seg = Array3::<u32>::zeros(shape);
        seg.slice_mut(s![3..8, 4..12, 2..7]).fill(3);
        seg.slice_mut(s![3..8, 4..12, 8..13]).fill(3);
        seg.slice_mut(s![2..4, 6..9, 6..9]).fill(8);
        let scan = Array3::<f32>::from_elem(shape, 1.0);
        let vs = [0.1; 3];
        Mouse::new(
            "T01",
            folder,
            SubjectVolumes::new(
                ScanVolume::from_array(scan.clone(), vs),
                ScanVolume::from_array(scan, vs),
                SegVolume::from_array(seg, vs),
            ),
        )
    }

    fn templates() -> SutureTemplates {
        let mut marker = Array2::<f32>::zeros((4, 4));
        marker[(1, 1)] = 1.0;
        SutureTemplates::from_arrays(Array2::ones((4, 4)), marker.clone(), marker).unwrap()
    }

    #[test]
    fn test_run_with_known_landmarks() {
        let dir = std::env::temp_dir().join("bl_frame_pipeline_test");
        let m = mouse(&dir);
        let config = PipelineConfig {
            deviation: 0,
            ..Default::default()
        };
        let pipeline = Pipeline::with_parts(config, templates()).with_ontology(Some(vec![
            OntologyEntry {
                id: 8,
                name: "Area layer 1".to_string(),
                parent_id: Some(3),
            },
        ]));
        let out = pipeline.run_with_landmarks(&m, (6, 4, 7), (6, 12, 7)).unwrap();
        assert_eq!(out.id, "T01");
        // 标签 8 并入 3
        assert_eq!(out.table.len(), 1);
        assert!(out.table.get(3).is_some());
        assert_eq!(out.path, dir.join("stereotaxic_coordinates.csv"));
        assert!(out.path.is_file());
        assert_eq!(out.separations.len(), 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_batch_keeps_going() {
        let pipeline = Pipeline::with_parts(PipelineConfig::default(), templates());
        let out = pipeline.run_batch(vec![(
            "bad".to_string(),
            Err(LoadError::NotADirectory(PathBuf::from("/nowhere"))),
        )]);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].1, Err(PipelineError::Load(_))));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_config_from_partial_json() {
        let cfg: PipelineConfig = serde_json::from_str(
            r#"{ "deviation": 3, "stereotaxic": { "mode": "inner", "policy": "midline" } }"#,
        )
        .unwrap();
        assert_eq!(cfg.deviation, 3);
        assert_eq!(cfg.stereotaxic.mode, crate::stereotaxic::StatsMode::Inner);
        assert_eq!(cfg.stereotaxic.ddof, 1);
        assert!(cfg.suture_registration.is_none());
    }
}
