//! 🐭欢迎光临🧠
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx2d, Idx2dF, Idx3d, Vec3};

pub use crate::{
    LrPair, Mouse, NiftiHeaderAttr, PairStats, ScanVolume, SegVolume, SubjectVolumes,
};

pub use crate::consts::{Side, BACKGROUND, CANONICAL_AXIS, DEFAULT_DEVIATION};

pub use crate::registrator::{
    suture_registrator, RawRegistratorConfig, RegistrationError, Registrator, RegistratorConfig,
    Transform,
};

pub use crate::align::{align_to_bl, separation, Aligned, Separation};

pub use crate::landmarks::{
    get_bregma_lambda, locate_landmarks, skull_projection, DepthLookup, LandmarkReport,
    PlausibilityLimits, SurfaceDepth, SutureTemplates,
};

pub use crate::stereotaxic::{
    stereotaxic_coordinates, SeparationPolicy, StatsMode, StereotaxicConfig, StereotaxicTable,
};

pub use crate::layers::{layer_collapse, OntologyEntry};

pub use crate::dataset::{home_dataset_dir_with, SubjectLoader};

pub use crate::pipeline::{Pipeline, PipelineConfig};
