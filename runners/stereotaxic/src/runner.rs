//! 程序运行函数.

use crate::result::BatchResult;
use bl_frame::pipeline::{Pipeline, PipelineConfig, PipelineResult};
use log::{debug, info, warn};
use std::path::PathBuf;
use utils::loader;

/// 读取配置. 没有配置文件时使用默认值, 并从环境变量补全模板目录.
fn load_config(path: Option<PathBuf>) -> PipelineResult<PipelineConfig> {
    match path {
        Some(p) => {
            info!("Loading configuration from {}", p.display());
            PipelineConfig::from_json(p)
        }
        None => {
            let mut config = PipelineConfig::default();
            match loader::templates_dir_from_env_or_home() {
                Some(d) => config.templates_dir = d,
                None => warn!("Home directory unknown, templates are read from `./templates`."),
            }
            Ok(config)
        }
    }
}

/// 实际运行.
pub fn run(config_path: Option<PathBuf>) -> PipelineResult<BatchResult> {
    let config = load_config(config_path)?;
    match serde_json::to_string_pretty(&config) {
        Ok(s) => debug!("Configuration:\n{s}"),
        Err(e) => warn!("Cannot display configuration: {e}"),
    }

    let cpus = utils::cpus();
    if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(cpus).build_global() {
        warn!("Thread pool already initialized: {e}");
    }

    let subjects = loader::subject_loader_from_env_or_home()?;
    info!("Running on {} mice with {cpus} threads...", subjects.len());

    let pipeline = Pipeline::new(config)?;
    Ok(BatchResult::from_iter(pipeline.run_batch(subjects)))
}
