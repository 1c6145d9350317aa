//! 批量计算小鼠脑区立体定位坐标.
//!
//! 用法: `stereotaxic [config.json]`. 不给出配置文件时使用默认配置,
//! 模板目录取 `$NEUROFRAME_TEMPLATES_DIR` 或 `$HOME/dataset/templates`.

use log::{error, LevelFilter};
use simple_logger::SimpleLogger;
use std::process::ExitCode;

mod result;
mod runner;

fn main() -> ExitCode {
    if let Err(e) = SimpleLogger::new().with_level(LevelFilter::Info).env().init() {
        eprintln!("Logger initialization error: {e}");
    }

    let config_path = std::env::args_os().nth(1).map(Into::into);
    match runner::run(config_path) {
        Ok(result) => {
            result.analyze();
            if result.all_succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
