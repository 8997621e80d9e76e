//! `sling config view`, `sling log view` and `sling log clean`
use std::fs::{self, OpenOptions};

use anyhow::{Context, Result};
use config::SlingConfig;
use sling_core::{
    filer::{Filer, FsFiler},
    tracing::*,
};

pub(crate) fn view_config(cfg: &SlingConfig) -> Result<()> {
    print!("{}", cfg.to_yaml()?);
    Ok(())
}

pub(crate) fn view_log(cfg: &SlingConfig) -> Result<()> {
    let path = cfg
        .log
        .file
        .as_ref()
        .context("no log file configured, logs are written to stderr")?;
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read log file {}", path.display()))?;
    print!("{text}");
    Ok(())
}

/// Truncate the log file and empty both save directories. Missing files and
/// directories are left alone.
pub(crate) fn clean(cfg: &SlingConfig) -> Result<()> {
    if let Some(path) = &cfg.log.file {
        if path.exists() {
            OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(path)
                .with_context(|| format!("failed to truncate log file {}", path.display()))?;
            info!(?path, "truncated log file");
        }
    }
    let filer = FsFiler::new();
    for dir in [&cfg.save_req_dir, &cfg.save_res_dir] {
        if dir.is_dir() {
            filer.clean_dir(dir)?;
            info!(?dir, "cleaned save directory");
        }
    }
    Ok(())
}
