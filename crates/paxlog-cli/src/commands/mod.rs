//! CLI command implementations.

pub mod config;
pub mod dump;
pub mod run;

use std::path::Path;

use anyhow::{Context, Result};
use paxlog_config::PaxlogConfig;

/// Loads and validates the configuration, from `dir` or the working
/// directory.
pub fn load_config(dir: Option<&Path>) -> Result<PaxlogConfig> {
    let config = match dir {
        Some(dir) => PaxlogConfig::load_from_dir(dir)
            .with_context(|| format!("failed to load configuration from {}", dir.display()))?,
        None => PaxlogConfig::load().context("failed to load configuration")?,
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}
