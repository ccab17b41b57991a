//! Prints the effective configuration.

use std::path::Path;

use anyhow::{Result, bail};

use super::load_config;

pub fn show(dir: Option<&Path>, format: &str) -> Result<()> {
    let config = load_config(dir)?;
    match format {
        "toml" => print!("{}", config.to_toml()?),
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        other => bail!("unknown format '{other}', expected 'toml' or 'json'"),
    }
    Ok(())
}
