//! Subcommands

pub mod login;
pub mod mine;
pub mod version;

use anyhow::{Context, Result};
use emrys::FileConfig;

/// `.emrys` from the usual locations, with `flags` layered on top.
pub fn load_config(flags: FileConfig) -> Result<FileConfig> {
    let file = FileConfig::discover(&FileConfig::default_search_dirs())
        .context("Failed to read .emrys config")?;
    Ok(file.overlay(flags))
}
