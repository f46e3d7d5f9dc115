//! On-disk locations under `~/.peerchat`.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Base directory for peerchat state (`~/.peerchat`).
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".peerchat"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("config.json"))
}

pub fn identity_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("identity.json"))
}

pub fn logs_dir() -> Result<PathBuf> {
    Ok(base_dir()?.join("logs"))
}
