//! Check-config command

use anyhow::{Context, Result};
use nucleus_authority::AuthorityConfig;
use std::path::Path;

/// Loads the configuration, falling back to defaults when the file is missing.
pub fn load(path: &Path) -> Result<AuthorityConfig> {
    AuthorityConfig::load(path).with_context(|| format!("failed to load {}", path.display()))
}

/// Prints the effective configuration as JSON.
pub fn show(path: &Path) -> Result<()> {
    let config = load(path)?;
    if !path.exists() {
        println!("# {} not found, showing defaults", path.display());
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
