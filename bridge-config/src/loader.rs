//! Configuration loader implementations.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, info};

use crate::BridgeConfig;

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "TOOLBRIDGE_CONFIG";

/// Loads configuration from `path`, the file named by [`CONFIG_ENV`], or the
/// defaults, in that order.
///
/// # Errors
///
/// Fails when the selected file cannot be read, parsed, or validated.
pub fn load(path: Option<&Path>) -> anyhow::Result<BridgeConfig> {
    let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    load_from(path, from_env.as_deref())
}

fn load_from(explicit: Option<&Path>, from_env: Option<&Path>) -> anyhow::Result<BridgeConfig> {
    let Some(path) = explicit.or(from_env) else {
        debug!("no configuration file given, using defaults");
        return Ok(BridgeConfig::default());
    };

    let config = BridgeConfig::from_path(path)
        .with_context(|| format!("loading toolbridge configuration from {}", path.display()))?;
    info!(path = %path.display(), "configuration loaded");
    Ok(config)
}
