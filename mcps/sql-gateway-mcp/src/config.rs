//! Configuration loading for the SQL gateway MCP server

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sql_gateway::GatewayConfig;

/// Default config location: `$XDG_CONFIG_HOME/sql-gateway/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sql-gateway").join("config.toml"))
}

/// Load the gateway configuration
///
/// Looks for config in:
/// 1. `explicit` (from `--config` / `SQL_GATEWAY_CONFIG`), which must exist
/// 2. [`default_config_path`], if present
///
/// Falls back to defaults when neither applies.
pub fn load(explicit: Option<&Path>) -> Result<GatewayConfig> {
    if let Some(path) = explicit {
        return load_file(path);
    }

    match default_config_path() {
        Some(path) if path.exists() => load_file(&path),
        _ => {
            tracing::debug!("No config file found, using defaults");
            Ok(GatewayConfig::default())
        }
    }
}

/// Parse one TOML config file
pub fn load_file(path: &Path) -> Result<GatewayConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {:?}", path))?;

    let config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config from {:?}", path))?;
    tracing::info!(path = %path.display(), "Loaded config");
    Ok(config)
}
