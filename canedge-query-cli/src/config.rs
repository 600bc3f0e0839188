//! Configuration loading and parsing

use anyhow::{Context, Result};
use canedge_query::EngineConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the password file looked up in the data root
pub const PASSWORDS_FILE: &str = "passwords.json";

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Archive root holding device folders and `*.dbc` files
    pub data_root: Option<PathBuf>,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Log level override (error, warn, info, debug, trace)
    pub log_level: Option<String>,
    /// JSON map of device ID to log file password
    pub passwords_file: Option<PathBuf>,
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    Ok(config)
}

/// Load device passwords from a JSON object file
pub fn load_passwords(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read password file: {:?}", path))?;

    serde_json::from_str(&content).with_context(|| format!("Failed to parse password file: {:?}", path))
}

/// Passwords from the configured file, or from `passwords.json` in the data root if present
pub fn resolve_passwords(config: &AppConfig, data_root: &Path) -> Result<BTreeMap<String, String>> {
    if let Some(path) = &config.passwords_file {
        return load_passwords(path);
    }
    let default_path = data_root.join(PASSWORDS_FILE);
    if default_path.is_file() {
        log::info!("Loading passwords from {:?}", default_path);
        return load_passwords(&default_path);
    }
    Ok(BTreeMap::new())
}
