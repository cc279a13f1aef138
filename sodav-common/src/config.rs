//! Configuration loading and data directory resolution

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// TOML configuration file contents
///
/// Every field is optional; resolution order for each setting is
/// CLI argument → environment variable → this file → compiled default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Data directory holding the SQLite database
    pub data_dir: Option<String>,
    /// AcoustID API key (https://acoustid.org/api-key)
    pub acoustid_api_key: Option<String>,
    /// AudD API key (https://audd.io)
    pub audd_api_key: Option<String>,
    /// tracing-subscriber filter directive, e.g. "sodav_monitor=debug"
    pub log_filter: Option<String>,
}

/// Load the TOML config from an explicit path, or from the default
/// platform location when `path` is `None`. A missing file is not an
/// error; it yields the empty config.
pub fn load_toml_config(path: Option<&Path>) -> Result<TomlConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_config_path() {
            Some(p) if p.exists() => p,
            _ => return Ok(TomlConfig::default()),
        },
    };

    if !path.exists() {
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Default configuration file path for the platform
/// (e.g. `~/.config/sodav-monitor/config.toml` on Linux)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("sodav-monitor").join("config.toml"))
}

/// Data directory resolution, priority order:
/// 1. Command-line argument
/// 2. Environment variable `SODAV_DATA_DIR`
/// 3. TOML config file `data_dir`
/// 4. OS-dependent compiled default
pub fn resolve_data_dir(cli_arg: Option<&str>, toml_config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("SODAV_DATA_DIR") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Some(path) = &toml_config.data_dir {
        return PathBuf::from(path);
    }
    default_data_dir()
}

/// OS-dependent default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("sodav-monitor"))
        .unwrap_or_else(|| PathBuf::from("./sodav_data"))
}
