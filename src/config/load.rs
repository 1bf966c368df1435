//! Config file discovery and loading.

use std::fs;
use std::path::{Path, PathBuf};

use super::{Config, ConfigError};

pub const CONFIG_ENV: &str = "RETCON_CONFIG";

/// Resolve the config file path. `RETCON_CONFIG` overrides `--config`.
pub fn config_path(cli: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    cli.map(Path::to_path_buf).ok_or(ConfigError::MissingPath)
}

/// Read, parse and validate the config at `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}
