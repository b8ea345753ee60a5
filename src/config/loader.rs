//! Configuration file loading.

use crate::config::{validate_config, Config};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Load configuration from a JSON file.
///
/// Reads the file, parses the JSON, applies defaults for missing keys, and
/// validates the result.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_json::from_str(&contents)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}
