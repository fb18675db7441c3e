// Configuration Management
//
// This crate handles all configuration loading for the renfield server.
// It provides:
// - Configuration structs with serde defaults for every field
// - YAML file loading (path overridable via RENFIELD_CONFIG)
//
// This keeps configuration concerns separate from domain logic.

use std::path::Path;
use thiserror::Error;

pub mod types;

// Re-export all configuration types
pub use types::*;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    ReadError {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

/// Main configuration loading interface
impl RenfieldConfig {
    /// Load configuration from a YAML file.
    ///
    /// The path defaults to `config.yaml` in the working directory and can be
    /// overridden with the `RENFIELD_CONFIG` environment variable. A missing
    /// file yields the built-in defaults so the server can start without one.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("RENFIELD_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
        if !Path::new(&path).exists() {
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    /// Load configuration from an explicit file path.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_string(),
            source,
        })?;
        let config: RenfieldConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }
}
