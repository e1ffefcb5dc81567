//! Training configuration files.
//!
//! A configuration file is TOML with an optional `[factorization]` table; every field
//! falls back to its documented default, so an empty file is a valid configuration:
//!
//! ```toml
//! use_bias = true
//!
//! [factorization]
//! k = 3
//! steps = 10000
//! alpha = 0.001
//! seed = 42
//! ```

use crate::factorize::{FactorizationConfig, TrainingError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    /// Remove global/row/column bias before factorizing and add it back afterwards.
    pub use_bias: bool,
    pub factorization: FactorizationConfig,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] TrainingError),
}

impl TrainingConfig {
    /// Reads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let toml_string = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&toml_string)?;
        log::info!("Loaded training configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(toml_string: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_string)?;
        config.factorization.validate()?;
        Ok(config)
    }
}
