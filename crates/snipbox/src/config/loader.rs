//! Configuration file loading for snipbox
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigBuilder, File, FileFormat};

use crate::config::{Config, ConfigError};

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_timeout("timeout_secs", self.timeout_secs)?;
        check_timeout("compiler.timeout_secs", self.compiler.timeout_secs)?;
        if self.compiler.rustc.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "compiler.rustc must not be empty".to_string(),
            ));
        }
        if self.sandbox.box_count == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.box_count must be at least 1".to_string(),
            ));
        }
        for namespace in &self.namespaces {
            if !is_valid_namespace(namespace) {
                return Err(ConfigError::InvalidNamespace(namespace.clone()));
            }
        }

        Ok(())
    }
}

/// Timeouts must be positive and fit in a [`Duration`]
fn check_timeout(name: &str, secs: f64) -> Result<(), ConfigError> {
    if secs > 0.0 && Duration::try_from_secs_f64(secs).is_ok() {
        return Ok(());
    }
    Err(ConfigError::Invalid(format!(
        "{name} must be a positive number of seconds, got {secs}"
    )))
}

/// A namespace is a `::`-separated identifier path, optionally ending in `::*`
pub(crate) fn is_valid_namespace(namespace: &str) -> bool {
    let path = namespace.strip_suffix("::*").unwrap_or(namespace);
    if path.is_empty() {
        return false;
    }
    path.split("::").all(|segment| {
        let mut chars = segment.chars();
        match chars.next() {
            Some(first) if first == '_' || first.is_ascii_alphabetic() => {
                chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
            }
            _ => false,
        }
    })
}
