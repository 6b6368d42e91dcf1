//! Configuration loader with environment variable expansion

use super::{expand_env_vars, ConfigError, TelemetryConfig};
use std::path::Path;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    ///
    /// `${VAR}` placeholders are expanded before parsing, then the
    /// recognized environment overrides are applied and the result is
    /// validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<TelemetryConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<TelemetryConfig, ConfigError> {
        let expanded = expand_env_vars(content);
        let mut config: TelemetryConfig = serde_yaml::from_str(&expanded)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_rejected_without_credentials() {
        // `{}` gives every default, which lacks a connection string
        let result = ConfigLoader::from_yaml("{}");
        if std::env::var(crate::config::ENV_CONNECTION_STRING).is_err() {
            assert!(result.is_err());
        }
    }

    #[test]
    fn test_disabled_document() {
        let config = ConfigLoader::from_yaml("enabled: false").unwrap();
        assert!(!config.enabled);
    }
}
