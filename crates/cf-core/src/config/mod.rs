//! Configuration management

mod node;
mod proxy;
pub mod serde_utils;

pub use node::{InputPolicy, NodeConfig};
pub use proxy::{LimiterConfig, ProxyConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use serde_utils::duration_secs;

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cluster-fabric")
}

/// Load configuration from a TOML file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    Ok(toml::from_str(&content)?)
}

/// Save configuration to a TOML file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("proxy.toml");

        let mut config = ProxyConfig::default();
        config.domain = "example.com".to_string();
        save_config(&path, &config).unwrap();

        let loaded: ProxyConfig = load_config(&path).unwrap();
        assert_eq!(loaded.domain, "example.com");
        assert_eq!(loaded.channel_open_timeout, config.channel_open_timeout);
    }

    #[test]
    fn test_load_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let result: Result<ProxyConfig, _> = load_config(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
domain = "edge"
input_policy = "owner"

[backoff]
max = 30
"#,
        )
        .unwrap();

        assert_eq!(config.domain, "edge");
        assert_eq!(config.input_policy, InputPolicy::Owner);
        assert_eq!(config.backoff.max, Duration::from_secs(30));
        assert_eq!(config.backoff.initial, Duration::from_secs(1));
        assert!(!config.logins.is_empty());
    }
}
