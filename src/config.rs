//! # Configuration Management Module
//!
//! Persistent settings stored in platform-appropriate locations.
//! Handles loading, saving, and providing defaults for configuration options.
//!
//! ## Settings
//! - `scan_duration_secs`: how long a scan session listens for advertisements
//! - `filter_heart_rate_service`: only report peripherals advertising 0x180D
//! - `connect_timeout_secs`: upper bound on a single connect attempt
//! - `retry_delay_secs` / `max_retry_attempts` / `backoff_multiplier` / `max_retry_delay_secs`:
//!   the supervisor's retry policy
//! - `buffer_capacity`: number of samples kept in the rolling history
//! - `channel_capacity`: events queued for the consumer before the oldest is dropped
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/heartbeat-monitor/config.toml
//! - Linux: ~/.config/heartbeat-monitor/config.toml
//! - Windows: %APPDATA%\heartbeat-monitor\config.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::ConfigError;
use crate::state::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scan_duration_secs: u64,
    pub filter_heart_rate_service: bool,
    pub connect_timeout_secs: u64,
    pub retry_delay_secs: u64,
    /// Absent means retry until cancelled
    pub max_retry_attempts: Option<u32>,
    /// 1 keeps the delay fixed
    pub backoff_multiplier: u32,
    pub max_retry_delay_secs: u64,
    pub buffer_capacity: usize,
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_duration_secs: 5,
            filter_heart_rate_service: true,
            connect_timeout_secs: 10,
            retry_delay_secs: 5,
            max_retry_attempts: None,
            backoff_multiplier: 1,
            max_retry_delay_secs: 60,
            buffer_capacity: 50,
            channel_capacity: 256,
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("heartbeat-monitor")
            .join("config.toml")
    }

    /// Load config from the default location, creating it if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, writing a default file there if none exists
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config = toml::from_str(&contents)
                    .map_err(ConfigError::ParseFailed)?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config at {}, writing defaults", path.display());
                let config = Self::default();
                config.save_to(path)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string)
            .map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid("buffer_capacity must be at least 1".into()));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel_capacity must be at least 1".into()));
        }
        if self.backoff_multiplier == 0 {
            return Err(ConfigError::Invalid("backoff_multiplier must be at least 1".into()));
        }
        if self.max_retry_attempts == Some(0) {
            return Err(ConfigError::Invalid("max_retry_attempts must be at least 1 when set".into()));
        }
        Ok(())
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_secs(self.retry_delay_secs),
            max_attempts: self.max_retry_attempts,
            multiplier: self.backoff_multiplier,
            max_delay: Duration::from_secs(self.max_retry_delay_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.buffer_capacity, 50);
        assert_eq!(config.retry_delay_secs, 5);
        assert_eq!(config.max_retry_attempts, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_retry_policy_matches_fixed_five_seconds() {
        let policy = Config::default().retry_policy();
        assert_eq!(policy, RetryPolicy::default());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config {
            max_retry_attempts: Some(3),
            buffer_capacity: 120,
            ..Config::default()
        };

        let toml_str = toml::to_string(&config).expect("Failed to serialize");
        assert!(toml_str.contains("max_retry_attempts = 3"));
        assert!(toml_str.contains("buffer_capacity = 120"));
    }

    #[test]
    fn test_config_deserialization_fills_missing_fields() {
        let toml_str = r#"
            retry_delay_secs = 2
            filter_heart_rate_service = false
        "#;

        let config: Config = toml::from_str(toml_str).expect("Failed to deserialize");
        assert_eq!(config.retry_delay_secs, 2);
        assert!(!config.filter_heart_rate_service);
        assert_eq!(config.buffer_capacity, 50);
        assert_eq!(config.max_retry_attempts, None);
    }

    #[test]
    fn test_config_load_creates_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).expect("Failed to load config");
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_config_round_trips_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config {
            scan_duration_secs: 12,
            channel_capacity: 8,
            ..Config::default()
        };

        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_config_rejects_zero_capacity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "buffer_capacity = 0\n").unwrap();

        assert!(matches!(Config::load_from(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_config_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "this is = = not toml").unwrap();

        assert!(matches!(Config::load_from(&path), Err(ConfigError::ParseFailed(_))));
    }
}
