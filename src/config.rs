//! Configuration for the distributed channel core.
//!
//! Both the channel processor and the device stubs are bootstrapped from a
//! [`CoreConfig`], loadable from YAML or JSON or built programmatically.
//!
//! # Configuration File Structure
//!
//! ```yaml
//! channel_rank: 0
//! reception_threshold_w: 1.0e-15
//! position_epsilon_m: 1.0
//! registration_timeout_ms: 1000
//! checksum_enabled: true
//! log_level: info
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Rank;

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown file format: {0}")]
    UnknownFormat(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Tunable parameters shared by the channel processor and the stubs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Rank hosting the channel processor.
    #[serde(default)]
    pub channel_rank: Rank,

    /// Linear-power floor below which a receiver is skipped, in watts.
    #[serde(default = "default_reception_threshold_w")]
    pub reception_threshold_w: f64,

    /// Minimum movement before another POSITION_UPDATE is sent, in meters.
    #[serde(default = "default_position_epsilon_m")]
    pub position_epsilon_m: f64,

    /// Wall-clock budget for the registration acknowledgement round-trip.
    #[serde(default = "default_registration_timeout_ms")]
    pub registration_timeout_ms: u64,

    /// Whether emitted messages carry a body checksum.
    #[serde(default = "default_checksum_enabled")]
    pub checksum_enabled: bool,

    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_reception_threshold_w() -> f64 {
    // -120 dBm, a conventional noise floor.
    1e-15
}

fn default_position_epsilon_m() -> f64 {
    1.0
}

fn default_registration_timeout_ms() -> u64 {
    1_000
}

fn default_checksum_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            channel_rank: 0,
            reception_threshold_w: default_reception_threshold_w(),
            position_epsilon_m: default_position_epsilon_m(),
            registration_timeout_ms: default_registration_timeout_ms(),
            checksum_enabled: default_checksum_enabled(),
            log_level: default_log_level(),
        }
    }
}

impl CoreConfig {
    /// Creates a configuration with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registration timeout as a [`Duration`].
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        let config: CoreConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a JSON string.
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: CoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file, auto-detecting format by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "json" => Self::from_json(&content),
            _ => Err(ConfigError::UnknownFormat(ext.to_string())),
        }
    }

    /// Converts to a YAML string.
    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validates field ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.reception_threshold_w >= 0.0) {
            return Err(ConfigError::Validation(format!(
                "reception_threshold_w must be non-negative, got {}",
                self.reception_threshold_w
            )));
        }
        if !(self.position_epsilon_m >= 0.0) {
            return Err(ConfigError::Validation(format!(
                "position_epsilon_m must be non-negative, got {}",
                self.position_epsilon_m
            )));
        }
        if self.registration_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "registration_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for creating a [`CoreConfig`] programmatically.
#[derive(Default)]
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    /// Creates a new builder seeded with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the channel rank.
    pub fn channel_rank(mut self, rank: Rank) -> Self {
        self.config.channel_rank = rank;
        self
    }

    /// Sets the reception threshold in watts.
    pub fn reception_threshold_w(mut self, threshold: f64) -> Self {
        self.config.reception_threshold_w = threshold;
        self
    }

    /// Sets the position suppression epsilon in meters.
    pub fn position_epsilon_m(mut self, epsilon: f64) -> Self {
        self.config.position_epsilon_m = epsilon;
        self
    }

    /// Sets the registration timeout in milliseconds.
    pub fn registration_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.registration_timeout_ms = timeout;
        self
    }

    /// Enables or disables body checksums on emitted messages.
    pub fn checksum_enabled(mut self, enabled: bool) -> Self {
        self.config.checksum_enabled = enabled;
        self
    }

    /// Sets the log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> ConfigResult<CoreConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::new();
        assert_eq!(config.channel_rank, 0);
        assert_eq!(config.reception_threshold_w, 1e-15);
        assert_eq!(config.position_epsilon_m, 1.0);
        assert_eq!(config.registration_timeout(), Duration::from_secs(1));
        assert!(config.checksum_enabled);
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
channel_rank: 0
reception_threshold_w: 1.0e-12
position_epsilon_m: 0.5
registration_timeout_ms: 2500
checksum_enabled: false
log_level: debug
"#;
        let config = CoreConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.reception_threshold_w, 1e-12);
        assert_eq!(config.position_epsilon_m, 0.5);
        assert_eq!(config.registration_timeout_ms, 2_500);
        assert!(!config.checksum_enabled);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = CoreConfig::from_yaml("position_epsilon_m: 2.0\n").unwrap();
        assert_eq!(config.position_epsilon_m, 2.0);
        assert_eq!(config.channel_rank, 0);
        assert_eq!(config.registration_timeout_ms, 1_000);
    }

    #[test]
    fn test_json_parsing() {
        let config = CoreConfig::from_json(r#"{"channel_rank": 0, "position_epsilon_m": 3.0}"#)
            .unwrap();
        assert_eq!(config.position_epsilon_m, 3.0);
    }

    #[test]
    fn test_builder() {
        let config = CoreConfigBuilder::new()
            .reception_threshold_w(1e-10)
            .position_epsilon_m(2.0)
            .registration_timeout_ms(500)
            .checksum_enabled(false)
            .build()
            .unwrap();
        assert_eq!(config.reception_threshold_w, 1e-10);
        assert_eq!(config.position_epsilon_m, 2.0);
        assert_eq!(config.registration_timeout_ms, 500);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(CoreConfigBuilder::new()
            .reception_threshold_w(-1.0)
            .build()
            .is_err());
        assert!(CoreConfigBuilder::new()
            .position_epsilon_m(f64::NAN)
            .build()
            .is_err());
        assert!(CoreConfigBuilder::new()
            .registration_timeout_ms(0)
            .build()
            .is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = CoreConfigBuilder::new()
            .position_epsilon_m(4.0)
            .build()
            .unwrap();
        let yaml = config.to_yaml().unwrap();
        let restored = CoreConfig::from_yaml(&yaml).unwrap();
        assert_eq!(restored.position_epsilon_m, 4.0);
    }
}
