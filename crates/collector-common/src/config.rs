//! Top-level configuration for the acquisition engine.
//!
//! Deserializes from TOML with `#[serde(default)]` throughout, the
//! same convention the rest of the workspace uses, but validation is
//! exhaustive rather than fail-fast: every violation is collected and
//! returned together, per spec.md §6 ("Validation errors → startup
//! failure with report enumerating all violations").

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::DeviceSpec;

/// Top-level runtime configuration loaded once at startup and treated
/// as read-only thereafter (spec.md §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Period between poll ticks for every device, in milliseconds
    /// (1000-60000).
    pub poll_interval_ms: u64,
    /// Period between health heartbeat emissions, in milliseconds
    /// (5000-300000).
    pub health_check_interval_ms: u64,
    /// Time-series writer configuration.
    pub writer: WriterConfig,
    /// Devices to poll, in configuration order.
    pub devices: Vec<DeviceSpec>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            health_check_interval_ms: 30_000,
            writer: WriterConfig::default(),
            devices: Vec::new(),
        }
    }
}

/// Time-series writer batching and backoff configuration, per
/// spec.md §4.7.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum points per batch before a flush is triggered.
    pub batch_size: usize,
    /// Maximum time between flushes, regardless of batch fill.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Maximum number of buffered batches retained while the backend
    /// is unavailable; beyond this, the oldest batch is dropped.
    pub max_buffered_batches: usize,
    /// Hard deadline for the shutdown flush.
    #[serde(with = "humantime_serde")]
    pub flush_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            max_buffered_batches: 6,
            flush_timeout: Duration::from_secs(10),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid TOML, or
    /// [`ConfigError::Validation`] if it fails schema validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source_msg: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the TOML is invalid, or
    /// [`ConfigError::Validation`] if the parsed config fails schema
    /// validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration back to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if serialization fails (reused
    /// variant: TOML serialization errors are also string-shaped).
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate every schema invariant in spec.md §6, collecting all
    /// violations instead of stopping at the first.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] with one message per
    /// violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();

        if !(1_000..=60_000).contains(&self.poll_interval_ms) {
            violations.push(format!(
                "poll_interval_ms {} out of range [1000,60000]",
                self.poll_interval_ms
            ));
        }
        if !(5_000..=300_000).contains(&self.health_check_interval_ms) {
            violations.push(format!(
                "health_check_interval_ms {} out of range [5000,300000]",
                self.health_check_interval_ms
            ));
        }

        let mut seen_device_ids = HashSet::new();
        for device in &self.devices {
            if device.device_id.is_empty() {
                violations.push("device_id must not be empty".to_string());
            } else if !seen_device_ids.insert(device.device_id.clone()) {
                violations.push(format!("duplicate device_id '{}'", device.device_id));
            }
            if !(1_000..=30_000).contains(&device.timeout_ms) {
                violations.push(format!(
                    "device '{}': timeout_ms {} out of range [1000,30000]",
                    device.device_id, device.timeout_ms
                ));
            }
            if !(1..=10).contains(&device.max_retry_attempts) {
                violations.push(format!(
                    "device '{}': max_retry_attempts {} out of range [1,10]",
                    device.device_id, device.max_retry_attempts
                ));
            }
            if !(100..=10_000).contains(&device.retry_delay_ms) {
                violations.push(format!(
                    "device '{}': retry_delay_ms {} out of range [100,10000]",
                    device.device_id, device.retry_delay_ms
                ));
            }
            if device.channels.is_empty() {
                violations.push(format!(
                    "device '{}': must declare at least one channel",
                    device.device_id
                ));
            }
            let mut seen_channels = HashSet::new();
            for channel in &device.channels {
                if !seen_channels.insert(channel.channel_number) {
                    violations.push(format!(
                        "device '{}': duplicate channel_number {}",
                        device.device_id, channel.channel_number
                    ));
                }
                if let Err(e) = channel.validate() {
                    violations.push(format!("device '{}': {e}", device.device_id));
                }
            }
        }

        if self.writer.batch_size == 0 {
            violations.push("writer.batch_size must be nonzero".to_string());
        }
        if self.writer.max_buffered_batches == 0 {
            violations.push("writer.max_buffered_batches must be nonzero".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(violations))
        }
    }
}

/// Serde helper module for `Duration` using humantime format, matching
/// the rest of the workspace's convention for config durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelSpec, DeviceConnection, WordOrder};
    use std::collections::BTreeMap;

    fn valid_device() -> DeviceSpec {
        DeviceSpec {
            device_id: "D1".into(),
            connection: DeviceConnection::ModbusTcp {
                host: "127.0.0.1".into(),
                port: 502,
                unit_id: 1,
            },
            timeout_ms: 2_000,
            max_retry_attempts: 3,
            retry_delay_ms: 500,
            channels: vec![ChannelSpec {
                channel_number: 0,
                name: "ch0".into(),
                start_register: 0,
                register_count: 2,
                word_order: WordOrder::HighWordFirst,
                scale_factor: 1.0,
                offset: 0.0,
                unit: "count".into(),
                decimal_places: 0,
                min_value: None,
                max_value: None,
                max_rate_of_change: None,
                enabled: true,
                tags: BTreeMap::new(),
            }],
        }
    }

    #[test]
    fn default_config_validates() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn valid_device_passes_validation() {
        let mut cfg = RuntimeConfig::default();
        cfg.devices.push(valid_device());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn duplicate_device_id_is_rejected() {
        let mut cfg = RuntimeConfig::default();
        cfg.devices.push(valid_device());
        cfg.devices.push(valid_device());
        let err = cfg.validate().unwrap_err();
        match err {
            ConfigError::Validation(v) => assert!(v.iter().any(|m| m.contains("duplicate device_id"))),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn poll_interval_out_of_range_is_one_of_several_violations() {
        let mut cfg = RuntimeConfig::default();
        cfg.poll_interval_ms = 500;
        cfg.devices.push(valid_device());
        cfg.devices.push(valid_device());
        let err = cfg.validate().unwrap_err();
        let ConfigError::Validation(v) = err else {
            panic!("expected validation error")
        };
        assert!(v.iter().any(|m| m.contains("poll_interval_ms")));
        assert!(v.iter().any(|m| m.contains("duplicate device_id")));
        assert!(v.len() >= 2);
    }

    #[test]
    fn roundtrip_toml_preserves_devices() {
        let mut cfg = RuntimeConfig::default();
        cfg.devices.push(valid_device());
        let toml = cfg.to_toml().unwrap();
        let parsed = RuntimeConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed.devices.len(), 1);
        assert_eq!(parsed.devices[0].device_id, "D1");
    }

    #[test]
    fn empty_channel_list_is_rejected() {
        let mut cfg = RuntimeConfig::default();
        let mut device = valid_device();
        device.channels.clear();
        cfg.devices.push(device);
        let err = cfg.validate().unwrap_err();
        let ConfigError::Validation(v) = err else {
            panic!("expected validation error")
        };
        assert!(v.iter().any(|m| m.contains("at least one channel")));
    }
}
