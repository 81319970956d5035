//! Core data model shared by every acquisition crate.
//!
//! These types describe devices, channels and readings the way the
//! acquisition pipeline passes them between stages: immutable once
//! loaded (`DeviceSpec`/`ChannelSpec`), produced once per poll cycle
//! (`Reading`), or derived on demand (`DeviceHealth`).

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Word order used to assemble a multi-register counter value.
///
/// Byte order on the wire is always big-endian per the Modbus/TCP
/// specification; this only controls which 16-bit register holds the
/// high-order half of a 32-bit (or wider) value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// First register in the response holds the high-order word.
    HighWordFirst,
    /// First register in the response holds the low-order word.
    LowWordFirst,
}

impl Default for WordOrder {
    fn default() -> Self {
        Self::HighWordFirst
    }
}

/// Where a device's registers live: Modbus/TCP counter module, or a
/// raw-socket scale bridge decoded by a `ProtocolTemplate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceConnection {
    /// ADAM-style counter module reachable over Modbus/TCP.
    ModbusTcp {
        /// Hostname or IP address.
        host: String,
        /// TCP port, usually 502.
        port: u16,
        /// Modbus unit identifier.
        unit_id: u8,
    },
    /// Scale bridge speaking an opaque line protocol over a raw TCP
    /// socket, decoded with a `ProtocolTemplate` discovered offline.
    ScaleSocket {
        /// Hostname or IP address.
        host: String,
        /// TCP port.
        port: u16,
        /// Template identifier applied to incoming frames.
        template_id: String,
    },
}

/// A single channel (register range or scale field) on a device.
///
/// Immutable after `DeviceSpec` is loaded; invariants are checked by
/// [`ChannelSpec::validate`] at load time, not on every reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Channel number, unique within the owning device (0-255).
    pub channel_number: u8,
    /// Human-readable name, at most 100 characters.
    pub name: String,
    /// First holding/input register read for this channel.
    pub start_register: u16,
    /// Number of 16-bit registers to read (1-4).
    pub register_count: u8,
    /// Word order used to assemble multi-register values.
    #[serde(default)]
    pub word_order: WordOrder,
    /// Multiplier applied to the raw register value. Must be nonzero.
    pub scale_factor: f64,
    /// Additive offset applied after scaling.
    #[serde(default)]
    pub offset: f64,
    /// Engineering unit label, e.g. "kg" or "count".
    #[serde(default)]
    pub unit: String,
    /// Number of decimal places used when rounding for presentation.
    #[serde(default)]
    pub decimal_places: u8,
    /// Inclusive lower bound for `processed_value`, if enforced.
    #[serde(default)]
    pub min_value: Option<f64>,
    /// Inclusive upper bound for `processed_value`, if enforced.
    #[serde(default)]
    pub max_value: Option<f64>,
    /// Maximum allowed `|rate|` in units/second before quality drops
    /// to `Uncertain`.
    #[serde(default)]
    pub max_rate_of_change: Option<f64>,
    /// Channel is polled when true; disabled channels are skipped
    /// every tick without producing a `Reading`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Static tags merged onto every `Reading` from this channel.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

/// A channel configuration invariant was violated.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInvariantError(pub String);

impl fmt::Display for ChannelInvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ChannelInvariantError {}

impl ChannelSpec {
    /// Validate the invariants spec.md §3 places on a channel:
    /// `start_register + register_count <= 65536`, `scale_factor != 0`,
    /// `min_value <= max_value`, `name.len() <= 100`.
    pub fn validate(&self) -> Result<(), ChannelInvariantError> {
        let end = u32::from(self.start_register) + u32::from(self.register_count);
        if end > 65536 {
            return Err(ChannelInvariantError(format!(
                "channel {}: start_register {} + register_count {} exceeds 65536",
                self.channel_number, self.start_register, self.register_count
            )));
        }
        if !(1..=4).contains(&self.register_count) {
            return Err(ChannelInvariantError(format!(
                "channel {}: register_count {} out of range [1,4]",
                self.channel_number, self.register_count
            )));
        }
        if self.scale_factor == 0.0 {
            return Err(ChannelInvariantError(format!(
                "channel {}: scale_factor must be nonzero",
                self.channel_number
            )));
        }
        if let (Some(min), Some(max)) = (self.min_value, self.max_value) {
            if min > max {
                return Err(ChannelInvariantError(format!(
                    "channel {}: min_value {min} greater than max_value {max}",
                    self.channel_number
                )));
            }
        }
        if self.name.len() > 100 {
            return Err(ChannelInvariantError(format!(
                "channel {}: name exceeds 100 characters",
                self.channel_number
            )));
        }
        if self.name.is_empty() {
            return Err(ChannelInvariantError(format!(
                "channel {}: name must not be empty",
                self.channel_number
            )));
        }
        if self.decimal_places > 10 {
            return Err(ChannelInvariantError(format!(
                "channel {}: decimal_places {} exceeds 10",
                self.channel_number, self.decimal_places
            )));
        }
        if let Some(rate) = self.max_rate_of_change {
            if rate <= 0.0 {
                return Err(ChannelInvariantError(format!(
                    "channel {}: max_rate_of_change must be positive",
                    self.channel_number
                )));
            }
        }
        Ok(())
    }
}

/// A polled device: either a Modbus counter module or a scale bridge,
/// immutable once loaded from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Unique device identifier.
    pub device_id: String,
    /// Transport-level connection details.
    pub connection: DeviceConnection,
    /// Per-request timeout in milliseconds (1000-30000).
    pub timeout_ms: u64,
    /// Maximum retry attempts within a single tick (1-10).
    pub max_retry_attempts: u32,
    /// Base retry delay in milliseconds (100-10000), doubled per
    /// attempt up to `timeout_ms`.
    pub retry_delay_ms: u64,
    /// Ordered list of channels polled on this device.
    pub channels: Vec<ChannelSpec>,
}

impl DeviceSpec {
    /// Per-request timeout as a `Duration`.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Base retry delay as a `Duration`.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Channels in configured order, skipping disabled ones.
    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelSpec> {
        self.channels.iter().filter(|c| c.enabled)
    }
}

/// Outcome classification for a single reading, per spec.md §3/§4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// In range, rate within bounds.
    Good,
    /// In range but rate of change exceeds `max_rate_of_change`.
    Uncertain,
    /// Outside configured range, no wrap suspected.
    Bad,
    /// Request exceeded `timeout_ms` after exhausting retries.
    Timeout,
    /// Transport failed (connection refused/reset) after retries.
    DeviceFailure,
    /// A configuration invariant failed at runtime.
    ConfigurationError,
    /// Outside range but a counter wrap explains the value.
    Overflow,
}

impl Quality {
    /// Readings at this quality are written to the time-series store.
    #[must_use]
    pub fn is_storable(self) -> bool {
        matches!(self, Quality::Good | Quality::Uncertain)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Quality::Good => "good",
            Quality::Uncertain => "uncertain",
            Quality::Bad => "bad",
            Quality::Timeout => "timeout",
            Quality::DeviceFailure => "device_failure",
            Quality::ConfigurationError => "configuration_error",
            Quality::Overflow => "overflow",
        };
        write!(f, "{s}")
    }
}

/// One reading produced for one channel on one poll tick.
///
/// Exactly one `Reading` is emitted per enabled channel per tick,
/// regardless of quality — failures are represented as a quality
/// value plus `error`, never as a missing reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    /// Owning device.
    pub device_id: String,
    /// Channel number within the device.
    pub channel: u8,
    /// Raw register/field value before scaling.
    pub raw_value: i64,
    /// Wall-clock time the reading was taken.
    pub timestamp: SystemTime,
    /// `raw_value * scale_factor + offset`, present for storable
    /// qualities.
    pub processed_value: Option<f64>,
    /// Instantaneous rate in units/second, `None` until a second
    /// sample exists in the rate window.
    pub rate: Option<f64>,
    /// Classification per [`Quality`].
    pub quality: Quality,
    /// Engineering unit label, copied from the channel.
    pub unit: String,
    /// Wall-clock time spent acquiring this reading (connect + I/O).
    pub acquisition_time: Duration,
    /// Enriched tags: channel tags, device tags, and the enrichment
    /// keys `source`, `channel_name`, `device_id`, `timestamp` (RFC
    /// 3339) added by the transformer.
    pub tags: BTreeMap<String, String>,
    /// Human-readable error detail when quality is not `Good`.
    pub error: Option<String>,
}

/// Coarse device status derived by the health monitor, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Connected, no recent failures.
    Online,
    /// Connected but `0 < consecutive_failures < max_retry_attempts`.
    Warning,
    /// `consecutive_failures >= max_retry_attempts`.
    Error,
    /// Not currently connected.
    Offline,
    /// No polls attempted yet.
    Unknown,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Warning => "warning",
            DeviceStatus::Error => "error",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Derived device health, emitted on transition and on a fixed
/// heartbeat interval; never persisted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceHealth {
    /// Device this health snapshot describes.
    pub device_id: String,
    /// Current status per [`DeviceStatus`].
    pub status: DeviceStatus,
    /// Consecutive failed ticks since the last success.
    pub consecutive_failures: u32,
    /// Total read attempts since the poller started.
    pub total_reads: u64,
    /// Successful reads since the poller started.
    pub successful_reads: u64,
    /// Most recent error message, if any.
    pub last_error: Option<String>,
    /// Exponentially-weighted moving average of request latency in
    /// milliseconds, alpha = 0.2.
    pub avg_latency_ms: f64,
    /// When this snapshot was produced.
    pub timestamp: SystemTime,
}
