//! Per-device health derivation (spec.md §4.5), adapted from the
//! teacher's watchdog: an atomic kick/timeout pattern here tracking
//! consecutive failures and latency instead of a single fault bit.

use std::time::{Duration, SystemTime};

use collector_common::{DeviceHealth, DeviceStatus};

/// EWMA smoothing factor for latency averaging, fixed per spec.md §4.5.
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Tracks one device's consecutive-failure count, read counters, and
/// latency average, deriving [`DeviceStatus`] and emitting
/// [`DeviceHealth`] snapshots on transition or heartbeat.
pub struct HealthMonitor {
    device_id: String,
    max_retry_attempts: u32,
    connected: bool,
    consecutive_failures: u32,
    total_reads: u64,
    successful_reads: u64,
    last_error: Option<String>,
    avg_latency_ms: f64,
    last_status: Option<DeviceStatus>,
    last_heartbeat: Option<SystemTime>,
    heartbeat_interval: Duration,
}

/// Outcome of one [`HealthMonitor::record_attempt`] call: whether a
/// snapshot should be published this tick.
pub struct HealthUpdate {
    /// Current derived health snapshot.
    pub health: DeviceHealth,
    /// Whether the status changed, or the heartbeat interval elapsed,
    /// since the last published snapshot.
    pub should_publish: bool,
}

impl HealthMonitor {
    /// Create a monitor for `device_id`, deriving `Error` once
    /// `consecutive_failures` reaches `max_retry_attempts`.
    #[must_use]
    pub fn new(device_id: impl Into<String>, max_retry_attempts: u32, heartbeat_interval: Duration) -> Self {
        Self {
            device_id: device_id.into(),
            max_retry_attempts,
            connected: false,
            consecutive_failures: 0,
            total_reads: 0,
            successful_reads: 0,
            last_error: None,
            avg_latency_ms: 0.0,
            last_status: None,
            last_heartbeat: None,
            heartbeat_interval,
        }
    }

    /// Record a connection transition (lazy reconnect success/failure).
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Record the outcome of one channel read attempt and return the
    /// updated snapshot, with `should_publish` set on status
    /// transition or elapsed heartbeat.
    pub fn record_attempt(&mut self, now: SystemTime, success: bool, latency: Duration, error: Option<String>) -> HealthUpdate {
        self.total_reads += 1;
        if success {
            self.successful_reads += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            self.last_error = error;
        }

        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms = if self.total_reads == 1 {
            latency_ms
        } else {
            LATENCY_EWMA_ALPHA * latency_ms + (1.0 - LATENCY_EWMA_ALPHA) * self.avg_latency_ms
        };

        let status = self.derive_status();
        let heartbeat_elapsed = match self.last_heartbeat {
            Some(last) => now.duration_since(last).map(|d| d >= self.heartbeat_interval).unwrap_or(true),
            None => true,
        };
        let should_publish = self.last_status != Some(status) || heartbeat_elapsed;
        if should_publish {
            self.last_heartbeat = Some(now);
        }
        self.last_status = Some(status);

        HealthUpdate {
            health: DeviceHealth {
                device_id: self.device_id.clone(),
                status,
                consecutive_failures: self.consecutive_failures,
                total_reads: self.total_reads,
                successful_reads: self.successful_reads,
                last_error: self.last_error.clone(),
                avg_latency_ms: self.avg_latency_ms,
                timestamp: now,
            },
            should_publish,
        }
    }

    fn derive_status(&self) -> DeviceStatus {
        if !self.connected {
            return DeviceStatus::Offline;
        }
        if self.consecutive_failures >= self.max_retry_attempts {
            DeviceStatus::Error
        } else if self.consecutive_failures > 0 {
            DeviceStatus::Warning
        } else {
            DeviceStatus::Online
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn offline_until_connected() {
        let mut monitor = HealthMonitor::new("d1", 3, Duration::from_secs(30));
        let update = monitor.record_attempt(t(0), true, Duration::from_millis(10), None);
        assert_eq!(update.health.status, DeviceStatus::Offline);
    }

    #[test]
    fn online_after_clean_success() {
        let mut monitor = HealthMonitor::new("d1", 3, Duration::from_secs(30));
        monitor.set_connected(true);
        let update = monitor.record_attempt(t(0), true, Duration::from_millis(10), None);
        assert_eq!(update.health.status, DeviceStatus::Online);
        assert!(update.should_publish);
    }

    #[test]
    fn warning_then_error_on_repeated_failure() {
        let mut monitor = HealthMonitor::new("d1", 2, Duration::from_secs(30));
        monitor.set_connected(true);
        let first = monitor.record_attempt(t(0), false, Duration::from_millis(10), Some("timeout".into()));
        assert_eq!(first.health.status, DeviceStatus::Warning);
        let second = monitor.record_attempt(t(1), false, Duration::from_millis(10), Some("timeout".into()));
        assert_eq!(second.health.status, DeviceStatus::Error);
        assert_eq!(second.health.consecutive_failures, 2);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut monitor = HealthMonitor::new("d1", 2, Duration::from_secs(30));
        monitor.set_connected(true);
        monitor.record_attempt(t(0), false, Duration::from_millis(10), Some("e".into()));
        let update = monitor.record_attempt(t(1), true, Duration::from_millis(10), None);
        assert_eq!(update.health.status, DeviceStatus::Online);
        assert_eq!(update.health.consecutive_failures, 0);
    }

    #[test]
    fn latency_ewma_smooths_toward_new_samples() {
        let mut monitor = HealthMonitor::new("d1", 3, Duration::from_secs(30));
        monitor.set_connected(true);
        monitor.record_attempt(t(0), true, Duration::from_millis(100), None);
        let update = monitor.record_attempt(t(1), true, Duration::from_millis(200), None);
        // 0.2*200 + 0.8*100 = 120
        assert!((update.health.avg_latency_ms - 120.0).abs() < 1e-9);
    }

    #[test]
    fn heartbeat_forces_publish_without_status_change() {
        let mut monitor = HealthMonitor::new("d1", 3, Duration::from_secs(10));
        monitor.set_connected(true);
        let first = monitor.record_attempt(t(0), true, Duration::from_millis(10), None);
        assert!(first.should_publish);
        let quiet = monitor.record_attempt(t(1), true, Duration::from_millis(10), None);
        assert!(!quiet.should_publish);
        let heartbeat = monitor.record_attempt(t(11), true, Duration::from_millis(10), None);
        assert!(heartbeat.should_publish);
    }
}
