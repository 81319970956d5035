//! Fleet health summary and metrics export.
//!
//! Adapted from the teacher's `DiagnosticsCollector`/
//! `format_prometheus_metrics`: instead of deriving one process's
//! health from cycle-overrun counters, this derives a fleet-wide
//! summary from the Health topic's per-device snapshots plus the
//! writer's dropped-points counter.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use collector_common::{DeviceHealth, DeviceStatus};

/// Fleet-wide health, worse-case across devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetStatus {
    /// Every device is `Online`.
    Healthy,
    /// At least one device is `Warning`, none worse.
    Degraded,
    /// At least one device is `Error` or `Offline`.
    Unhealthy,
    /// No devices configured, or none have reported yet.
    Starting,
}

impl std::fmt::Display for FleetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FleetStatus::Healthy => "healthy",
            FleetStatus::Degraded => "degraded",
            FleetStatus::Unhealthy => "unhealthy",
            FleetStatus::Starting => "starting",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time rollup of every device's latest health plus
/// writer backpressure, for logging or export.
#[derive(Debug, Clone)]
pub struct DiagnosticsSnapshot {
    /// Worst-case status across the fleet.
    pub fleet_status: FleetStatus,
    /// Daemon uptime since [`DiagnosticsCollector::new`].
    pub uptime: Duration,
    /// Latest health per device.
    pub devices: HashMap<String, DeviceHealth>,
    /// Total points dropped by the writer's backpressure policy.
    pub dropped_points: u64,
}

/// Derives fleet status and builds snapshots; owns nothing mutable of
/// its own beyond a start time, since per-device state already lives
/// on the Health topic.
pub struct DiagnosticsCollector {
    start_time: Instant,
}

impl Default for DiagnosticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsCollector {
    /// Start a new collector, timing uptime from now.
    #[must_use]
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    /// Worst-case status across every device's latest health.
    #[must_use]
    pub fn fleet_status(devices: &HashMap<String, DeviceHealth>) -> FleetStatus {
        if devices.is_empty() {
            return FleetStatus::Starting;
        }
        let mut worst = FleetStatus::Healthy;
        for health in devices.values() {
            worst = match health.status {
                DeviceStatus::Online => worst,
                DeviceStatus::Warning if worst == FleetStatus::Healthy => FleetStatus::Degraded,
                DeviceStatus::Warning => worst,
                DeviceStatus::Error | DeviceStatus::Offline => FleetStatus::Unhealthy,
                DeviceStatus::Unknown if worst == FleetStatus::Healthy => FleetStatus::Starting,
                DeviceStatus::Unknown => worst,
            };
        }
        worst
    }

    /// Build a snapshot from the current Health topic value and
    /// dropped-points count.
    #[must_use]
    pub fn snapshot(&self, devices: HashMap<String, DeviceHealth>, dropped_points: u64) -> DiagnosticsSnapshot {
        let fleet_status = Self::fleet_status(&devices);
        DiagnosticsSnapshot { fleet_status, uptime: self.start_time.elapsed(), devices, dropped_points }
    }
}

/// Format a snapshot as Prometheus text exposition format.
#[must_use]
pub fn format_prometheus_metrics(snapshot: &DiagnosticsSnapshot) -> String {
    let mut out = String::new();

    out.push_str("# HELP collector_fleet_healthy Fleet health status (1=healthy, 0=not healthy)\n");
    out.push_str("# TYPE collector_fleet_healthy gauge\n");
    out.push_str(&format!(
        "collector_fleet_healthy {{status=\"{}\"}} {}\n",
        snapshot.fleet_status,
        i32::from(snapshot.fleet_status == FleetStatus::Healthy)
    ));

    out.push_str("# HELP collector_uptime_seconds Daemon uptime in seconds\n");
    out.push_str("# TYPE collector_uptime_seconds gauge\n");
    out.push_str(&format!("collector_uptime_seconds {:.3}\n", snapshot.uptime.as_secs_f64()));

    out.push_str("# HELP collector_dropped_points_total Points dropped by writer backpressure\n");
    out.push_str("# TYPE collector_dropped_points_total counter\n");
    out.push_str(&format!("collector_dropped_points_total {}\n", snapshot.dropped_points));

    out.push_str("# HELP collector_device_status Per-device status (1=online, 0=not)\n");
    out.push_str("# TYPE collector_device_status gauge\n");
    for (device_id, health) in &snapshot.devices {
        out.push_str(&format!(
            "collector_device_status {{device_id=\"{device_id}\",status=\"{}\"}} {}\n",
            health.status,
            i32::from(health.status == DeviceStatus::Online)
        ));
    }

    out.push_str("# HELP collector_device_consecutive_failures Consecutive failed poll ticks\n");
    out.push_str("# TYPE collector_device_consecutive_failures gauge\n");
    for (device_id, health) in &snapshot.devices {
        out.push_str(&format!(
            "collector_device_consecutive_failures {{device_id=\"{device_id}\"}} {}\n",
            health.consecutive_failures
        ));
    }

    out.push_str("# HELP collector_device_avg_latency_ms EWMA request latency in milliseconds\n");
    out.push_str("# TYPE collector_device_avg_latency_ms gauge\n");
    for (device_id, health) in &snapshot.devices {
        out.push_str(&format!("collector_device_avg_latency_ms {{device_id=\"{device_id}\"}} {:.3}\n", health.avg_latency_ms));
    }

    out
}
