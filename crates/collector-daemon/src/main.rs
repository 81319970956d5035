//! Acquisition daemon entry point.
//!
//! Loads configuration, starts the collector (every configured
//! device's poller plus the writer), logs periodic fleet diagnostics,
//! and shuts down gracefully on SIGTERM/SIGINT.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use collector_common::RuntimeConfig;
use collector_daemon::diagnostics::DiagnosticsCollector;
use collector_daemon::signals::wait_for_shutdown_signal;
use collector_daemon::start;
use collector_discovery::TemplateRepository;
use tracing::{info, warn};

/// Acquisition daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "collector-daemon", about = "ADAM counter and scale acquisition daemon", version, long_about = None)]
struct Args {
    /// Path to a runtime configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Time-series write endpoint URL.
    #[arg(long, default_value = "http://127.0.0.1:8086/write")]
    write_url: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,

    /// Seconds between periodic fleet diagnostics log lines.
    #[arg(long, default_value = "60")]
    diagnostics_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "starting acquisition daemon");

    let config = load_config(&args)?;
    info!(devices = config.devices.len(), poll_interval_ms = config.poll_interval_ms, "configuration loaded");

    let templates = Arc::new(TemplateRepository::new());
    let collector = start(config, templates, args.write_url.clone()).await.context("failed to start collector")?;

    let diagnostics = DiagnosticsCollector::new();
    let diagnostics_interval = std::time::Duration::from_secs(args.diagnostics_interval_secs.max(1));
    let mut health_rx = collector.subscribe_health();

    tokio::select! {
        signal = wait_for_shutdown_signal() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to install signal handlers, shutting down anyway");
            }
        }
        () = report_diagnostics_until_shutdown(&diagnostics, &mut health_rx, &collector, diagnostics_interval) => {}
    }

    info!("shutting down");
    collector.stop().await;
    info!("shutdown complete");
    Ok(())
}

/// Periodically log a fleet diagnostics snapshot. Runs forever; only
/// meant to race against the shutdown signal in `main`'s `select!`.
async fn report_diagnostics_until_shutdown(
    diagnostics: &DiagnosticsCollector,
    health_rx: &mut tokio::sync::watch::Receiver<std::collections::HashMap<String, collector_common::DeviceHealth>>,
    collector: &collector_daemon::CollectorHandle,
    interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let devices = health_rx.borrow().clone();
        let snapshot = diagnostics.snapshot(devices, collector.dropped_points());
        info!(
            fleet_status = %snapshot.fleet_status,
            uptime_secs = snapshot.uptime.as_secs(),
            dropped_points = snapshot.dropped_points,
            devices = snapshot.devices.len(),
            "periodic fleet diagnostics"
        );
    }
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "collector_daemon={level},collector_poller={level},collector_writer={level},collector_pipeline={level},collector_transport={level},collector_discovery={level},collector_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)))
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file, or fall back to built-in defaults.
fn load_config(args: &Args) -> Result<RuntimeConfig> {
    if let Some(config_path) = &args.config {
        RuntimeConfig::from_file(config_path).with_context(|| format!("failed to load config from {config_path:?}"))
    } else {
        let default_path = PathBuf::from("config/default.toml");
        if default_path.exists() {
            info!(?default_path, "using default configuration file");
            RuntimeConfig::from_file(&default_path).with_context(|| format!("failed to load default config from {default_path:?}"))
        } else {
            info!("no config file found, using built-in defaults");
            Ok(RuntimeConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_with_config_and_write_url() {
        let args = Args::parse_from(["collector-daemon", "-c", "test.toml", "--write-url", "http://localhost:9999/write"]);
        assert_eq!(args.config, Some(PathBuf::from("test.toml")));
        assert_eq!(args.write_url, "http://localhost:9999/write");
    }

    #[test]
    fn args_default_write_url() {
        let args = Args::parse_from(["collector-daemon"]);
        assert_eq!(args.write_url, "http://127.0.0.1:8086/write");
        assert!(args.config.is_none());
    }

    #[test]
    fn default_config_validates() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }
}
