//! Collector engine: turns a [`RuntimeConfig`] into a running fleet of
//! device pollers, a writer, and a discovery surface, behind
//! `Start`/`Stop` (spec.md §6's "Exposed operations to
//! collaborators"). `main.rs` is a thin CLI shell around this.

pub mod diagnostics;
pub mod signals;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use collector_common::{DeviceConnection, DeviceHealth, Reading, RuntimeConfig};
use collector_discovery::{
    DiscoveryEngine, DiscoveryError, DiscoveryOutcome, DiscoverySession, ProtocolTemplate, TemplateError, TemplateRepository,
};
use collector_poller::{ChannelReader, DevicePollerBuilder, ModbusChannelReader, PipelineBus, ScaleChannelReader};
use collector_transport::modbus::ModbusTcpClient;
use collector_transport::scale::ScaleSocketClient;
use collector_writer::{DeviceMetadata, DroppedPointsCounter, HttpLineProtocolBackend, ScaleMetadata, TimeSeriesWriter, TimeSeriesWriterConfig};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Default discovery confidence threshold (spec.md §4.8).
const DEFAULT_DISCOVERY_CONFIDENCE: f64 = 85.0;

/// Failures that can prevent the collector from starting.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// A scale device references a template that isn't in the
    /// repository yet.
    #[error("device '{device_id}' references unknown template '{template_id}'")]
    MissingTemplate {
        /// Device that referenced the template.
        device_id: String,
        /// Template id that could not be found.
        template_id: String,
    },
    /// A poller could not be assembled (builder precondition unmet).
    #[error("poller for device '{device_id}' could not be built: {reason}")]
    PollerBuild {
        /// Device the poller was being built for.
        device_id: String,
        /// Builder's rejection reason.
        reason: &'static str,
    },
}

/// A running collector: device pollers, the writer, and the
/// latest-reading cache, all feeding off one [`PipelineBus`].
///
/// `Start` (via [`start`]) returns only after every poller and the
/// writer have been spawned and the bus is live, per spec.md §9's
/// "no work happens before Start" design note.
pub struct CollectorHandle {
    bus: PipelineBus,
    templates: Arc<TemplateRepository>,
    discovery_confidence_threshold: f64,
    latest: Arc<Mutex<HashMap<(String, u8), Reading>>>,
    dropped_points: DroppedPointsCounter,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Start every configured device's poller plus the time-series writer.
///
/// `templates` is shared with discovery sessions started later via
/// [`CollectorHandle::start_discovery`]; devices with a scale
/// connection must reference a template already present in it.
///
/// # Errors
///
/// Returns [`CollectorError`] if a scale device's template is
/// missing, or a poller fails to build.
pub async fn start(
    config: RuntimeConfig,
    templates: Arc<TemplateRepository>,
    write_url: impl Into<String>,
) -> Result<CollectorHandle, CollectorError> {
    let bus = PipelineBus::new();
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    let mut device_metadata = HashMap::new();

    for device in &config.devices {
        let mut metadata = DeviceMetadata { device_name: device.device_id.clone(), scale: None };

        let reader: Box<dyn ChannelReader> = match &device.connection {
            DeviceConnection::ModbusTcp { host, port, unit_id } => {
                Box::new(ModbusChannelReader::new(ModbusTcpClient::new(host.clone(), *port, *unit_id)))
            }
            DeviceConnection::ScaleSocket { host, port, template_id } => {
                let template = templates.get(template_id).ok_or_else(|| CollectorError::MissingTemplate {
                    device_id: device.device_id.clone(),
                    template_id: template_id.clone(),
                })?;
                metadata.scale = Some(ScaleMetadata {
                    manufacturer: String::new(),
                    model: String::new(),
                    protocol: template_id.clone(),
                });
                Box::new(ScaleChannelReader::new(ScaleSocketClient::new(host.clone(), *port), template))
            }
        };

        device_metadata.insert(device.device_id.clone(), metadata);

        let poller = DevicePollerBuilder::new(device.clone())
            .reader(reader)
            .health_check_interval(Duration::from_millis(config.health_check_interval_ms))
            .build(bus.clone())
            .map_err(|reason| CollectorError::PollerBuild { device_id: device.device_id.clone(), reason })?;

        let poll_interval = Duration::from_millis(config.poll_interval_ms);
        tasks.push(tokio::spawn(poller.run(poll_interval, stop_rx.clone())));
        info!(device_id = %device.device_id, "poller started");
    }

    let latest: Arc<Mutex<HashMap<(String, u8), Reading>>> = Arc::new(Mutex::new(HashMap::new()));
    tasks.push(tokio::spawn(run_latest_reading_cache(Arc::clone(&latest), bus.subscribe_readings(), stop_rx.clone())));

    let backend = HttpLineProtocolBackend::new(write_url);
    let writer_config = TimeSeriesWriterConfig {
        batch_size: config.writer.batch_size,
        flush_interval: config.writer.flush_interval,
        max_buffered_batches: config.writer.max_buffered_batches,
        flush_timeout: config.writer.flush_timeout,
        ..TimeSeriesWriterConfig::default()
    };
    let (writer, dropped_points) = TimeSeriesWriter::new(backend, device_metadata, writer_config);
    tasks.push(tokio::spawn(writer.run(bus.subscribe_readings(), stop_rx.clone())));

    info!(devices = config.devices.len(), "collector started");

    Ok(CollectorHandle {
        bus,
        templates,
        discovery_confidence_threshold: DEFAULT_DISCOVERY_CONFIDENCE,
        latest,
        dropped_points,
        stop_tx,
        tasks,
    })
}

async fn run_latest_reading_cache(
    latest: Arc<Mutex<HashMap<(String, u8), Reading>>>,
    mut readings: collector_poller::ReadingSubscriber,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe_reading = readings.recv() => {
                match maybe_reading {
                    Some(reading) => {
                        latest.lock().unwrap().insert((reading.device_id.clone(), reading.channel), reading);
                    }
                    None => break,
                }
            }
            result = stop.changed() => {
                if result.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
}

impl CollectorHandle {
    /// Subscribe to the Readings topic.
    #[must_use]
    pub fn subscribe_readings(&self) -> collector_poller::ReadingSubscriber {
        self.bus.subscribe_readings()
    }

    /// Subscribe to the Health topic (coalesced to latest per device).
    #[must_use]
    pub fn subscribe_health(&self) -> tokio::sync::watch::Receiver<HashMap<String, DeviceHealth>> {
        self.bus.subscribe_health()
    }

    /// Most recent Reading seen for a (device, channel) pair, if any.
    #[must_use]
    pub fn latest_reading(&self, device_id: &str, channel: u8) -> Option<Reading> {
        self.latest.lock().unwrap().get(&(device_id.to_string(), channel)).cloned()
    }

    /// Total points dropped by writer backpressure since `Start`.
    #[must_use]
    pub fn dropped_points(&self) -> u64 {
        self.dropped_points.get()
    }

    /// Start an interactive discovery session against the shared
    /// template repository.
    #[must_use]
    pub fn start_discovery(&self) -> DiscoverySession {
        DiscoveryEngine::new(&self.templates, self.discovery_confidence_threshold).start_session()
    }

    /// Finish a discovery session, persisting the result under
    /// `template_id`/`name` if accepted.
    ///
    /// # Errors
    ///
    /// Propagates [`DiscoveryError`] from the session or the
    /// repository write.
    pub fn finish_discovery(
        &self,
        session: &DiscoverySession,
        template_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<DiscoveryOutcome, DiscoveryError> {
        DiscoveryEngine::new(&self.templates, self.discovery_confidence_threshold).finish(session, template_id, name)
    }

    /// List templates whose id or name contains `filter`.
    #[must_use]
    pub fn list_templates(&self, filter: &str) -> Vec<ProtocolTemplate> {
        self.templates.list(filter)
    }

    /// Fetch one template by id.
    #[must_use]
    pub fn get_template(&self, id: &str) -> Option<ProtocolTemplate> {
        self.templates.get(id)
    }

    /// Publish or replace a template.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] if `template` fails its own
    /// validation.
    pub fn put_template(&self, template: ProtocolTemplate) -> Result<(), TemplateError> {
        self.templates.put(template)
    }

    /// Remove a template by id.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] if no such template exists.
    pub fn delete_template(&self, id: &str) -> Result<(), TemplateError> {
        self.templates.delete(id)
    }

    /// Stop every poller and the writer, waiting for each task's
    /// graceful shutdown (the writer's final flush included).
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("collector stopped");
    }
}
