//! End-to-end scenarios from spec.md §8, exercised against the public
//! surface of each crate: a device poller driven by a scripted
//! channel reader and fake clock for the polling scenarios, the
//! discovery engine directly for the discovery scenario, and the
//! time-series writer against a scripted backend for the writer
//! outage scenario.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use collector_common::{
    ChannelSpec, Clock, DeviceConnection, DeviceSpec, DeviceStatus, Quality, TransportError, WordOrder,
};
use collector_discovery::{DiscoveryEngine, DiscoveryOutcome, FieldKind, TemplateRepository};
use collector_poller::{ChannelReader, DevicePollerBuilder, PipelineBus};
use collector_writer::{DeviceMetadata, FieldValue, Point, TimeSeriesWriter, TimeSeriesWriterConfig, WriteBackend, WriterBackendError};

/// A clock whose `now()` only advances when `sleep` is awaited,
/// giving every test a deterministic, instantly-resolving timeline.
struct FakeClock {
    time: Mutex<SystemTime>,
}

impl FakeClock {
    fn new(start: SystemTime) -> Self {
        Self { time: Mutex::new(start) }
    }

    fn set(&self, t: SystemTime) {
        *self.time.lock().unwrap() = t;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.time.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        let mut t = self.time.lock().unwrap();
        *t += duration;
        Box::pin(std::future::ready(()))
    }
}

/// A `ChannelReader` that replays a scripted sequence of register
/// values, one per tick, never failing to connect. Once the scripted
/// queue is exhausted, `fallback` (if set) is cloned and returned
/// forever rather than a one-shot "script exhausted" error, so a
/// reader can model a transport that fails every read indefinitely
/// (needed since `read_channel_with_retry` consumes up to
/// `max_retry_attempts` reads per tick, not one).
struct ScriptedRegisterReader {
    values: VecDeque<Result<i64, TransportError>>,
    fallback: Option<TransportError>,
    connected: bool,
}

impl ScriptedRegisterReader {
    fn new(values: Vec<Result<i64, TransportError>>) -> Self {
        Self { values: values.into(), fallback: None, connected: false }
    }

    /// A reader whose every read, on every attempt and every tick,
    /// fails with a clone of `err`.
    fn always_failing(err: TransportError) -> Self {
        Self { values: VecDeque::new(), fallback: Some(err), connected: false }
    }
}

#[async_trait]
impl ChannelReader for ScriptedRegisterReader {
    async fn ensure_connected(&mut self, _deadline: Duration) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    async fn read_channel(&mut self, _channel: &ChannelSpec, _deadline: Duration) -> Result<i64, TransportError> {
        match self.values.pop_front() {
            Some(result) => result,
            None => Err(self.fallback.clone().unwrap_or_else(|| TransportError::Protocol("script exhausted".into()))),
        }
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

fn counter_device() -> DeviceSpec {
    DeviceSpec {
        device_id: "D1".into(),
        connection: DeviceConnection::ModbusTcp { host: "127.0.0.1".into(), port: 502, unit_id: 1 },
        timeout_ms: 1000,
        max_retry_attempts: 3,
        retry_delay_ms: 100,
        channels: vec![ChannelSpec {
            channel_number: 0,
            name: "flow".into(),
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

#[tokio::test]
async fn scenario_1_happy_path_first_sample_has_no_rate() {
    let bus = PipelineBus::new();
    let mut readings = bus.subscribe_readings();
    let clock = Arc::new(FakeClock::new(SystemTime::UNIX_EPOCH));
    let reader = ScriptedRegisterReader::new(vec![Ok(100)]);
    let mut poller = DevicePollerBuilder::new(counter_device())
        .reader(Box::new(reader))
        .clock(clock)
        .build(bus)
        .unwrap();

    poller.run_tick().await;

    let reading = readings.recv().await.unwrap();
    assert_eq!(reading.raw_value, 100);
    assert_eq!(reading.processed_value, Some(100.0));
    assert_eq!(reading.quality, Quality::Good);
    assert_eq!(reading.rate, None);
}

#[tokio::test]
async fn scenario_2_rate_over_window() {
    let bus = PipelineBus::new();
    let mut readings = bus.subscribe_readings();
    let clock = Arc::new(FakeClock::new(SystemTime::UNIX_EPOCH));
    let reader = ScriptedRegisterReader::new(vec![Ok(100), Ok(200)]);
    let mut poller = DevicePollerBuilder::new(counter_device())
        .reader(Box::new(reader))
        .clock(Arc::clone(&clock) as Arc<dyn Clock>)
        .rate_window(Duration::from_secs(12))
        .build(bus)
        .unwrap();

    poller.run_tick().await;
    let _ = readings.recv().await.unwrap();

    clock.set(SystemTime::UNIX_EPOCH + Duration::from_secs(10));
    poller.run_tick().await;
    let reading = readings.recv().await.unwrap();

    assert_eq!(reading.raw_value, 200);
    assert_eq!(reading.rate, Some(10.0));
    assert_eq!(reading.quality, Quality::Good);
}

#[tokio::test]
async fn scenario_3_counter_wrap_is_detected_with_positive_rate() {
    let bus = PipelineBus::new();
    let mut readings = bus.subscribe_readings();
    let clock = Arc::new(FakeClock::new(SystemTime::UNIX_EPOCH));
    let reader = ScriptedRegisterReader::new(vec![Ok(100), Ok(200), Ok(i64::from(u32::MAX) - 11), Ok(20)]);
    let mut poller = DevicePollerBuilder::new(counter_device())
        .reader(Box::new(reader))
        .clock(Arc::clone(&clock) as Arc<dyn Clock>)
        // Wide enough to keep the 0s->10s gap for scenario 2's rate, narrow
        // enough that the 10s sample ages out by the 25s tick, leaving just
        // the 20s/25s pair to anchor the wrap-adjusted rate.
        .rate_window(Duration::from_secs(12))
        .build(bus)
        .unwrap();

    let mut last_reading = None;
    for secs in [0u64, 10, 20, 25] {
        clock.set(SystemTime::UNIX_EPOCH + Duration::from_secs(secs));
        poller.run_tick().await;
        last_reading = Some(readings.recv().await.unwrap());
    }
    let reading = last_reading.unwrap();

    assert_eq!(reading.raw_value, 20);
    assert_eq!(reading.rate, Some(6.4));
    assert_eq!(reading.tags.get("overflow").map(String::as_str), Some("true"));
}

#[tokio::test]
async fn scenario_4_transport_failure_storm_warns_then_errors_without_offline() {
    let bus = PipelineBus::new();
    let mut readings = bus.subscribe_readings();
    let mut health = bus.subscribe_health();
    let clock = Arc::new(FakeClock::new(SystemTime::UNIX_EPOCH));
    // Every attempt on every tick fails: `read_channel_with_retry` burns up
    // to `max_retry_attempts` reads per tick, so a finite script would be
    // exhausted well before 10 ticks of failures are observed.
    let reader = ScriptedRegisterReader::always_failing(TransportError::Transport("unreachable".into()));
    let mut poller = DevicePollerBuilder::new(counter_device())
        .reader(Box::new(reader))
        .clock(clock)
        // Publish a health snapshot on every tick regardless of heartbeat
        // timing, since nothing here advances wall-clock time between
        // ticks (only retry backoff does, via the injected clock's sleep).
        .health_check_interval(Duration::ZERO)
        .build(bus)
        .unwrap();

    let mut failure_count = 0;
    let mut statuses = Vec::new();
    for _ in 0..10 {
        poller.run_tick().await;
        let reading = readings.recv().await.unwrap();
        assert_eq!(reading.quality, Quality::DeviceFailure);
        failure_count += 1;

        health.changed().await.unwrap();
        statuses.push(health.borrow().get("D1").unwrap().status);
    }

    assert_eq!(failure_count, 10);
    assert_eq!(statuses[0], DeviceStatus::Warning, "first failure should warn, not go offline");
    assert!(statuses[2..].iter().all(|s| *s == DeviceStatus::Error), "consecutive_failures >= max_retry_attempts should error");
    assert!(!statuses.iter().any(|s| *s == DeviceStatus::Offline), "reads failing on an otherwise-reachable transport must not report offline");
}

#[test]
fn scenario_5_discovery_from_three_captures_persists_template() {
    let repo = TemplateRepository::new();
    let engine = DiscoveryEngine::new(&repo, 85.0);
    let mut session = engine.start_session();
    session.capture_baseline(b"US    0.00 kg\r\n");
    session.step(1.0, b"ST    1.00 kg\r\n");
    session.step(2.0, b"ST    2.00 kg\r\n");

    let outcome = engine.finish(&session, "tmpl-dock-scale", "Dock Scale").unwrap();
    let DiscoveryOutcome::Accepted(template) = outcome else {
        panic!("expected acceptance");
    };

    assert_eq!(template.delimiter, b"\r\n");
    assert!(template.confidence_score >= 85.0);

    let stability = template.fields.iter().find(|f| f.name == "stability").unwrap();
    assert_eq!((stability.start, stability.length), (0, 2));
    let FieldKind::Lookup { table } = &stability.kind else { panic!("expected lookup field") };
    assert_eq!(table.get("US").map(String::as_str), Some("unstable"));
    assert_eq!(table.get("ST").map(String::as_str), Some("stable"));

    let weight = template.fields.iter().find(|f| f.name == "weight").unwrap();
    assert_eq!(weight.kind, FieldKind::Numeric { decimal_places: 2 });

    assert!(repo.get("tmpl-dock-scale").is_some(), "accepted template must be persisted");
}

/// A backend that fails every call until `fail_until_call` attempts
/// have been made, then succeeds, recording every batch it accepted.
///
/// `TimeSeriesWriter` takes its backend by value, so `accepted` is kept
/// behind an `Arc` that's cloned out before the backend itself is moved
/// into the writer, the same shape `RecordingBackend` gives its own
/// in-crate tests via direct field access.
struct FlakyBackend {
    attempts: Arc<AtomicUsize>,
    fail_until_call: usize,
    accepted: Arc<Mutex<Vec<Vec<Point>>>>,
}

impl FlakyBackend {
    fn new(fail_until_call: usize) -> Self {
        Self { attempts: Arc::new(AtomicUsize::new(0)), fail_until_call, accepted: Arc::new(Mutex::new(Vec::new())) }
    }

    fn accepted_handle(&self) -> Arc<Mutex<Vec<Vec<Point>>>> {
        Arc::clone(&self.accepted)
    }
}

#[async_trait]
impl WriteBackend for FlakyBackend {
    async fn write_batch(&self, batch: &[Point]) -> Result<(), WriterBackendError> {
        let call = self.attempts.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_until_call {
            return Err(WriterBackendError("503 service unavailable".into()));
        }
        self.accepted.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

fn good_reading(device_id: &str, raw: i64) -> collector_common::Reading {
    collector_common::Reading {
        device_id: device_id.into(),
        channel: 0,
        raw_value: raw,
        timestamp: SystemTime::UNIX_EPOCH,
        processed_value: Some(raw as f64),
        rate: None,
        quality: Quality::Good,
        unit: "count".into(),
        acquisition_time: Duration::from_millis(5),
        tags: BTreeMap::new(),
        error: None,
    }
}

#[tokio::test]
async fn scenario_6_writer_outage_buffers_then_drains_in_order_and_counts_drops() {
    let clock = Arc::new(FakeClock::new(SystemTime::UNIX_EPOCH));
    // The first 3 write attempts fail (the "503 for a while" outage);
    // everything from the 4th attempt onward succeeds.
    let backend = FlakyBackend::new(3);
    let accepted = backend.accepted_handle();
    let config = TimeSeriesWriterConfig {
        batch_size: 1,
        max_batch_bytes: usize::MAX,
        flush_interval: Duration::from_secs(5),
        max_buffered_batches: 3,
        flush_timeout: Duration::from_secs(10),
    };
    let (mut writer, dropped) = TimeSeriesWriter::with_clock(
        backend,
        HashMap::from([("D1".to_string(), DeviceMetadata::default())]),
        config,
        clock.clone() as Arc<dyn Clock>,
    );

    // Six readings arrive one per tick; each becomes its own batch
    // (batch_size=1). The clock jumps far ahead of any backoff window
    // before each flush so every tick attempts a write.
    for raw in 0..6i64 {
        writer.ingest(&good_reading("D1", raw));
        clock.set(clock.now() + Duration::from_secs(100));
        writer.try_flush().await;
    }

    // Batch 0 is buffered behind 2 failing retries before the 3-deep
    // queue fills and it gets dropped to make room for batch 3; batches
    // 1-5 all eventually succeed, in order, once the backend recovers.
    assert_eq!(dropped.get(), 1, "only the oldest batch should be dropped once the buffer fills");

    let accepted = accepted.lock().unwrap();
    let accepted_raw: Vec<i64> = accepted
        .iter()
        .map(|batch| match batch[0].fields.get("raw_value") {
            Some(FieldValue::Int(v)) => *v,
            other => panic!("expected raw_value field, got {other:?}"),
        })
        .collect();
    assert_eq!(accepted_raw, vec![1, 2, 3, 4, 5], "buffered batches must be written in order, oldest first");
}
