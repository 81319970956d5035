//! Batched, backoff-retrying time-series writer (spec.md §4.7).
//!
//! Grounded on `plc-fieldbus/src/modbus.rs`'s `try_reconnect` delay/
//! attempt pattern (fixed base delay, capped attempt count) adapted
//! here into unbounded exponential backoff over a bounded, drop-oldest
//! batch queue instead of a single reconnecting socket.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use collector_common::{Clock, SystemClock};
use collector_poller::ReadingSubscriber;
use tokio::sync::watch;
use tracing::{error, warn};

use crate::backend::WriteBackend;
use crate::converter::{reading_to_point, DeviceMetadata};
use crate::point::Point;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// One buffered batch of points awaiting a successful write, per
/// spec.md §3's `BatchEnvelope`.
#[derive(Debug, Clone, Default)]
pub struct BatchEnvelope {
    /// Points in flush order.
    pub points: Vec<Point>,
}

impl BatchEnvelope {
    fn bytes(&self) -> usize {
        self.points.iter().map(Point::approx_bytes).sum()
    }
}

/// Tunables for batching, buffering, and backoff.
#[derive(Debug, Clone)]
pub struct TimeSeriesWriterConfig {
    /// Flush once this many points have accumulated.
    pub batch_size: usize,
    /// Flush once the current batch's approximate wire size reaches
    /// this many bytes, even if `batch_size` hasn't been hit.
    pub max_batch_bytes: usize,
    /// Flush on this interval even if neither threshold above has
    /// been reached.
    pub flush_interval: Duration,
    /// Maximum number of buffered (unwritten) batches retained during
    /// an outage; beyond this, the oldest batch is dropped.
    pub max_buffered_batches: usize,
    /// Hard deadline for the shutdown flush attempt.
    pub flush_timeout: Duration,
}

impl Default for TimeSeriesWriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_batch_bytes: 512 * 1024,
            flush_interval: Duration::from_secs(5),
            max_buffered_batches: 10,
            flush_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared, lock-free counter for points dropped by backpressure,
/// exposed so a metrics exporter can read it without coupling to the
/// writer's internals.
#[derive(Debug, Clone, Default)]
pub struct DroppedPointsCounter(Arc<AtomicU64>);

impl DroppedPointsCounter {
    /// Current total dropped points since the writer started.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
}

/// Consumes Readings from the Pipeline Bus, batches them into
/// points, and writes them through a [`WriteBackend`] with
/// exponential backoff on failure.
pub struct TimeSeriesWriter<B: WriteBackend> {
    backend: B,
    metadata: HashMap<String, DeviceMetadata>,
    config: TimeSeriesWriterConfig,
    clock: Arc<dyn Clock>,
    current: Vec<Point>,
    pending: VecDeque<BatchEnvelope>,
    backoff: Duration,
    next_attempt_at: Option<SystemTime>,
    dropped_points: DroppedPointsCounter,
}

impl<B: WriteBackend> TimeSeriesWriter<B> {
    /// Build a writer over `backend`, keyed device metadata, and a
    /// config. Returns the writer plus a cheap-to-clone handle onto
    /// its dropped-points counter.
    #[must_use]
    pub fn new(backend: B, metadata: HashMap<String, DeviceMetadata>, config: TimeSeriesWriterConfig) -> (Self, DroppedPointsCounter) {
        Self::with_clock(backend, metadata, config, Arc::new(SystemClock))
    }

    /// As [`Self::new`], but with an injectable clock for
    /// deterministic backoff-schedule tests.
    #[must_use]
    pub fn with_clock(
        backend: B,
        metadata: HashMap<String, DeviceMetadata>,
        config: TimeSeriesWriterConfig,
        clock: Arc<dyn Clock>,
    ) -> (Self, DroppedPointsCounter) {
        let dropped_points = DroppedPointsCounter::default();
        let writer = Self {
            backend,
            metadata,
            config,
            clock,
            current: Vec::new(),
            pending: VecDeque::new(),
            backoff: BACKOFF_BASE,
            next_attempt_at: None,
            dropped_points: dropped_points.clone(),
        };
        (writer, dropped_points)
    }

    /// Drain the bus until `stop` is set, then run a best-effort
    /// shutdown flush before returning.
    pub async fn run(mut self, mut readings: ReadingSubscriber, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                maybe_reading = readings.recv() => {
                    match maybe_reading {
                        Some(reading) => self.ingest(&reading),
                        None => break,
                    }
                }
                _ = self.clock.sleep(self.config.flush_interval) => {
                    self.try_flush().await;
                }
                result = stop.changed() => {
                    if result.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
            if self.should_flush_now() {
                self.try_flush().await;
            }
        }
        self.shutdown_flush().await;
    }

    /// Convert one reading to a point (if storable) and buffer it.
    pub fn ingest(&mut self, reading: &collector_common::Reading) {
        let metadata = self.metadata.get(&reading.device_id).cloned().unwrap_or_default();
        if let Some(point) = reading_to_point(reading, &metadata) {
            self.current.push(point);
        }
    }

    fn should_flush_now(&self) -> bool {
        self.current.len() >= self.config.batch_size
            || self.current.iter().map(Point::approx_bytes).sum::<usize>() >= self.config.max_batch_bytes
    }

    /// Move the current batch into the pending queue (if non-empty)
    /// and attempt to drain the queue against the backend.
    pub async fn try_flush(&mut self) {
        if !self.current.is_empty() {
            let points = std::mem::take(&mut self.current);
            self.enqueue(BatchEnvelope { points });
        }
        self.drain_pending().await;
    }

    fn enqueue(&mut self, batch: BatchEnvelope) {
        while self.pending.len() >= self.config.max_buffered_batches {
            if let Some(dropped) = self.pending.pop_front() {
                let n = dropped.points.len() as u64;
                self.dropped_points.add(n);
                warn!(dropped = n, "writer buffer full, dropping oldest batch");
            } else {
                break;
            }
        }
        self.pending.push_back(batch);
    }

    async fn drain_pending(&mut self) {
        let now = self.clock.now();
        if let Some(next) = self.next_attempt_at {
            if now < next {
                return;
            }
        }
        while let Some(batch) = self.pending.front() {
            match self.backend.write_batch(&batch.points).await {
                Ok(()) => {
                    self.pending.pop_front();
                    self.backoff = BACKOFF_BASE;
                    self.next_attempt_at = None;
                }
                Err(err) => {
                    error!(error = %err, "writer backend failed, retaining batch for retry");
                    self.next_attempt_at = Some(self.clock.now() + self.backoff);
                    self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
                    break;
                }
            }
        }
    }

    /// Flush whatever is buffered within `flush_timeout`, dropping
    /// anything still unwritten past the deadline. Called once on
    /// shutdown; never retried.
    async fn shutdown_flush(&mut self) {
        if !self.current.is_empty() {
            let points = std::mem::take(&mut self.current);
            self.enqueue(BatchEnvelope { points });
        }
        let backend = &self.backend;
        let pending = &mut self.pending;
        let _ = tokio::time::timeout(self.config.flush_timeout, async {
            while let Some(batch) = pending.front() {
                match backend.write_batch(&batch.points).await {
                    Ok(()) => {
                        pending.pop_front();
                    }
                    Err(_) => break,
                }
            }
        })
        .await;

        if !self.pending.is_empty() {
            let remaining: u64 = self.pending.iter().map(|b| b.points.len() as u64).sum();
            warn!(remaining, "shutdown flush deadline exceeded, dropping buffered points");
            self.dropped_points.add(remaining);
            self.pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::backend::test_support::RecordingBackend;

    struct FakeClock(Mutex<SystemTime>);

    impl Clock for FakeClock {
        fn now(&self) -> SystemTime {
            *self.0.lock().unwrap()
        }

        fn sleep(&self, duration: Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
            *self.0.lock().unwrap() += duration;
            Box::pin(std::future::ready(()))
        }
    }

    fn reading(quality: collector_common::Quality) -> collector_common::Reading {
        collector_common::Reading {
            device_id: "adam-1".into(),
            channel: 0,
            raw_value: 10,
            timestamp: SystemTime::UNIX_EPOCH,
            processed_value: Some(10.0),
            rate: None,
            quality,
            unit: "count".into(),
            acquisition_time: Duration::from_millis(1),
            tags: std::collections::BTreeMap::new(),
            error: None,
        }
    }

    fn writer(backend: RecordingBackend, config: TimeSeriesWriterConfig) -> (TimeSeriesWriter<RecordingBackend>, DroppedPointsCounter) {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock(Mutex::new(SystemTime::UNIX_EPOCH)));
        TimeSeriesWriter::with_clock(backend, HashMap::new(), config, clock)
    }

    #[tokio::test]
    async fn flush_writes_buffered_points() {
        let (mut w, _dropped) = writer(RecordingBackend::new(0), TimeSeriesWriterConfig::default());
        w.ingest(&reading(collector_common::Quality::Good));
        w.try_flush().await;
        assert_eq!(w.backend.written.lock().unwrap().len(), 1);
        assert!(w.pending.is_empty());
    }

    #[tokio::test]
    async fn bad_quality_reading_is_never_buffered() {
        let (mut w, _dropped) = writer(RecordingBackend::new(0), TimeSeriesWriterConfig::default());
        w.ingest(&reading(collector_common::Quality::Bad));
        assert!(w.current.is_empty());
    }

    #[tokio::test]
    async fn failed_write_retains_batch_and_backs_off() {
        let (mut w, _dropped) = writer(RecordingBackend::new(1), TimeSeriesWriterConfig::default());
        w.ingest(&reading(collector_common::Quality::Good));
        w.try_flush().await;
        assert_eq!(w.pending.len(), 1, "batch stays buffered after a failed write");
        assert!(w.backend.written.lock().unwrap().is_empty());

        // Retrying immediately is a no-op: backoff hasn't elapsed.
        w.try_flush().await;
        assert_eq!(w.pending.len(), 1);

        // Advance the fake clock past the backoff window, then retry.
        w.clock.sleep(BACKOFF_BASE).await;
        w.try_flush().await;
        assert!(w.pending.is_empty());
        assert_eq!(w.backend.written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overflowing_buffer_drops_oldest_batch() {
        let config = TimeSeriesWriterConfig { max_buffered_batches: 1, ..TimeSeriesWriterConfig::default() };
        let (mut w, dropped) = writer(RecordingBackend::new(usize::MAX), config);
        w.ingest(&reading(collector_common::Quality::Good));
        w.try_flush().await;
        w.ingest(&reading(collector_common::Quality::Good));
        w.try_flush().await;
        assert_eq!(w.pending.len(), 1);
        assert_eq!(dropped.get(), 1);
    }

    #[tokio::test]
    async fn shutdown_flush_drains_pending_batches() {
        let (mut w, dropped) = writer(RecordingBackend::new(0), TimeSeriesWriterConfig::default());
        w.ingest(&reading(collector_common::Quality::Good));
        w.shutdown_flush().await;
        assert!(w.pending.is_empty());
        assert_eq!(dropped.get(), 0);
        assert_eq!(w.backend.written.lock().unwrap().len(), 1);
    }
}
