//! Sliding-window rate-of-change tracking with counter-wrap detection
//! (spec.md §4.4's "Rate calculation").

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime};

/// Default counter width assumed when a channel doesn't say
/// otherwise: 32-bit registers, per spec.md §4.2.
const DEFAULT_COUNTER_WIDTH_BITS: u32 = 32;

#[derive(Debug, Clone, Copy)]
struct Sample {
    t: SystemTime,
    raw: i64,
    effective: f64,
}

/// Rate and wrap outcome of one `RateTracker::record` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSample {
    /// Units/second over the current window, `None` until a second
    /// sample lands inside it.
    pub rate: Option<f64>,
    /// Whether this sample was identified as a counter wrap rather
    /// than a genuine drop.
    pub overflow: bool,
}

/// Tracks `(timestamp, raw_value)` samples within a sliding window per
/// `(device_id, channel)` and derives an instantaneous rate, handling
/// the wraparound of free-running hardware counters.
pub struct RateTracker {
    window: Duration,
    counter_width_bits: u32,
    series: HashMap<(String, u8), VecDeque<Sample>>,
}

impl RateTracker {
    /// Create a tracker with the given sliding window and the default
    /// 32-bit counter width.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self::with_counter_width(window, DEFAULT_COUNTER_WIDTH_BITS)
    }

    /// Create a tracker for counters of a non-default bit width.
    #[must_use]
    pub fn with_counter_width(window: Duration, counter_width_bits: u32) -> Self {
        Self { window, counter_width_bits, series: HashMap::new() }
    }

    /// Record one raw sample and return the rate/overflow outcome.
    ///
    /// Pruning happens on every insert: samples older than `window`
    /// relative to `timestamp` are dropped before the rate is
    /// recomputed.
    pub fn record(&mut self, device_id: &str, channel: u8, timestamp: SystemTime, raw_value: i64) -> RateSample {
        let key = (device_id.to_string(), channel);
        let samples = self.series.entry(key).or_default();

        // On wrap the previous sample is kept (not popped) so it still
        // anchors the window; only its unwrapped running total feeds
        // forward into this sample's `effective` value.
        let half_range = 0.5 * 2f64.powi(self.counter_width_bits as i32);
        let (overflow, effective) = match samples.back() {
            Some(last) if raw_value < last.raw && (last.raw - raw_value) as f64 > half_range => {
                let increment = (2f64.powi(self.counter_width_bits as i32) - last.raw as f64) + raw_value as f64;
                (true, last.effective + increment)
            }
            _ => (false, raw_value as f64),
        };

        samples.push_back(Sample { t: timestamp, raw: raw_value, effective });

        while let Some(front) = samples.front() {
            match timestamp.duration_since(front.t) {
                Ok(age) if age > self.window => {
                    samples.pop_front();
                }
                _ => break,
            }
        }

        let rate = if samples.len() >= 2 {
            let first = samples.front().expect("len >= 2");
            let last = samples.back().expect("len >= 2");
            let dt = last.t.duration_since(first.t).map(|d| d.as_secs_f64()).unwrap_or(0.0);
            if dt > 0.0 { Some((last.effective - first.effective) / dt) } else { None }
        } else {
            None
        };

        RateSample { rate, overflow }
    }
}
