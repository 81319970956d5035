//! Quality classification (spec.md §4.3's Validator contract).

use collector_common::{ChannelSpec, Quality};

/// Everything a [`Validator`] needs to classify one reading.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationInput<'a> {
    /// Raw register/field value before scaling.
    pub raw_value: i64,
    /// `raw_value * scale_factor + offset`, when the transformer ran
    /// without error.
    pub processed_value: Option<f64>,
    /// Rate over the tracking window, if one has been established.
    pub rate: Option<f64>,
    /// Whether `RateTracker` attributed the out-of-range value to a
    /// counter wrap rather than a genuine fault.
    pub overflow_detected: bool,
    /// The channel the reading was taken from.
    pub channel: &'a ChannelSpec,
}

/// Classifies a reading's [`Quality`] from its value, rate, and the
/// channel's configured bounds.
///
/// Implementations must be pure and side-effect free: the poller
/// calls `classify` on every tick, synchronously, on the hot path.
pub trait Validator: Send + Sync {
    /// Classify one reading.
    fn classify(&self, input: &ClassificationInput<'_>) -> Quality;
}

/// The classification priority order spec.md §4.3 mandates:
/// `ConfigurationError > Overflow > Bad > Uncertain > Good`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultValidator;

impl DefaultValidator {
    fn out_of_range(value: f64, channel: &ChannelSpec) -> bool {
        if let Some(min) = channel.min_value {
            if value < min {
                return true;
            }
        }
        if let Some(max) = channel.max_value {
            if value > max {
                return true;
            }
        }
        false
    }

    fn rate_exceeded(rate: Option<f64>, channel: &ChannelSpec) -> bool {
        match (rate, channel.max_rate_of_change) {
            (Some(rate), Some(max_rate)) => rate.abs() > max_rate,
            _ => false,
        }
    }
}

impl Validator for DefaultValidator {
    fn classify(&self, input: &ClassificationInput<'_>) -> Quality {
        if input.channel.validate().is_err() {
            return Quality::ConfigurationError;
        }

        let Some(processed) = input.processed_value else {
            return Quality::Bad;
        };

        if Self::out_of_range(processed, input.channel) {
            return if input.overflow_detected { Quality::Overflow } else { Quality::Bad };
        }

        if Self::rate_exceeded(input.rate, input.channel) {
            return Quality::Uncertain;
        }

        Quality::Good
    }
}
