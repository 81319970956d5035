//! Scaling and tag enrichment (spec.md §4.3's Transformer contract).

use std::collections::BTreeMap;
use std::time::SystemTime;

use collector_common::ChannelSpec;
use humantime::format_rfc3339_millis;

/// A user-supplied transformer raised an error while scaling a value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("transformer failed: {0}")]
pub struct TransformError(pub String);

/// Scales a raw register value into engineering units.
///
/// Must be pure: no I/O, no shared mutable state. The poller catches
/// any `Err` and reports the reading as quality `Bad` with the error
/// message, per spec.md §4.3.
pub trait Transformer: Send + Sync {
    /// Compute the processed (engineering-units) value from a raw
    /// reading.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] if the channel's scaling cannot be
    /// applied to this value.
    fn transform(&self, raw_value: i64, channel: &ChannelSpec) -> Result<f64, TransformError>;
}

/// `processed = raw * scale_factor + offset`, per spec.md §4.3.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearTransformer;

impl Transformer for LinearTransformer {
    fn transform(&self, raw_value: i64, channel: &ChannelSpec) -> Result<f64, TransformError> {
        if channel.scale_factor == 0.0 {
            return Err(TransformError("scale_factor must be nonzero".into()));
        }
        Ok(raw_value as f64 * channel.scale_factor + channel.offset)
    }
}

/// Round a processed value to `decimal_places` for presentation only;
/// storage always keeps the unrounded value.
#[must_use]
pub fn round_for_presentation(value: f64, decimal_places: u8) -> f64 {
    let factor = 10f64.powi(i32::from(decimal_places));
    (value * factor).round() / factor
}

/// Merge channel tags, device tags, and enrichment context into the
/// tag set a `Reading` carries.
///
/// Enrichment keys (`source`, `channel_name`, `device_id`,
/// `timestamp`) are added last and win over any identically-named
/// static tag, so provenance can never be shadowed by configuration.
#[must_use]
pub fn enrich_tags(
    channel: &ChannelSpec,
    device_tags: &BTreeMap<String, String>,
    writer_tags: &BTreeMap<String, String>,
    source: &str,
    device_id: &str,
    timestamp: SystemTime,
) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.extend(writer_tags.iter().map(|(k, v)| (k.clone(), v.clone())));
    tags.extend(device_tags.iter().map(|(k, v)| (k.clone(), v.clone())));
    tags.extend(channel.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
    tags.insert("source".into(), source.into());
    tags.insert("channel_name".into(), channel.name.clone());
    tags.insert("device_id".into(), device_id.into());
    tags.insert("timestamp".into(), format_rfc3339_millis(timestamp).to_string());
    tags
}
