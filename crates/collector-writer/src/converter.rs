//! Reading → Point conversion (spec.md §6's tag/field mapping).

use std::collections::BTreeMap;

use collector_common::Reading;

use crate::point::{timestamp_ms, FieldValue, Point};

/// Static per-device context the writer needs to pick a measurement
/// name and fill protocol-specific tags; `Reading` itself carries no
/// notion of which transport produced it.
#[derive(Debug, Clone, Default)]
pub struct DeviceMetadata {
    /// Human-readable device name, distinct from `device_id`.
    pub device_name: String,
    /// Present only for scale bridges; selects the `scale_weight`
    /// measurement and adds the scale-specific tags.
    pub scale: Option<ScaleMetadata>,
}

/// Extra tags spec.md §6 requires for scale devices only.
#[derive(Debug, Clone)]
pub struct ScaleMetadata {
    /// Scale manufacturer.
    pub manufacturer: String,
    /// Scale model.
    pub model: String,
    /// Protocol template name applied to this device.
    pub protocol: String,
}

/// Convert a `Reading` into a storable `Point`.
///
/// Returns `None` if the reading's quality is not storable
/// (spec.md §4.7: only `Good`/`Uncertain` readings become points;
/// other qualities are surfaced only through health/error metrics).
#[must_use]
pub fn reading_to_point(reading: &Reading, metadata: &DeviceMetadata) -> Option<Point> {
    if !reading.quality.is_storable() {
        return None;
    }

    let measurement = if metadata.scale.is_some() { "scale_weight" } else { "adam_counter" };

    let mut tags = BTreeMap::new();
    tags.insert("device_id".to_string(), reading.device_id.clone());
    tags.insert("device_name".to_string(), metadata.device_name.clone());
    tags.insert("channel".to_string(), reading.channel.to_string());
    tags.insert("unit".to_string(), reading.unit.clone());
    tags.insert("quality".to_string(), reading.quality.to_string());
    if let Some(scale) = &metadata.scale {
        tags.insert("manufacturer".to_string(), scale.manufacturer.clone());
        tags.insert("model".to_string(), scale.model.clone());
        tags.insert("protocol".to_string(), scale.protocol.clone());
    }

    let mut fields = BTreeMap::new();
    fields.insert("raw_value".to_string(), FieldValue::Int(reading.raw_value));
    if let Some(processed) = reading.processed_value {
        fields.insert("processed_value".to_string(), FieldValue::Float(processed));
    }
    if let Some(rate) = reading.rate {
        fields.insert("rate".to_string(), FieldValue::Float(rate));
    }
    if reading.tags.get("overflow").map(String::as_str) == Some("true") {
        fields.insert("overflow".to_string(), FieldValue::Bool(true));
    }

    Some(Point { measurement: measurement.to_string(), tags, fields, timestamp_ms: timestamp_ms(reading.timestamp) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    use collector_common::Quality;

    fn reading(quality: Quality) -> Reading {
        Reading {
            device_id: "adam-1".into(),
            channel: 0,
            raw_value: 42,
            timestamp: SystemTime::UNIX_EPOCH,
            processed_value: Some(4.2),
            rate: Some(1.0),
            quality,
            unit: "count".into(),
            acquisition_time: Duration::from_millis(5),
            tags: BTreeMap::new(),
            error: None,
        }
    }

    #[test]
    fn good_reading_becomes_a_point() {
        let metadata = DeviceMetadata { device_name: "Line 1 Counter".into(), scale: None };
        let point = reading_to_point(&reading(Quality::Good), &metadata).unwrap();
        assert_eq!(point.measurement, "adam_counter");
        assert_eq!(point.tags.get("quality").map(String::as_str), Some("good"));
        assert_eq!(point.fields.get("raw_value"), Some(&FieldValue::Int(42)));
    }

    #[test]
    fn bad_reading_is_not_storable() {
        let metadata = DeviceMetadata::default();
        assert!(reading_to_point(&reading(Quality::Bad), &metadata).is_none());
    }

    #[test]
    fn scale_metadata_selects_scale_measurement_and_tags() {
        let metadata = DeviceMetadata {
            device_name: "Floor Scale".into(),
            scale: Some(ScaleMetadata { manufacturer: "Acme".into(), model: "S1".into(), protocol: "acme-v2".into() }),
        };
        let point = reading_to_point(&reading(Quality::Good), &metadata).unwrap();
        assert_eq!(point.measurement, "scale_weight");
        assert_eq!(point.tags.get("manufacturer").map(String::as_str), Some("Acme"));
    }

    #[test]
    fn overflow_tag_becomes_bool_field() {
        let mut r = reading(Quality::Good);
        r.tags.insert("overflow".into(), "true".into());
        let point = reading_to_point(&r, &DeviceMetadata::default()).unwrap();
        assert_eq!(point.fields.get("overflow"), Some(&FieldValue::Bool(true)));
    }
}
