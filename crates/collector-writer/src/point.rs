//! Line-protocol point model (spec.md §4.7, §6 wire format).

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// A field's typed value within a serialized point.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Serialized with an `i` suffix, e.g. `raw_value`.
    Int(i64),
    /// Serialized as a bare decimal.
    Float(f64),
    /// Serialized as `true`/`false`.
    Bool(bool),
}

impl FieldValue {
    fn append_line_protocol(&self, out: &mut String) {
        match self {
            FieldValue::Int(v) => {
                out.push_str(&v.to_string());
                out.push('i');
            }
            FieldValue::Float(v) => out.push_str(&v.to_string()),
            FieldValue::Bool(v) => out.push_str(if *v { "true" } else { "false" }),
        }
    }
}

/// One time-series point: measurement, tag set, field set, and a
/// millisecond-precision timestamp (spec.md §6).
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// `adam_counter` or `scale_weight`.
    pub measurement: String,
    /// Tag set, e.g. `device_id`, `channel`, `quality`.
    pub tags: BTreeMap<String, String>,
    /// Field set, e.g. `raw_value`, `processed_value`.
    pub fields: BTreeMap<String, FieldValue>,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

impl Point {
    /// Render one InfluxDB-style line-protocol line.
    ///
    /// Tag values with embedded spaces are escaped; this system never
    /// produces tag values with commas or equals signs, so those are
    /// not escaped.
    #[must_use]
    pub fn to_line_protocol(&self) -> String {
        let mut line = self.measurement.clone();
        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(key);
            line.push('=');
            line.push_str(&value.replace(' ', "\\ "));
        }
        line.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(key);
            line.push('=');
            value.append_line_protocol(&mut line);
        }
        line.push(' ');
        line.push_str(&self.timestamp_ms.to_string());
        line
    }

    /// Approximate wire size in bytes, used to enforce
    /// `max_batch_bytes` without re-serializing every point per check.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        self.to_line_protocol().len()
    }

    /// Identity the writer treats as a duplicate: `(measurement, tags,
    /// timestamp_ms)`, per spec.md §4.7's idempotent-write guarantee.
    #[must_use]
    pub fn identity_key(&self) -> (String, Vec<(String, String)>, i64) {
        (self.measurement.clone(), self.tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect(), self.timestamp_ms)
    }
}

/// Convert a wall-clock time to milliseconds since the Unix epoch,
/// saturating to 0 for times before it (never expected in practice).
#[must_use]
pub fn timestamp_ms(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH).map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX)).unwrap_or(0)
}
