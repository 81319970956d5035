//! `ProtocolTemplate`: a content-addressed, JSON-serializable
//! description of how to split and decode a scale bridge's line
//! protocol, per spec.md §3/§6.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Text encoding a scale frame is expected to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Encoding {
    /// 7-bit ASCII.
    Ascii,
    /// UTF-8.
    #[serde(rename = "UTF-8")]
    Utf8,
}

/// How one field in a frame should be decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field_type", rename_all = "snake_case")]
pub enum FieldKind {
    /// Maps a raw byte run to a symbolic label via an exact lookup
    /// table.
    Lookup {
        /// Raw text (trimmed) to label.
        #[serde(rename = "values")]
        table: BTreeMap<String, String>,
    },
    /// Fixed- or implied-decimal signed number.
    Numeric {
        /// Number of fractional digits when no decimal point is
        /// present in the raw bytes.
        decimal_places: u8,
    },
    /// Constant text, not parsed; kept for documentation/round trip.
    Literal,
    /// Bytes present in the frame but not surfaced as a reading.
    Ignore,
}

/// One field's position and decoding rule within a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name, used as the reading's channel/tag label.
    pub name: String,
    /// Byte offset where the field begins.
    pub start: usize,
    /// Field width in bytes.
    pub length: usize,
    /// How to decode the field's bytes.
    #[serde(flatten)]
    pub kind: FieldKind,
}

/// A discovered (or hand-authored) scale line-protocol description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolTemplate {
    /// Content-addressed identifier.
    pub template_id: String,
    /// Human-readable name.
    pub name: String,
    /// Frame terminator bytes, e.g. `\r\n`.
    #[serde(with = "delimiter_serde")]
    pub delimiter: Vec<u8>,
    /// Declared text encoding.
    pub encoding: Encoding,
    /// Fields in byte-offset order.
    pub fields: Vec<FieldSpec>,
    /// Confidence score from discovery, 0-100. Hand-authored templates
    /// may set this to 100.
    pub confidence_score: f64,
}

/// A `ProtocolTemplate` invariant was violated.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TemplateError {
    /// Two fields claim overlapping byte ranges.
    #[error("fields '{0}' and '{1}' have overlapping byte ranges")]
    OverlappingFields(String, String),
    /// A field's range does not fit inside the declared frame length.
    #[error("field '{field}' range [{start},{end}) exceeds frame length {frame_length}")]
    FieldOutOfBounds {
        /// Offending field name.
        field: String,
        /// Field start offset.
        start: usize,
        /// Field end offset (exclusive).
        end: usize,
        /// Declared frame length.
        frame_length: usize,
    },
    /// No template exists for the requested id.
    #[error("no template with id '{0}'")]
    NotFound(String),
    /// A template with this id has already been published.
    #[error("template id '{0}' already exists; templates are immutable once published")]
    AlreadyExists(String),
}

impl ProtocolTemplate {
    /// Validate field non-overlap, per spec.md §3's template
    /// invariant. `frame_length`, when given, additionally bounds
    /// every field's range.
    pub fn validate(&self, frame_length: Option<usize>) -> Result<(), TemplateError> {
        let mut sorted: Vec<&FieldSpec> = self.fields.iter().collect();
        sorted.sort_by_key(|f| f.start);
        for window in sorted.windows(2) {
            let (a, b) = (window[0], window[1]);
            if a.start + a.length > b.start {
                return Err(TemplateError::OverlappingFields(a.name.clone(), b.name.clone()));
            }
        }
        if let Some(len) = frame_length {
            for field in &self.fields {
                let end = field.start + field.length;
                if end > len {
                    return Err(TemplateError::FieldOutOfBounds {
                        field: field.name.clone(),
                        start: field.start,
                        end,
                        frame_length: len,
                    });
                }
            }
        }
        Ok(())
    }
}

mod delimiter_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let escaped: String = bytes
            .iter()
            .map(|b| match b {
                b'\r' => "\\r".to_string(),
                b'\n' => "\\n".to_string(),
                b'\t' => "\\t".to_string(),
                0x20..=0x7E => (*b as char).to_string(),
                other => format!("\\x{other:02x}"),
            })
            .collect();
        serializer.serialize_str(&escaped)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(unescape(&s))
    }

    fn unescape(s: &str) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chars = s.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('r') => out.push(b'\r'),
                    Some('n') => out.push(b'\n'),
                    Some('t') => out.push(b'\t'),
                    Some('x') => {
                        let hex: String = chars.by_ref().take(2).collect();
                        if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                            out.push(byte);
                        }
                    }
                    Some(other) => out.push(other as u8),
                    None => {}
                }
            } else {
                out.extend(c.to_string().into_bytes());
            }
        }
        out
    }
}

/// Content-addressed store of published templates.
///
/// Single-writer/many-reader process-wide (spec.md §5); templates are
/// immutable once `put`, matching "templates immutable once published
/// (new IDs or CAS)".
#[derive(Debug, Default)]
pub struct TemplateRepository {
    templates: std::sync::RwLock<BTreeMap<String, ProtocolTemplate>>,
}

impl TemplateRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a template by id.
    pub fn get(&self, id: &str) -> Option<ProtocolTemplate> {
        self.templates.read().expect("lock poisoned").get(id).cloned()
    }

    /// List templates whose name contains `filter` (case-insensitive),
    /// or every template when `filter` is empty.
    pub fn list(&self, filter: &str) -> Vec<ProtocolTemplate> {
        let needle = filter.to_lowercase();
        self.templates
            .read()
            .expect("lock poisoned")
            .values()
            .filter(|t| needle.is_empty() || t.name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    /// Publish a new template. Rejects templates with overlapping
    /// fields or an id already in use.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::OverlappingFields`] or
    /// [`TemplateError::FieldOutOfBounds`] if validation fails, or
    /// [`TemplateError::AlreadyExists`] if the id is taken.
    pub fn put(&self, template: ProtocolTemplate) -> Result<(), TemplateError> {
        template.validate(None)?;
        let mut guard = self.templates.write().expect("lock poisoned");
        if guard.contains_key(&template.template_id) {
            return Err(TemplateError::AlreadyExists(template.template_id));
        }
        guard.insert(template.template_id.clone(), template);
        Ok(())
    }

    /// Remove a template by id.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::NotFound`] if no such template exists.
    pub fn delete(&self, id: &str) -> Result<(), TemplateError> {
        let mut guard = self.templates.write().expect("lock poisoned");
        if guard.remove(id).is_none() {
            return Err(TemplateError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
