//! Scale raw-socket transport and line codec.
//!
//! The transport is opaque framing over TCP; a [`ProtocolTemplate`]
//! (discovered offline by `collector-discovery`) tells the codec how
//! to split frames on a delimiter and decode each field.

use std::time::Duration;

use async_trait::async_trait;
use collector_common::TransportError;
use collector_discovery::{FieldKind, ProtocolTemplate};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{with_deadline, TransportClient};

/// Raw-socket transport to a scale bridge. Frames are opaque bytes
/// until a `ProtocolTemplate` is applied by [`decode_frame`].
pub struct ScaleSocketClient {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl ScaleSocketClient {
    /// Create a client for `host:port`. Does not connect eagerly.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
        }
    }

    /// Read one delimiter-terminated frame (excluding the delimiter).
    pub async fn read_frame(&mut self, delimiter: &[u8], deadline: Duration) -> Result<Vec<u8>, TransportError> {
        self.connect(deadline).await?;
        let stream = self
            .stream
            .as_mut()
            .expect("connect() above either returns Err or leaves a stream set");

        with_deadline(deadline, async {
            let mut buf = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                let n = stream
                    .read(&mut byte)
                    .await
                    .map_err(|e| TransportError::Transport(e.to_string()))?;
                if n == 0 {
                    return Err(TransportError::Transport("connection closed mid-frame".into()));
                }
                buf.push(byte[0]);
                if buf.len() >= delimiter.len() && buf[buf.len() - delimiter.len()..] == *delimiter {
                    buf.truncate(buf.len() - delimiter.len());
                    return Ok(buf);
                }
            }
        })
        .await
    }
}

#[async_trait]
impl TransportClient for ScaleSocketClient {
    async fn connect(&mut self, deadline: Duration) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = format!("{}:{}", self.host, self.port);
        let stream = with_deadline(deadline, async {
            TcpStream::connect(&addr)
                .await
                .map_err(|e| TransportError::Transport(e.to_string()))
        })
        .await?;
        debug!(addr = %addr, "scale transport connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) {
        self.stream = None;
    }

    async fn request(&mut self, payload: &[u8], deadline: Duration) -> Result<Vec<u8>, TransportError> {
        self.connect(deadline).await?;
        let stream = self
            .stream
            .as_mut()
            .expect("connect() above either returns Err or leaves a stream set");
        with_deadline(deadline, async {
            if !payload.is_empty() {
                stream
                    .write_all(payload)
                    .await
                    .map_err(|e| TransportError::Transport(e.to_string()))?;
            }
            Ok(Vec::new())
        })
        .await
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

/// A single decoded field from a scale frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedField {
    /// Numeric field, already scaled to its declared decimal places.
    Numeric(f64),
    /// Lookup field, mapped to its symbolic label.
    Lookup(String),
    /// Literal field; value is constant by definition, not parsed.
    Literal(String),
}

/// Decode one frame per `template`, returning every non-`ignore`
/// field by name. Numeric fields reject frames with no digits in
/// their byte range; lookup fields reject values absent from the
/// table — both per spec.md §4.2.
pub fn decode_frame(frame: &[u8], template: &ProtocolTemplate) -> Result<Vec<(String, DecodedField)>, TransportError> {
    let mut fields = Vec::new();
    for field in &template.fields {
        let end = field.start + field.length;
        if end > frame.len() {
            return Err(TransportError::Protocol(format!(
                "field '{}' range [{},{}) exceeds frame length {}",
                field.name,
                field.start,
                end,
                frame.len()
            )));
        }
        let raw = &frame[field.start..end];
        match &field.kind {
            FieldKind::Ignore => continue,
            FieldKind::Literal => {
                let text = String::from_utf8_lossy(raw).trim().to_string();
                fields.push((field.name.clone(), DecodedField::Literal(text)));
            }
            FieldKind::Lookup { table } => {
                let key = String::from_utf8_lossy(raw).trim().to_string();
                let value = table.get(&key).ok_or_else(|| {
                    TransportError::Protocol(format!(
                        "field '{}': value '{}' not present in lookup table",
                        field.name, key
                    ))
                })?;
                fields.push((field.name.clone(), DecodedField::Lookup(value.clone())));
            }
            FieldKind::Numeric { decimal_places } => {
                let text = std::str::from_utf8(raw)
                    .map_err(|_| TransportError::Protocol(format!("field '{}': not valid ASCII", field.name)))?
                    .trim();
                let value = parse_fixed_decimal(text, *decimal_places).ok_or_else(|| {
                    TransportError::Protocol(format!(
                        "field '{}': '{}' contains no digits",
                        field.name, text
                    ))
                })?;
                fields.push((field.name.clone(), DecodedField::Numeric(value)));
            }
        }
    }
    Ok(fields)
}

/// Parse a signed decimal with an explicit (not necessarily present)
/// decimal point, tolerating leading/trailing padding spaces. Returns
/// `None` if the text contains no digits at all.
fn parse_fixed_decimal(text: &str, decimal_places: u8) -> Option<f64> {
    let trimmed = text.trim();
    if !trimmed.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    if trimmed.contains('.') {
        trimmed.parse::<f64>().ok()
    } else {
        let negative = trimmed.starts_with('-');
        let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
        let parsed: i64 = digits.parse().ok()?;
        let scale = 10f64.powi(i32::from(decimal_places));
        let value = parsed as f64 / scale;
        Some(if negative { -value } else { value })
    }
}
