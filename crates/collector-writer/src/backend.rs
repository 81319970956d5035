//! Pluggable write backend, the seam `TimeSeriesWriter` batches
//! against. Spec.md §6 fixes the wire format (line protocol) but
//! names no specific time-series store, so the backend is a trait the
//! same way `TransportClient` is the seam for devices.

use async_trait::async_trait;
use thiserror::Error;

use crate::point::Point;

/// A backend write attempt failed.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("writer backend unavailable: {0}")]
pub struct WriterBackendError(pub String);

impl From<reqwest::Error> for WriterBackendError {
    fn from(err: reqwest::Error) -> Self {
        Self(err.to_string())
    }
}

/// Accepts a batch of points and writes them durably, or fails the
/// whole batch atomically (spec.md §4.7 retries the entire batch, not
/// partial points, on failure).
#[async_trait]
pub trait WriteBackend: Send + Sync {
    /// Write every point in `batch`.
    ///
    /// # Errors
    ///
    /// Returns [`WriterBackendError`] if the batch could not be
    /// written; the caller retries with backoff.
    async fn write_batch(&self, batch: &[Point]) -> Result<(), WriterBackendError>;
}

/// Writes batches as newline-delimited line protocol over HTTP POST,
/// the shape of a time-series ingest endpoint (spec.md §8's writer
/// outage scenario has the backend return 503, which only an HTTP
/// sink can do). Any non-success status or transport error fails the
/// whole batch, per [`WriteBackend::write_batch`]'s all-or-nothing
/// contract.
pub struct HttpLineProtocolBackend {
    client: reqwest::Client,
    write_url: String,
}

impl HttpLineProtocolBackend {
    /// Point a backend at a write endpoint URL.
    #[must_use]
    pub fn new(write_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), write_url: write_url.into() }
    }
}

#[async_trait]
impl WriteBackend for HttpLineProtocolBackend {
    async fn write_batch(&self, batch: &[Point]) -> Result<(), WriterBackendError> {
        let body = batch.iter().map(Point::to_line_protocol).collect::<Vec<_>>().join("\n");
        let response = self.client.post(&self.write_url).body(body).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(WriterBackendError(format!("backend returned status {}", response.status())))
        }
    }
}
