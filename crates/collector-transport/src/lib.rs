//! Transport and frame-codec layer for device polling.
//!
//! This crate provides:
//! - [`TransportClient`] trait, the single seam pollers use to talk
//!   to a device — one instance per device, async, single-flight.
//! - [`modbus`] module: Modbus/TCP transport and PDU codec.
//! - [`scale`] module: raw-socket scale transport and line codec
//!   driven by a `ProtocolTemplate`.

pub mod modbus;
pub mod scale;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use collector_common::TransportError;

/// Transport-level connection to one device.
///
/// Implementations own exactly one connection, reconnect lazily (on
/// the next `request` after a failure, never eagerly in the
/// background), and never interleave two in-flight requests —
/// spec.md §4.1 calls this "single-flight".
#[async_trait]
pub trait TransportClient: Send {
    /// Establish the underlying connection if not already connected.
    async fn connect(&mut self, deadline: Duration) -> Result<(), TransportError>;

    /// Close the underlying connection, releasing any OS resources.
    async fn close(&mut self);

    /// Send `payload` and return the raw response bytes, failing if
    /// the round trip exceeds `deadline`.
    async fn request(&mut self, payload: &[u8], deadline: Duration) -> Result<Vec<u8>, TransportError>;

    /// Whether the transport currently believes it is connected. This
    /// is advisory — a `request` can still fail even if this returns
    /// true, since TCP does not guarantee liveness without traffic.
    fn is_connected(&self) -> bool;
}

/// Runs `fut` and fails with [`TransportError::Timeout`] if it has not
/// completed by `deadline`. Shared by every transport implementation
/// so the timeout error shape stays consistent.
pub(crate) async fn with_deadline<F, T>(deadline: Duration, fut: F) -> Result<T, TransportError>
where
    F: std::future::Future<Output = Result<T, TransportError>>,
{
    let start = Instant::now();
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(start.elapsed())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_deadline_surfaces_timeout() {
        let result: Result<(), TransportError> = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn with_deadline_passes_through_fast_success() {
        let result: Result<i32, TransportError> =
            with_deadline(Duration::from_secs(1), async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
