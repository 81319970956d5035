//! Signal handling for graceful daemon shutdown.
//!
//! Adapted from the teacher's `SignalHandler`, which polled atomic
//! flags set from raw `libc::signal` handlers on a dedicated thread.
//! `tokio::signal::unix` already does this safely inside the async
//! runtime, so the handler here is just a thin wrapper over it.

use tokio::signal::unix::{signal, SignalKind as UnixSignalKind};
use tracing::info;

/// Which signal triggered shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM - graceful termination request.
    Terminate,
    /// SIGINT - interrupt (Ctrl+C).
    Interrupt,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Waits for SIGTERM or SIGINT, whichever arrives first.
///
/// # Errors
///
/// Returns an I/O error if the underlying signal streams could not
/// be registered.
pub async fn wait_for_shutdown_signal() -> std::io::Result<SignalKind> {
    let mut terminate = signal(UnixSignalKind::terminate())?;
    let mut interrupt = signal(UnixSignalKind::interrupt())?;

    let kind = tokio::select! {
        _ = terminate.recv() => SignalKind::Terminate,
        _ = interrupt.recv() => SignalKind::Interrupt,
    };
    info!(signal = %kind, "shutdown signal received");
    Ok(kind)
}
