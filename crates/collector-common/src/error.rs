//! Error taxonomy shared across the acquisition workspace.
//!
//! Mirrors spec.md §7: every category is a distinct type so each
//! crate can match on it instead of inspecting strings.

use thiserror::Error;

/// Configuration load/validation failure, returned at startup.
///
/// [`ConfigError::Validation`] carries every violation found, not just
/// the first — spec.md §6 requires a report enumerating all of them.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration file {path}: {source_msg}")]
    Io {
        /// Path that failed to load.
        path: String,
        /// Underlying OS error message.
        source_msg: String,
    },
    /// The configuration file was not valid TOML.
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    /// One or more schema invariants were violated.
    #[error("configuration validation failed with {} violation(s):\n{}", .0.len(), .0.join("\n"))]
    Validation(Vec<String>),
}

/// Errors a `TransportClient` can return, per spec.md §4.1.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    /// The request did not complete within its deadline.
    #[error("transport timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// The connection failed or was reset.
    #[error("transport error: {0}")]
    Transport(String),
    /// The peer responded but the frame was malformed or an exception
    /// was returned.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Top-level error returned by collector operations that are not
/// per-reading (starting the engine, loading templates, writer
/// lifecycle). Per-reading failures are represented as a `Quality`
/// value on the `Reading`, never as a propagated error.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Configuration failed to load or validate.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A transport-level failure outside the retry loop (e.g. during
    /// discovery, which does not retry).
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// An I/O failure not covered by a more specific variant.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
