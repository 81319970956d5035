//! Batched time-series writer: turns classified [`collector_common::Reading`]s
//! from the Pipeline Bus into line-protocol [`point::Point`]s and writes
//! them through a pluggable [`backend::WriteBackend`] with batching,
//! bounded buffering, and exponential backoff.

pub mod backend;
pub mod converter;
pub mod point;
pub mod writer;

pub use backend::{HttpLineProtocolBackend, WriteBackend, WriterBackendError};
pub use converter::{reading_to_point, DeviceMetadata, ScaleMetadata};
pub use point::{timestamp_ms, FieldValue, Point};
pub use writer::{BatchEnvelope, DroppedPointsCounter, TimeSeriesWriter, TimeSeriesWriterConfig};
