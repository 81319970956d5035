//! Per-device acquisition: turns a [`collector_transport::TransportClient`]
//! plus a [`collector_common::DeviceSpec`] into a supervised stream of
//! classified [`collector_common::Reading`]s and
//! [`collector_common::DeviceHealth`] snapshots on the Pipeline Bus.

pub mod bus;
pub mod health;
pub mod poller;
pub mod reader;

pub use bus::{PipelineBus, ReadingSubscriber};
pub use health::{HealthMonitor, HealthUpdate};
pub use poller::{DevicePoller, DevicePollerBuilder};
pub use reader::{ChannelReader, ModbusChannelReader, ScaleChannelReader};
