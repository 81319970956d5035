//! Bridges a [`TransportClient`] to the poller's notion of "read one
//! channel, get back a raw integer value" (spec.md §4.2's FrameCodec,
//! from the poller's point of view).

use std::time::Duration;

use async_trait::async_trait;
use collector_common::{ChannelSpec, TransportError};
use collector_discovery::{FieldKind, ProtocolTemplate};
use collector_transport::modbus::{FunctionCode, ModbusTcpClient};
use collector_transport::scale::{decode_frame, DecodedField, ScaleSocketClient};
use collector_transport::TransportClient;

/// Reads one channel's current value from a device, independent of
/// the underlying wire protocol.
#[async_trait]
pub trait ChannelReader: Send {
    /// Ensure the transport is connected, with `deadline` bounding the
    /// connect attempt.
    async fn ensure_connected(&mut self, deadline: Duration) -> Result<(), TransportError>;

    /// Read one channel's raw value.
    async fn read_channel(&mut self, channel: &ChannelSpec, deadline: Duration) -> Result<i64, TransportError>;

    /// Drop the underlying connection.
    async fn disconnect(&mut self);

    /// Whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}

/// Reads ADAM-style counters over Modbus/TCP.
pub struct ModbusChannelReader {
    client: ModbusTcpClient,
}

impl ModbusChannelReader {
    /// Wrap a Modbus/TCP client.
    #[must_use]
    pub fn new(client: ModbusTcpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelReader for ModbusChannelReader {
    async fn ensure_connected(&mut self, deadline: Duration) -> Result<(), TransportError> {
        self.client.connect(deadline).await
    }

    async fn read_channel(&mut self, channel: &ChannelSpec, deadline: Duration) -> Result<i64, TransportError> {
        self.client
            .read_registers(
                FunctionCode::ReadHoldingRegisters,
                channel.start_register,
                channel.register_count,
                channel.word_order,
                deadline,
            )
            .await
    }

    async fn disconnect(&mut self) {
        self.client.close().await;
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }
}

/// Reads a scale bridge's line protocol, applying a discovered
/// [`ProtocolTemplate`] and surfacing the field matching `channel.name`
/// as an integer scaled by `10^decimal_places`, matching the Modbus
/// reader's "raw value, scale applied by the transformer" convention.
pub struct ScaleChannelReader {
    client: ScaleSocketClient,
    template: ProtocolTemplate,
}

impl ScaleChannelReader {
    /// Wrap a scale transport with the template used to decode it.
    #[must_use]
    pub fn new(client: ScaleSocketClient, template: ProtocolTemplate) -> Self {
        Self { client, template }
    }
}

#[async_trait]
impl ChannelReader for ScaleChannelReader {
    async fn ensure_connected(&mut self, deadline: Duration) -> Result<(), TransportError> {
        self.client.connect(deadline).await
    }

    async fn read_channel(&mut self, channel: &ChannelSpec, deadline: Duration) -> Result<i64, TransportError> {
        let frame = self.client.read_frame(&self.template.delimiter, deadline).await?;
        let fields = decode_frame(&frame, &self.template)?;
        let (_, value) = fields
            .into_iter()
            .find(|(name, _)| name == &channel.name)
            .ok_or_else(|| TransportError::Protocol(format!("template has no field named '{}'", channel.name)))?;
        match value {
            DecodedField::Numeric(v) => {
                let decimal_places = self
                    .template
                    .fields
                    .iter()
                    .find(|f| f.name == channel.name)
                    .and_then(|f| match &f.kind {
                        FieldKind::Numeric { decimal_places } => Some(*decimal_places),
                        _ => None,
                    })
                    .unwrap_or(0);
                Ok((v * 10f64.powi(i32::from(decimal_places))).round() as i64)
            }
            DecodedField::Lookup(_) | DecodedField::Literal(_) => {
                Err(TransportError::Protocol(format!("field '{}' is not numeric", channel.name)))
            }
        }
    }

    async fn disconnect(&mut self) {
        self.client.close().await;
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }
}
