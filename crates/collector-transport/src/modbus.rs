//! Modbus/TCP transport and frame codec.
//!
//! Frame layout follows the standard MBAP header + PDU: transaction
//! id, protocol id (always 0), length, unit id, then function code
//! and data. Word assembly for multi-register values is big-endian on
//! the wire; [`WordOrder`](collector_common::WordOrder) only decides
//! which register holds the high-order half.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use collector_common::{TransportError, WordOrder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::{with_deadline, TransportClient};

/// Modbus function codes used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read 1-125 contiguous holding registers.
    ReadHoldingRegisters = 0x03,
    /// Read 1-125 contiguous input registers.
    ReadInputRegisters = 0x04,
}

impl FunctionCode {
    fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Modbus exception codes, per the MBAP/PDU specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    /// Function code not supported by the device.
    IllegalFunction,
    /// Register address not valid for this device.
    IllegalDataAddress,
    /// Register count or value not valid.
    IllegalDataValue,
    /// Device failed to process the request.
    SlaveDeviceFailure,
    /// Device accepted the request but has not finished processing.
    Acknowledge,
    /// Device is busy processing a long-duration command.
    SlaveDeviceBusy,
    /// Any other code not in the standard table.
    Other(u8),
}

impl ExceptionCode {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::SlaveDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::SlaveDeviceBusy,
            other => Self::Other(other),
        }
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "illegal function"),
            Self::IllegalDataAddress => write!(f, "illegal data address"),
            Self::IllegalDataValue => write!(f, "illegal data value"),
            Self::SlaveDeviceFailure => write!(f, "slave device failure"),
            Self::Acknowledge => write!(f, "acknowledge"),
            Self::SlaveDeviceBusy => write!(f, "slave device busy"),
            Self::Other(code) => write!(f, "exception code 0x{code:02X}"),
        }
    }
}

/// MBAP header: 7 bytes preceding every PDU on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Echoed back by the server; used to correlate responses.
    pub transaction_id: u16,
    /// Always 0 for Modbus.
    pub protocol_id: u16,
    /// Byte length of unit id + PDU that follows.
    pub length: u16,
    /// Target unit/slave identifier.
    pub unit_id: u8,
}

impl MbapHeader {
    /// Wire size of the header in bytes.
    pub const SIZE: usize = 7;

    /// Serialize to the 7-byte wire representation.
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.length.to_be_bytes());
        buf[6] = self.unit_id;
        buf
    }

    /// Parse from a 7-byte wire buffer.
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            transaction_id: u16::from_be_bytes([buf[0], buf[1]]),
            protocol_id: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            unit_id: buf[6],
        }
    }
}

/// Build a read-registers PDU (function 0x03 or 0x04) and wrap it in
/// an MBAP frame ready to write to the socket.
fn build_read_request(
    transaction_id: u16,
    unit_id: u8,
    function: FunctionCode,
    start_register: u16,
    register_count: u8,
) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function.as_byte());
    pdu.extend_from_slice(&start_register.to_be_bytes());
    pdu.extend_from_slice(&(u16::from(register_count)).to_be_bytes());

    let header = MbapHeader {
        transaction_id,
        protocol_id: 0,
        length: (pdu.len() + 1) as u16,
        unit_id,
    };

    let mut frame = Vec::with_capacity(MbapHeader::SIZE + pdu.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&pdu);
    frame
}

/// Decode a read-registers response, verifying transaction id,
/// function code, and exception bit, and return the raw register
/// bytes (big-endian, two bytes per register).
fn decode_read_response(
    expected_transaction_id: u16,
    expected_unit_id: u8,
    expected_function: FunctionCode,
    header_buf: [u8; MbapHeader::SIZE],
    pdu: &[u8],
) -> Result<Vec<u8>, TransportError> {
    let header = MbapHeader::from_bytes(&header_buf);
    if header.transaction_id != expected_transaction_id {
        return Err(TransportError::Protocol(format!(
            "transaction id mismatch: expected {}, got {}",
            expected_transaction_id, header.transaction_id
        )));
    }
    if header.protocol_id != 0 {
        return Err(TransportError::Protocol(format!(
            "unexpected protocol id {}",
            header.protocol_id
        )));
    }
    if header.unit_id != expected_unit_id {
        return Err(TransportError::Protocol(format!(
            "unit id mismatch: expected {}, got {}",
            expected_unit_id, header.unit_id
        )));
    }
    if pdu.is_empty() {
        return Err(TransportError::Protocol("empty PDU".to_string()));
    }

    let function_byte = pdu[0];
    if function_byte & 0x80 != 0 {
        let code = if pdu.len() > 1 {
            ExceptionCode::from_byte(pdu[1])
        } else {
            ExceptionCode::Other(0)
        };
        return Err(TransportError::Protocol(format!(
            "exception response: {code}"
        )));
    }
    if function_byte != expected_function.as_byte() {
        return Err(TransportError::Protocol(format!(
            "function code mismatch: expected 0x{:02X}, got 0x{function_byte:02X}",
            expected_function.as_byte()
        )));
    }
    if pdu.len() < 2 {
        return Err(TransportError::Protocol("PDU missing byte count".to_string()));
    }
    let byte_count = pdu[1] as usize;
    if pdu.len() < 2 + byte_count {
        return Err(TransportError::Protocol(
            "PDU shorter than declared byte count".to_string(),
        ));
    }
    Ok(pdu[2..2 + byte_count].to_vec())
}

/// Assemble big-endian 16-bit registers into a signed 64-bit value,
/// honoring `word_order` for counters wider than one register. The
/// widest counter this system polls is 4 registers (64 bits
/// unsigned), which always fits in `i64`'s bit pattern even though
/// ADAM counters never populate the sign bit in practice.
pub fn assemble_registers(bytes: &[u8], word_order: WordOrder) -> i64 {
    let mut words: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();

    if word_order == WordOrder::LowWordFirst {
        words.reverse();
    }
    // `words` is now ordered high-to-low regardless of wire order.
    let mut value: u64 = 0;
    for word in &words {
        value = (value << 16) | u64::from(*word);
    }
    value as i64
}

/// Modbus/TCP transport client: one instance per device.
pub struct ModbusTcpClient {
    host: String,
    port: u16,
    unit_id: u8,
    stream: Option<TcpStream>,
    next_transaction_id: AtomicU16,
}

impl ModbusTcpClient {
    /// Create a client for `host:port` targeting `unit_id`. Does not
    /// connect until [`TransportClient::connect`] or the first
    /// [`TransportClient::request`].
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            stream: None,
            next_transaction_id: AtomicU16::new(1),
        }
    }

    fn take_transaction_id(&self) -> u16 {
        self.next_transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Read `register_count` registers starting at `start_register`
    /// using `function`, returning the assembled value per
    /// `word_order`.
    pub async fn read_registers(
        &mut self,
        function: FunctionCode,
        start_register: u16,
        register_count: u8,
        word_order: WordOrder,
        deadline: Duration,
    ) -> Result<i64, TransportError> {
        let transaction_id = self.take_transaction_id();
        let request = build_read_request(transaction_id, self.unit_id, function, start_register, register_count);
        let response = self.request(&request, deadline).await?;
        if response.len() < MbapHeader::SIZE {
            return Err(TransportError::Protocol("response shorter than MBAP header".into()));
        }
        let mut header_buf = [0u8; MbapHeader::SIZE];
        header_buf.copy_from_slice(&response[..MbapHeader::SIZE]);
        let register_bytes = decode_read_response(
            transaction_id,
            self.unit_id,
            function,
            header_buf,
            &response[MbapHeader::SIZE..],
        )?;
        if register_bytes.len() != usize::from(register_count) * 2 {
            return Err(TransportError::Protocol(format!(
                "expected {} register bytes, got {}",
                register_count * 2,
                register_bytes.len()
            )));
        }
        Ok(assemble_registers(&register_bytes, word_order))
    }
}

#[async_trait]
impl TransportClient for ModbusTcpClient {
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
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::Transport(e.to_string()))?;
        debug!(addr = %addr, "modbus transport connected");
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

        let result: Result<Vec<u8>, TransportError> = with_deadline(deadline, async {
            stream
                .write_all(payload)
                .await
                .map_err(|e| TransportError::Transport(e.to_string()))?;

            let mut header_buf = [0u8; MbapHeader::SIZE];
            stream
                .read_exact(&mut header_buf)
                .await
                .map_err(|e| TransportError::Transport(e.to_string()))?;
            let header = MbapHeader::from_bytes(&header_buf);
            let pdu_len = header.length.saturating_sub(1) as usize;
            let mut pdu = vec![0u8; pdu_len];
            stream
                .read_exact(&mut pdu)
                .await
                .map_err(|e| TransportError::Transport(e.to_string()))?;

            let mut frame = Vec::with_capacity(MbapHeader::SIZE + pdu.len());
            frame.extend_from_slice(&header_buf);
            frame.extend_from_slice(&pdu);
            Ok(frame)
        })
        .await;

        if result.is_err() {
            warn!("modbus request failed, dropping connection for lazy reconnect");
            self.stream = None;
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
