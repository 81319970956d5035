//! Mock Modbus TCP server for integration testing.
//!
//! Runs a small synchronous TCP server on a background thread that
//! speaks just enough MBAP framing to answer read-registers requests,
//! with controllable fault injection for timeout/exception scenarios.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Controls how the mock server responds to read-registers requests.
#[derive(Debug, Clone, Copy)]
pub enum MockBehavior {
    /// Echo back `register_count` registers, with `value` in the last one.
    Normal(u16),
    /// Respond with a Modbus exception.
    Exception(u8),
    /// Accept the connection but never respond (forces a timeout).
    HangForever,
}

/// A running mock Modbus/TCP server.
pub struct MockModbusServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockModbusServer {
    /// Start the server on an OS-assigned port with the given
    /// per-request behavior.
    pub fn start(behavior: MockBehavior) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);

        listener.set_nonblocking(true)?;
        let handle = thread::spawn(move || {
            while !shutdown_clone.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let _ = handle_connection(stream, behavior);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MockModbusServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_connection(mut stream: TcpStream, behavior: MockBehavior) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    let mut header = [0u8; 7];
    stream.read_exact(&mut header)?;
    let pdu_len = u16::from_be_bytes([header[4], header[5]]).saturating_sub(1) as usize;
    let mut pdu = vec![0u8; pdu_len];
    stream.read_exact(&mut pdu)?;

    match behavior {
        MockBehavior::HangForever => loop {
            thread::sleep(Duration::from_secs(1));
        },
        MockBehavior::Exception(code) => {
            let function = pdu[0];
            let mut resp = Vec::new();
            resp.extend_from_slice(&header[0..4]);
            resp.extend_from_slice(&3u16.to_be_bytes());
            resp.push(header[6]);
            resp.push(function | 0x80);
            resp.push(code);
            stream.write_all(&resp)
        }
        MockBehavior::Normal(value) => {
            let function = pdu[0];
            let count = u16::from_be_bytes([pdu[3], pdu[4]]);
            let mut registers = Vec::new();
            for i in 0..count {
                let v = if i == count - 1 { value } else { 0 };
                registers.extend_from_slice(&v.to_be_bytes());
            }
            let mut resp = Vec::new();
            resp.extend_from_slice(&header[0..4]);
            resp.extend_from_slice(&((2 + registers.len() + 1) as u16).to_be_bytes());
            resp.push(header[6]);
            resp.push(function);
            resp.push(registers.len() as u8);
            resp.extend_from_slice(&registers);
            stream.write_all(&resp)
        }
    }
}
