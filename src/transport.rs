//! Line-oriented transport over a serial port.

use serialport::{SerialPort, SerialPortInfo};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::constants::*;
use crate::error::Result;

/// Byte link to a device.
///
/// The session owns exactly one transport and drives it from a single
/// thread.
pub trait Transport: Send {
    /// Write the whole buffer.
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()>;

    /// Wait up to `timeout` for one complete line and return it without its
    /// terminator. `Ok(None)` means nothing complete arrived in time.
    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>>;

    /// Drop anything received but not yet read.
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Release the underlying connection.
    fn close(&mut self) {}
}

/// [`Transport`] over a `serialport` handle
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    pending: Vec<u8>,
}

impl SerialTransport {
    /// Open a port at 115200 baud, 8N1, no flow control.
    pub fn open(port_name: &str) -> Result<Self> {
        let port = serialport::new(port_name, BAUD_RATE)
            .data_bits(DATA_BITS)
            .stop_bits(STOP_BITS)
            .parity(PARITY)
            .flow_control(FLOW_CONTROL)
            .timeout(Duration::from_millis(RESPONSE_TIMEOUT_MS))
            .open()?;

        debug!(port = port_name, baud = BAUD_RATE, "opened serial port");
        Ok(SerialTransport {
            port: Some(port),
            pending: Vec::new(),
        })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == LINE_TERMINATOR)?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        let text = String::from_utf8_lossy(&line[..end]);
        Some(text.trim_end_matches('\r').to_string())
    }
}

impl Transport for SerialTransport {
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()
    }

    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 64];

        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let port = self.port()?;
            port.set_timeout(remaining)?;
            match port.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.port()?
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("closed serial port");
        }
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    Ok(serialport::available_ports()?)
}
