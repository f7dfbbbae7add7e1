//! Error types for Qontrol protocol operations.

use crate::types::ErrorEvent;
use thiserror::Error;

/// Result type alias for Qontrol operations.
pub type Result<T> = std::result::Result<T, QontrolError>;

/// Error types for Qontrol device communication.
#[derive(Error, Debug)]
pub enum QontrolError {
    /// Serial port could not be opened or configured
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    /// I/O fault on the serial link
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Operation attempted after the connection was closed
    #[error("Serial port is closed")]
    PortClosed,

    /// Command mnemonic is empty or not plain ASCII letters
    #[error("Invalid command: {0:?}")]
    InvalidCommand(String),

    /// Channel outside the range of the addressing mode
    #[error("Invalid channel {channel} (max {max})")]
    InvalidChannel {
        /// Requested channel
        channel: u32,
        /// Largest valid channel
        max: u32,
    },

    /// Value cannot be represented in the target encoding
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Line looks like an error token but does not parse
    #[error("Malformed error token: {0:?}")]
    MalformedError(String),

    /// Device error escalated either as a target error or by the log handler
    #[error("Device error {event}{}", reason.as_ref().map(|r| format!(" ({r})")).unwrap_or_default())]
    Device {
        /// The error reported by the device
        event: ErrorEvent,
        /// Reason given by the log handler, if it escalated the error
        reason: Option<String>,
    },

    /// No satisfying response within the applicable timeout
    #[error("Timed out waiting for response to {0:?}")]
    Timeout(String),

    /// No port answered with the requested device id
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device id is not of the form `<type>-<hex number>`
    #[error("Invalid device id {0:?}, expected \"<device type>-<device number>\"")]
    InvalidDeviceId(String),

    /// Response parsing error
    #[error("Parse error: {0}")]
    Parse(String),
}

impl QontrolError {
    /// The device error carried by this failure, if any.
    pub fn device_event(&self) -> Option<&ErrorEvent> {
        match self {
            QontrolError::Device { event, .. } => Some(event),
            _ => None,
        }
    }
}
