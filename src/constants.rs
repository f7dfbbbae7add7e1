//! Protocol constants for Qontrol serial communication.
//!
//! This module defines the serial line configuration, default timing
//! parameters, and the header bits used by the binary command format.

/// Baud rate (115200 bps, fixed by the hardware)
pub const BAUD_RATE: u32 = 115_200;

/// Data bits configuration
pub const DATA_BITS: serialport::DataBits = serialport::DataBits::Eight;

/// Stop bits configuration
pub const STOP_BITS: serialport::StopBits = serialport::StopBits::One;

/// Parity configuration
pub const PARITY: serialport::Parity = serialport::Parity::None;

/// Flow control configuration
pub const FLOW_CONTROL: serialport::FlowControl = serialport::FlowControl::None;

/// Time allowed for the first line of a response, in milliseconds
pub const RESPONSE_TIMEOUT_MS: u64 = 50;

/// Time allowed between consecutive lines of a response, in milliseconds
pub const INTER_RESPONSE_TIMEOUT_MS: u64 = 20;

/// Default number of entries retained by the event log
pub const LOG_CAPACITY: usize = 256;

/// Time allowed for a device to answer the `id?` challenge while connecting
pub const ID_CHALLENGE_TIMEOUT_MS: u64 = 200;

/// Number of `id?` challenges sent before giving up on a port
pub const ID_CHALLENGE_ATTEMPTS: usize = 3;

/// Acknowledgement line sent by the device after a successful set command
pub const RESPONSE_OK: &str = "OK";

/// Line terminator for text commands
pub const LINE_TERMINATOR: u8 = b'\n';

/// Binary frame marker (always set on binary headers)
pub const HEADER_BIN: u8 = 0x80;

/// Broadcast to every device on the chain
pub const HEADER_BCAST: u8 = 0x40;

/// Address all channels of the device
pub const HEADER_ALLCH: u8 = 0x20;

/// Device-wise addressing (device id + 8-bit channel)
pub const HEADER_ADDM: u8 = 0x10;

/// Read (set) or write (clear)
pub const HEADER_RW: u8 = 0x08;

/// Action command
pub const HEADER_ACT: u8 = 0x04;

/// Data extension: payload is a word count followed by that many words
pub const HEADER_DEXT: u8 = 0x02;

/// Parity bit, managed by the encoder
pub const HEADER_PARITY: u8 = 0x01;

/// Largest channel addressable with channel-wise addressing
pub const MAX_CHANNEL_WIDE: u32 = 0xFFFF;

/// Largest channel addressable with device-wise addressing
pub const MAX_CHANNEL_DEVICE_WISE: u32 = 0xFF;
