//! # Qontrol Protocol Library
//!
//! A Rust library for driving Qontrol multi-channel voltage/current
//! controllers over their serial command protocol.
//!
//! ## Features
//!
//! - Text (`v3=4.5`, `i7?`) and binary framed commands
//! - Decoding of device error tokens (`E02:3`) with descriptions
//! - Bounded event log with an optional error handler that can abort
//! - Daisy chain discovery and bulk access to channel ranges across modules
//! - Connection by serial port name or by device id
//! - A scripted virtual device for testing without hardware
//!
//! ## Example
//!
//! ```no_run
//! use qontrol_protocol::{Command, IssueOptions, Qontroller, SessionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut q = Qontroller::open(SessionConfig::port("/dev/ttyUSB0"))?;
//!     q.issue_command(&Command::set("v", 4.5).channel(3), &IssueOptions::new())?;
//!     let currents = q.get_channels("i", 0..q.n_channels())?;
//!     println!("Currents: {currents:?}");
//!     Ok(())
//! }
//! ```

pub mod channels;
pub mod command;
pub mod config;
pub mod constants;
pub mod error;
pub mod log;
pub mod parser;
pub mod protocol;
pub mod transport;
pub mod types;
pub mod virtual_device;

pub use channels::{ChannelMap, ChannelValues, ModuleSpan};
pub use command::{AddressingMode, BinaryCommand, BinaryPayload, Command, HeaderFlags};
pub use config::SessionConfig;
pub use error::{QontrolError, Result};
pub use log::{fatal_error_handler, EventLog, LogEntry, LogHandler, LogKind};
pub use protocol::{IssueOptions, Qontroller};
pub use transport::{list_ports, SerialTransport, Transport};
pub use types::*;
pub use virtual_device::VirtualDevice;
