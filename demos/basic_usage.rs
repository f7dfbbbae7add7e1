//! Basic Usage Example
//!
//! Connects to a Qontrol daisy chain, prints its modules, sets a voltage
//! ramp across all channels and reads the currents back.
//!
//! Usage:
//!   cargo run --example basic_usage                  # Interactive mode
//!   cargo run --example basic_usage -- /dev/ttyUSB0  # Specify port
//!   cargo run --example basic_usage -- Q8iv-0042     # Specify device id
//!
//! Set RUST_LOG to control logging:
//!   RUST_LOG=qontrol_protocol=debug cargo run --example basic_usage

use inquire::Select;
use qontrol_protocol::{
    fatal_error_handler, list_ports, QontrolError, Qontroller, Result, SessionConfig,
    TargetErrors,
};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn select_port() -> Result<String> {
    let ports = list_ports()?;

    if ports.is_empty() {
        eprintln!("No serial ports found!");
        std::process::exit(1);
    }

    let port_names: Vec<String> = ports.iter().map(|p| p.port_name.clone()).collect();
    Select::new("Select a serial port:", port_names)
        .prompt()
        .map_err(|e| QontrolError::DeviceNotFound(format!("selection cancelled: {e}")))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match std::env::args().nth(1) {
        Some(arg) if arg.starts_with('Q') => SessionConfig::device(arg),
        Some(arg) => SessionConfig::port(arg),
        None => SessionConfig::port(select_port()?),
    };

    let mut q = Qontroller::open(config)?;
    info!(
        "Connected to {} on {}",
        q.device_id().unwrap_or("?"),
        q.serial_port_name().unwrap_or("?")
    );

    for module in q.chain() {
        info!("  {} ({} channels) at index {:?}", module.device_id, module.n_chs, module.index);
    }
    info!("Firmware: {}", q.firmware()?);

    // Stop on overcurrent or overvoltage
    q.set_log_handler(Some(fatal_error_handler(TargetErrors::codes([1, 2]))));

    let n = q.n_channels();
    let ramp: Vec<f64> = (0..n).map(|ch| ch as f64 * 0.5).collect();
    q.set_channels("v", 0..n, ramp)?;
    q.wait(Duration::from_millis(100))?;

    let currents = q.get_channels("i", 0..n)?;
    for (ch, current) in currents.iter().enumerate() {
        info!("  ch {ch:>3}: {current:.3} mA");
    }

    q.set_channels("v", 0..n, 0.0)?;
    q.print_log(Some(10));
    Ok(())
}
