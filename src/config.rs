//! Session configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::*;
use crate::types::TargetErrors;

/// Settings for a [`Qontroller`](crate::Qontroller) session.
///
/// Serial line parameters are fixed by the hardware and are not part of
/// the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Port to open, e.g. `/dev/ttyUSB0` or `COM3`
    pub serial_port_name: Option<String>,
    /// Device to look for, e.g. `Q8iv-0042`
    pub device_id: Option<String>,
    pub response_timeout_ms: u64,
    pub inter_response_timeout_ms: u64,
    pub log_capacity: usize,
    /// Wait for the acknowledgement of set commands
    pub wait_for_responses: bool,
    /// Echo every log entry to stdout
    pub log_to_stdout: bool,
    /// Errors that abort a command when the call does not say otherwise
    pub default_target_errors: TargetErrors,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            serial_port_name: None,
            device_id: None,
            response_timeout_ms: RESPONSE_TIMEOUT_MS,
            inter_response_timeout_ms: INTER_RESPONSE_TIMEOUT_MS,
            log_capacity: LOG_CAPACITY,
            wait_for_responses: true,
            log_to_stdout: false,
            default_target_errors: TargetErrors::None,
        }
    }
}

impl SessionConfig {
    pub fn port(name: impl Into<String>) -> Self {
        Self {
            serial_port_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Self::default()
        }
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn inter_response_timeout(&self) -> Duration {
        Duration::from_millis(self.inter_response_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.response_timeout(), Duration::from_millis(50));
        assert_eq!(config.inter_response_timeout(), Duration::from_millis(20));
        assert_eq!(config.log_capacity, 256);
        assert!(config.wait_for_responses);
        assert_eq!(config.default_target_errors, TargetErrors::None);
    }

    #[test]
    fn test_partial_json() {
        let config: SessionConfig = serde_json::from_str(
            r#"{"serial_port_name": "/dev/ttyUSB0", "response_timeout_ms": 100,
                "default_target_errors": {"codes": [1, 2]}}"#,
        )
        .unwrap();

        assert_eq!(config.serial_port_name.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.response_timeout_ms, 100);
        assert_eq!(config.inter_response_timeout_ms, 20);
        assert_eq!(config.default_target_errors, TargetErrors::codes([1, 2]));
    }

    #[test]
    fn test_target_errors_all() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"default_target_errors": "all"}"#).unwrap();
        assert_eq!(config.default_target_errors, TargetErrors::All);
    }
}
