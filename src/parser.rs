//! Parsing of lines received from the device.
//!
//! Every received line is one of: a data line, the `OK` acknowledgement, an
//! error token (`E<code>[:<subcode>]:<channel>`), or an informational line
//! that is neither (blank or containing control characters).

use chrono::Utc;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use crate::constants::RESPONSE_OK;
use crate::error::{QontrolError, Result};
use crate::types::{error_description, ErrorEvent, Line, ModuleInfo};

/// Anything starting with `E` and a digit is treated as an error token.
static ERROR_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^E\d").expect("valid error-like regex"));

/// `<device type>-<hex device number>`, e.g. `Q8iv-00A3`.
static DEVICE_ID_PARTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(Q\w+)-([0-9a-fA-F]+)$").expect("valid device id regex"));

/// Device id as found in an `id?` reply, possibly with a wildcard number.
static DEVICE_ID_REPLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+\d\w*-[0-9a-fA-F*]+").expect("valid id reply regex"));

/// One `nupall?` line: `<device id> : <chain index>`.
static CHAIN_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\x00*([^-\x00:\s]+)-([0-9a-fA-F*]+)\s*:\s*(\S+)").expect("valid chain regex")
});

/// Channel count embedded in the device type, e.g. `8` in `Q8iv`.
static TYPE_CHANNELS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\d]+(\d+)").expect("valid channel count regex"));

/// Decode an error token into an [`ErrorEvent`].
///
/// Accepted forms are `E<code>`, `E<code>:<channel>` and
/// `E<code>:<subcode>:<channel>`. Unknown codes still parse, with the
/// "Unknown error" description. Anything else is a `MalformedError`.
pub fn parse_error_token(token: &str, proctime: Duration) -> Result<ErrorEvent> {
    let token = token.trim();
    let malformed = || QontrolError::MalformedError(token.to_string());

    let body = token.strip_prefix('E').ok_or_else(malformed)?;
    let fields: Vec<&str> = body.split(':').collect();
    if fields.iter().any(|f| f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit())) {
        return Err(malformed());
    }

    let (code, subcode, channel) = match fields.as_slice() {
        [code] => (*code, None, None),
        [code, channel] => (*code, None, Some(*channel)),
        [code, subcode, channel] => (*code, Some(*subcode), Some(*channel)),
        _ => return Err(malformed()),
    };

    let code: u8 = code.parse().map_err(|_| malformed())?;
    let subcode: Option<u8> = subcode
        .map(|s| s.parse().map_err(|_| malformed()))
        .transpose()?;
    let channel: Option<u32> = channel
        .map(|s| s.parse().map_err(|_| malformed()))
        .transpose()?;

    Ok(ErrorEvent {
        code,
        subcode,
        channel,
        description: error_description(code, subcode).to_string(),
        raw: token.to_string(),
        timestamp: Utc::now(),
        proctime,
    })
}

/// Classify a raw line (terminator already removed or not).
///
/// A token that looks like an error but does not parse is returned as
/// `MalformedError`.
pub fn classify_line(raw: &str, proctime: Duration) -> Result<Line> {
    let line = raw.trim_end_matches(['\r', '\n']);

    if line.trim().is_empty() || line.chars().any(|c| c.is_control()) {
        return Ok(Line::Other(line.to_string()));
    }
    if line.trim() == RESPONSE_OK {
        return Ok(Line::Ack);
    }
    if ERROR_LIKE.is_match(line) {
        return parse_error_token(line, proctime).map(Line::Error);
    }
    Ok(Line::Data(line.to_string()))
}

/// Split a device id into its type and number.
pub fn parse_device_id(device_id: &str) -> Result<(String, String)> {
    let caps = DEVICE_ID_PARTS
        .captures(device_id.trim())
        .ok_or_else(|| QontrolError::InvalidDeviceId(device_id.to_string()))?;
    Ok((caps[1].to_string(), caps[2].to_string()))
}

/// Find a device id in the reply to an `id?` challenge.
pub fn find_device_id(reply: &str) -> Option<String> {
    DEVICE_ID_REPLY.find(reply).map(|m| m.as_str().to_string())
}

/// Number of channels implied by a device type, e.g. 8 for `Q8iv`.
pub fn channels_for_type(device_type: &str) -> Option<usize> {
    TYPE_CHANNELS
        .captures(device_type)
        .and_then(|caps| caps[1].parse().ok())
}

/// Parse one line of a `nupall?` / `nup?` reply.
pub fn parse_chain_entry(line: &str) -> Option<ModuleInfo> {
    let caps = CHAIN_ENTRY.captures(line.trim_end())?;
    let device_type = caps[1].to_string();
    let device_serial = caps[2].to_string();
    Some(ModuleInfo {
        device_id: format!("{device_type}-{device_serial}"),
        n_chs: channels_for_type(&device_type).unwrap_or(0),
        device_type,
        device_serial,
        index: caps[3].parse().ok(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_error_with_channel() {
        let event = parse_error_token("E02:3", Duration::ZERO).unwrap();
        assert_eq!(event.code, 2);
        assert_eq!(event.subcode, None);
        assert_eq!(event.channel, Some(3));
        assert_eq!(event.description, "Overcurrent");
        assert_eq!(event.raw, "E02:3");
    }

    #[test]
    fn test_parse_error_with_subcode() {
        let event = parse_error_token("E14:01:0", Duration::ZERO).unwrap();
        assert_eq!((event.code, event.subcode, event.channel), (14, Some(1), Some(0)));
        assert_eq!(event.description, "Serial buffer overflow (transmit)");

        let event = parse_error_token("E15:21:7", Duration::ZERO).unwrap();
        assert_eq!(event.description, "Serial framing error");
    }

    #[test]
    fn test_parse_error_without_channel() {
        let event = parse_error_token("E10", Duration::ZERO).unwrap();
        assert_eq!((event.code, event.channel), (10, None));
        assert_eq!(event.description, "Unrecognised command");
    }

    #[test]
    fn test_unknown_codes_still_parse() {
        for code in [6u8, 7, 42, 99, 255] {
            let event = parse_error_token(&format!("E{code}:1"), Duration::ZERO).unwrap();
            assert_eq!(event.code, code);
            assert_eq!(event.description, "Unknown error");
        }
    }

    #[test]
    fn test_malformed_tokens() {
        for token in ["E", "E02:", "E2:x", "E1:2:3:4", "X02:3", "E300:1", "E02::3"] {
            assert!(
                matches!(parse_error_token(token, Duration::ZERO), Err(QontrolError::MalformedError(_))),
                "token {token:?}"
            );
        }
    }

    #[test]
    fn test_classify_lines() {
        assert_eq!(classify_line("1.000\n", Duration::ZERO).unwrap(), Line::Data("1.000".to_string()));
        assert_eq!(classify_line("OK\r\n", Duration::ZERO).unwrap(), Line::Ack);
        assert!(matches!(classify_line("E01:4\n", Duration::ZERO).unwrap(), Line::Error(e) if e.code == 1));
        assert_eq!(classify_line("\n", Duration::ZERO).unwrap(), Line::Other(String::new()));
        assert!(matches!(classify_line("\x00\x07", Duration::ZERO).unwrap(), Line::Other(_)));
        assert!(matches!(classify_line("E9x", Duration::ZERO), Err(QontrolError::MalformedError(_))));
        // Data lines may start with E as long as no digit follows
        assert_eq!(classify_line("Enabled", Duration::ZERO).unwrap(), Line::Data("Enabled".to_string()));
    }

    #[test]
    fn test_device_ids() {
        assert_eq!(
            parse_device_id("Q8iv-00A3").unwrap(),
            ("Q8iv".to_string(), "00A3".to_string())
        );
        assert!(parse_device_id("Q8iv").is_err());
        assert!(parse_device_id("8iv-0001").is_err());
        assert_eq!(find_device_id("Q8b-1234\n").as_deref(), Some("Q8b-1234"));
        assert_eq!(find_device_id("garbage"), None);
        assert_eq!(channels_for_type("Q8iv"), Some(8));
        assert_eq!(channels_for_type("Q16b"), Some(16));
    }

    #[test]
    fn test_chain_entry() {
        let module = parse_chain_entry("Q8iv-0042 : 1\n").unwrap();
        assert_eq!(
            module,
            ModuleInfo {
                device_id: "Q8iv-0042".to_string(),
                device_type: "Q8iv".to_string(),
                device_serial: "0042".to_string(),
                n_chs: 8,
                index: Some(1),
            }
        );
        assert!(parse_chain_entry("OK").is_none());
    }
}
