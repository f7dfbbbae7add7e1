use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::error::{QontrolError, Result};

/// Command operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// `=`, write a value
    Set,
    /// `?`, read a value
    Get,
}

impl Operator {
    pub fn symbol(self) -> char {
        match self {
            Operator::Set => '=',
            Operator::Get => '?',
        }
    }

    pub fn from_symbol(c: char) -> Option<Self> {
        match c {
            '=' => Some(Operator::Set),
            '?' => Some(Operator::Get),
            _ => None,
        }
    }
}

/// Value carried by a set command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Vector(Vec<f64>),
}

impl Value {
    /// Reject values the device cannot parse (NaN, infinities, empty vectors).
    pub fn validate(&self) -> Result<()> {
        match self {
            Value::Int(_) => Ok(()),
            Value::Float(v) if v.is_finite() => Ok(()),
            Value::Float(v) => Err(QontrolError::InvalidValue(format!("{v} is not finite"))),
            Value::Vector(vs) if vs.is_empty() => {
                Err(QontrolError::InvalidValue("empty value vector".to_string()))
            }
            Value::Vector(vs) => match vs.iter().find(|v| !v.is_finite()) {
                Some(v) => Err(QontrolError::InvalidValue(format!("{v} is not finite"))),
                None => Ok(()),
            },
        }
    }
}

fn write_float(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    if v.fract() == 0.0 {
        write!(f, "{v:.1}")
    } else {
        write!(f, "{v}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write_float(f, *v),
            Value::Vector(vs) => {
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write_float(f, *v)?;
                }
                Ok(())
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(vs: Vec<f64>) -> Self {
        Value::Vector(vs)
    }
}

/// Error reported by the device, decoded from an `E<code>[:<subcode>]:<channel>` token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub code: u8,
    pub subcode: Option<u8>,
    pub channel: Option<u32>,
    pub description: String,
    pub raw: String,
    pub timestamp: DateTime<Utc>,
    /// Time since the session was created
    pub proctime: Duration,
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{:02}", self.code)?;
        if let Some(sub) = self.subcode {
            write!(f, ":{sub:02}")?;
        }
        if let Some(ch) = self.channel {
            write!(f, " on channel {ch}")?;
        }
        write!(f, ": {}", self.description)
    }
}

/// Look up the human-readable description of a device error code.
///
/// Codes 14 and 15 are refined by their subcode. Unknown codes map to
/// "Unknown error".
pub fn error_description(code: u8, subcode: Option<u8>) -> &'static str {
    match (code, subcode) {
        (0, _) => "Unknown error",
        (1, _) => "Overvoltage",
        (2, _) => "Overcurrent",
        (3, _) => "Power error",
        (4, _) => "Calibration error",
        (5, _) => "Output error",
        (10, _) => "Unrecognised command",
        (11, _) => "Unrecognised parameter",
        (12, _) => "Unrecognised port",
        (13, _) => "Operation forbidden",
        (14, Some(1)) => "Serial buffer overflow (transmit)",
        (14, Some(_)) => "Serial buffer overflow (receive)",
        (14, None) => "Serial buffer overflow",
        (15, Some(sub)) if sub % 10 == 1 => "Serial framing error",
        (15, Some(_)) => "Serial overflow error",
        (15, None) => "Serial communication error",
        (16, _) => "Internal software error",
        (17, _) => "SPI error",
        (18, _) => "ADC error",
        (19, _) => "I2C error",
        (20, _) => "Interlock triggered",
        (30, _) => "Too many errors, some have been suppressed",
        (31, _) => "Firmware trap",
        (90, _) => "Powered up",
        _ => "Unknown error",
    }
}

/// Device error codes that abort a command instead of only being logged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetErrors {
    /// Log every error, abort on none
    #[default]
    None,
    /// Abort on every error
    All,
    /// Abort on the listed codes
    Codes(BTreeSet<u8>),
}

impl TargetErrors {
    pub fn codes<I: IntoIterator<Item = u8>>(codes: I) -> Self {
        TargetErrors::Codes(codes.into_iter().collect())
    }

    pub fn contains(&self, code: u8) -> bool {
        match self {
            TargetErrors::None => false,
            TargetErrors::All => true,
            TargetErrors::Codes(codes) => codes.contains(&code),
        }
    }
}

/// What the log handler wants done with an error entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerDecision {
    Continue,
    /// Abort the running operation with a device error
    Abort(String),
}

/// A classified line received from the device
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Data(String),
    /// `OK` acknowledgement of a set command
    Ack,
    Error(ErrorEvent),
    /// Blank or unprintable line
    Other(String),
}

/// Data line matched by the output pattern of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub raw: String,
    /// Capture groups of the output pattern, in order
    pub groups: Vec<Option<String>>,
}

impl Payload {
    /// First capture group, or the whole line when the pattern has none.
    pub fn value(&self) -> Option<&str> {
        if self.groups.is_empty() {
            Some(self.raw.as_str())
        } else {
            self.groups[0].as_deref()
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        let s = self.value().ok_or_else(|| {
            QontrolError::Parse(format!("no value captured from {:?}", self.raw))
        })?;
        s.trim()
            .parse::<f64>()
            .map_err(|e| QontrolError::Parse(format!("{s:?} is not a number: {e}")))
    }

    pub fn as_i64(&self) -> Result<i64> {
        let s = self.value().ok_or_else(|| {
            QontrolError::Parse(format!("no value captured from {:?}", self.raw))
        })?;
        s.trim()
            .parse::<i64>()
            .map_err(|e| QontrolError::Parse(format!("{s:?} is not an integer: {e}")))
    }
}

/// One module on the daisy chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Full id, e.g. `Q8iv-0042`
    pub device_id: String,
    pub device_type: String,
    pub device_serial: String,
    pub n_chs: usize,
    /// Position on the chain, 0 being the module attached to the host
    pub index: Option<usize>,
}
