//! Command formatting for the text and binary wire formats.
//!
//! Text commands have the form `<command_id><channel><operator><value>\n`,
//! for example `v7=1.0` or `vipall?`. Binary commands are packed frames:
//!
//! ```text
//! [header] [index] [addr0] [addr1] [addr2] [data...]
//! ```
//!
//! The header byte always carries `BIN` (0x80) and an even-parity bit in
//! position 0. The three address bytes hold a zero pad and a big-endian
//! 16-bit channel, or, with device-wise addressing, a big-endian device id
//! and an 8-bit channel. Data is one big-endian word, or with `DEXT` a word
//! count followed by that many words.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

use crate::constants::*;
use crate::error::{QontrolError, Result};
use crate::types::{Operator, Value};

/// A text-protocol command
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Mnemonic, e.g. `v`, `imax`, `vipall`
    pub id: String,
    /// Channel index; `None` omits the channel field
    pub channel: Option<u32>,
    pub operator: Operator,
    /// Only present on set commands
    pub value: Option<Value>,
}

impl Command {
    /// Read command (`<id><ch>?`)
    pub fn get(id: impl Into<String>) -> Self {
        Command {
            id: id.into(),
            channel: None,
            operator: Operator::Get,
            value: None,
        }
    }

    /// Write command (`<id><ch>=<value>`)
    pub fn set(id: impl Into<String>, value: impl Into<Value>) -> Self {
        Command {
            id: id.into(),
            channel: None,
            operator: Operator::Set,
            value: Some(value.into()),
        }
    }

    pub fn channel(mut self, channel: u32) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn is_get(&self) -> bool {
        self.operator == Operator::Get
    }

    /// Check the command can be put on the wire.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() || !self.id.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(QontrolError::InvalidCommand(self.id.clone()));
        }

        if let Some(ch) = self.channel {
            if ch > MAX_CHANNEL_WIDE {
                return Err(QontrolError::InvalidChannel {
                    channel: ch,
                    max: MAX_CHANNEL_WIDE,
                });
            }
        }

        match (self.operator, &self.value) {
            (Operator::Get, Some(_)) => Err(QontrolError::InvalidValue(format!(
                "query {:?} cannot carry a value",
                self.id
            ))),
            (Operator::Set, None) => Err(QontrolError::InvalidValue(format!(
                "set command {:?} has no value",
                self.id
            ))),
            (Operator::Set, Some(value)) => value.validate(),
            (Operator::Get, None) => Ok(()),
        }
    }

    /// Validate and serialize to the exact line sent to the device.
    pub fn to_wire(&self) -> Result<String> {
        self.validate()?;
        Ok(format!("{self}\n"))
    }

    /// Parse a wire line back into a command.
    pub fn parse(line: &str) -> Result<Command> {
        let line = line.trim_end_matches(['\r', '\n']);
        let id_end = line
            .find(|c: char| !c.is_ascii_alphabetic())
            .ok_or_else(|| QontrolError::Parse(format!("no operator in {line:?}")))?;
        let id = &line[..id_end];
        let rest = &line[id_end..];

        let ch_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| QontrolError::Parse(format!("no operator in {line:?}")))?;
        let channel = if ch_end == 0 {
            None
        } else {
            Some(
                rest[..ch_end]
                    .parse::<u32>()
                    .map_err(|e| QontrolError::Parse(format!("bad channel in {line:?}: {e}")))?,
            )
        };

        let mut tail = rest[ch_end..].chars();
        let operator = tail
            .next()
            .and_then(Operator::from_symbol)
            .ok_or_else(|| QontrolError::Parse(format!("bad operator in {line:?}")))?;
        let value_str = tail.as_str();

        let value = match operator {
            Operator::Get if value_str.is_empty() => None,
            Operator::Get => {
                return Err(QontrolError::Parse(format!(
                    "query {line:?} carries a value"
                )))
            }
            Operator::Set => Some(parse_value(value_str)?),
        };

        let command = Command {
            id: id.to_string(),
            channel,
            operator,
            value,
        };
        command.validate()?;
        Ok(command)
    }
}

fn bad_value(s: &str, e: impl fmt::Display) -> QontrolError {
    QontrolError::Parse(format!("bad value {s:?}: {e}"))
}

fn parse_value(s: &str) -> Result<Value> {
    if s.contains(',') {
        let values = s
            .split(',')
            .map(|v| v.trim().parse::<f64>().map_err(|e| bad_value(s, e)))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Value::Vector(values));
    }

    match s.parse::<i64>() {
        Ok(v) => Ok(Value::Int(v)),
        Err(_) => s.parse::<f64>().map(Value::Float).map_err(|e| bad_value(s, e)),
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)?;
        if let Some(ch) = self.channel {
            write!(f, "{ch}")?;
        }
        write!(f, "{}", self.operator.symbol())?;
        if let Some(value) = &self.value {
            write!(f, "{value}")?;
        }
        Ok(())
    }
}

/// Binary command index for a mnemonic, if the device knows it.
pub fn command_code(name: &str) -> Option<u8> {
    let code = match name.to_ascii_uppercase().as_str() {
        "V" => 0x00,
        "I" => 0x01,
        "VMAX" => 0x02,
        "IMAX" => 0x03,
        "VCAL" => 0x04,
        "ICAL" => 0x05,
        "VERR" => 0x06,
        "IERR" => 0x07,
        "VIP" => 0x0A,
        "SR" => 0x0B,
        "PDI" => 0x0C,
        "PDP" => 0x0D,
        "PDR" => 0x0E,
        "GAIN" => 0x0F,
        "VFULL" => 0x20,
        "IFULL" => 0x21,
        "NCHAN" => 0x22,
        "FIRMWARE" => 0x23,
        "ID" => 0x24,
        "LIFETIME" => 0x25,
        "NVM" => 0x26,
        "LOG" => 0x27,
        "QUIET" => 0x28,
        "LED" => 0x31,
        "NUP" => 0x32,
        "ADCT" => 0x33,
        "ADCN" => 0x34,
        "CCFN" => 0x35,
        "INTEST" => 0x36,
        "OK" => 0x37,
        "DIGSUP" => 0x38,
        "HELP" => 0x41,
        "SAFE" => 0x42,
        "ROCOM" => 0x43,
        _ => return None,
    };
    Some(code)
}

/// User-selectable header bits of a binary command.
///
/// `BIN`, `ADDM` and the parity bit are managed by the encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    pub const NONE: HeaderFlags = HeaderFlags(0);
    pub const BCAST: HeaderFlags = HeaderFlags(HEADER_BCAST);
    pub const ALLCH: HeaderFlags = HeaderFlags(HEADER_ALLCH);
    pub const RW: HeaderFlags = HeaderFlags(HEADER_RW);
    pub const ACT: HeaderFlags = HeaderFlags(HEADER_ACT);
    pub const DEXT: HeaderFlags = HeaderFlags(HEADER_DEXT);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: HeaderFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HeaderFlags {
    type Output = HeaderFlags;

    fn bitor(self, rhs: HeaderFlags) -> HeaderFlags {
        HeaderFlags(self.0 | rhs.0)
    }
}

/// How the three address bytes of a binary frame are laid out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingMode {
    /// ADDM=0: 16-bit channel across the whole chain
    #[default]
    ChannelWise,
    /// ADDM=1: 16-bit device id plus 8-bit channel within that device
    DeviceWise { device_id: u16 },
}

impl AddressingMode {
    pub fn max_channel(self) -> u32 {
        match self {
            AddressingMode::ChannelWise => MAX_CHANNEL_WIDE,
            AddressingMode::DeviceWise { .. } => MAX_CHANNEL_DEVICE_WISE,
        }
    }
}

/// Data words of a binary command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryPayload {
    Word(i64),
    /// Sent with `DEXT`
    Words(Vec<i64>),
}

impl Default for BinaryPayload {
    fn default() -> Self {
        BinaryPayload::Word(0)
    }
}

fn to_word(value: i64) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| QontrolError::InvalidValue(format!("{value} does not fit in 16 bits")))
}

/// A binary-protocol command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryCommand {
    pub index: u8,
    pub flags: HeaderFlags,
    pub addressing: AddressingMode,
    pub channel: u32,
    pub payload: BinaryPayload,
}

impl BinaryCommand {
    /// Command by raw index
    pub fn new(index: u8) -> Self {
        BinaryCommand {
            index,
            flags: HeaderFlags::NONE,
            addressing: AddressingMode::ChannelWise,
            channel: 0,
            payload: BinaryPayload::default(),
        }
    }

    /// Command by mnemonic, resolved through the command code table
    pub fn named(name: &str) -> Result<Self> {
        command_code(name)
            .map(BinaryCommand::new)
            .ok_or_else(|| QontrolError::InvalidCommand(name.to_string()))
    }

    pub fn flags(mut self, flags: HeaderFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    pub fn read(self) -> Self {
        self.flags(HeaderFlags::RW)
    }

    pub fn addressing(mut self, addressing: AddressingMode) -> Self {
        self.addressing = addressing;
        self
    }

    pub fn channel(mut self, channel: u32) -> Self {
        self.channel = channel;
        self
    }

    pub fn value(mut self, value: i64) -> Self {
        self.payload = BinaryPayload::Word(value);
        self
    }

    pub fn values(mut self, values: Vec<i64>) -> Self {
        self.payload = BinaryPayload::Words(values);
        self
    }

    pub fn is_read(&self) -> bool {
        self.flags.contains(HeaderFlags::RW)
    }

    pub fn is_action(&self) -> bool {
        self.flags.contains(HeaderFlags::ACT)
    }

    fn is_extended(&self) -> bool {
        self.flags.contains(HeaderFlags::DEXT) || matches!(self.payload, BinaryPayload::Words(_))
    }

    /// Header byte including `BIN`, `ADDM`, `DEXT` and the parity bit.
    pub fn header(&self) -> u8 {
        let mut header = HEADER_BIN | self.flags.bits();
        if matches!(self.addressing, AddressingMode::DeviceWise { .. }) {
            header |= HEADER_ADDM;
        }
        if self.is_extended() {
            header |= HEADER_DEXT;
        }
        if header.count_ones() % 2 == 1 {
            header |= HEADER_PARITY;
        }
        header
    }

    /// Validate and pack the frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let max = self.addressing.max_channel();
        if self.channel > max {
            return Err(QontrolError::InvalidChannel {
                channel: self.channel,
                max,
            });
        }

        let mut frame = vec![self.header(), self.index];

        match self.addressing {
            AddressingMode::ChannelWise => {
                frame.push(0x00);
                frame.extend_from_slice(&(self.channel as u16).to_be_bytes());
            }
            AddressingMode::DeviceWise { device_id } => {
                frame.extend_from_slice(&device_id.to_be_bytes());
                frame.push(self.channel as u8);
            }
        }

        let words: Vec<u16> = match &self.payload {
            BinaryPayload::Word(v) => vec![to_word(*v)?],
            BinaryPayload::Words(vs) => vs.iter().map(|v| to_word(*v)).collect::<Result<_>>()?,
        };

        if self.is_extended() {
            let count = u16::try_from(words.len()).map_err(|_| {
                QontrolError::InvalidValue(format!("{} data words exceed 0xFFFF", words.len()))
            })?;
            frame.extend_from_slice(&count.to_be_bytes());
            for word in &words {
                frame.extend_from_slice(&word.to_be_bytes());
            }
        } else {
            frame.extend_from_slice(&words[0].to_be_bytes());
        }

        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_text_format() {
        assert_eq!(Command::set("v", 1.0).channel(7).to_wire().unwrap(), "v7=1.0\n");
        assert_eq!(Command::get("v").channel(7).to_wire().unwrap(), "v7?\n");
        assert_eq!(Command::get("vipall").to_wire().unwrap(), "vipall?\n");
        assert_eq!(Command::set("imax", 200).channel(3).to_wire().unwrap(), "imax3=200\n");
        assert_eq!(
            Command::set("vvec", vec![1.0, 2.5]).channel(8).to_wire().unwrap(),
            "vvec8=1.0,2.5\n"
        );
    }

    #[test]
    fn test_text_round_trip() {
        let commands = vec![
            Command::set("v", 1.0).channel(7),
            Command::set("vmax", 5.0).channel(3),
            Command::set("imax", 200).channel(3),
            Command::set("v", -0.125).channel(65535),
            Command::set("vvec", vec![0.5, 1.0, 2.25]).channel(16),
            Command::get("v").channel(0),
            Command::get("vipall"),
            Command::set("nup", 0),
            Command::set("v", 1e15).channel(1),
            Command::set("v", -2.5e20).channel(2),
        ];
        for cmd in commands {
            let wire = cmd.to_wire().unwrap();
            assert_eq!(Command::parse(&wire).unwrap(), cmd, "wire {wire:?}");
        }
    }

    #[test]
    fn test_text_validation() {
        assert!(matches!(
            Command::get("v").channel(0x1_0000).to_wire(),
            Err(QontrolError::InvalidChannel { channel: 0x1_0000, max: 0xFFFF })
        ));
        assert!(matches!(
            Command::set("v", f64::NAN).channel(1).to_wire(),
            Err(QontrolError::InvalidValue(_))
        ));
        assert!(matches!(Command::get("v2x").to_wire(), Err(QontrolError::InvalidCommand(_))));
        assert!(matches!(Command::get("").to_wire(), Err(QontrolError::InvalidCommand(_))));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Command::parse("v7").is_err());
        assert!(Command::parse("v7?1.0").is_err());
        assert!(Command::parse("v7=abc").is_err());
    }

    #[test]
    fn test_header_parity() {
        // 0x80 | RW = 0x88, two bits set: even parity already
        let read = BinaryCommand::new(0x00).read();
        assert_eq!(read.header(), 0x88);

        // 0x80 alone has one bit set, parity bit added
        let write = BinaryCommand::new(0x00);
        assert_eq!(write.header(), 0x81);

        let allch = BinaryCommand::new(0x00).read().flags(HeaderFlags::ALLCH);
        assert_eq!(allch.header(), 0xA9);
    }

    #[test]
    fn test_binary_channel_wise() {
        let frame = BinaryCommand::named("v").unwrap().channel(0x0102).value(0x7FFF).encode().unwrap();
        assert_eq!(frame, vec![0x81, 0x00, 0x00, 0x01, 0x02, 0x7F, 0xFF]);
    }

    #[test]
    fn test_binary_device_wise() {
        let frame = BinaryCommand::named("i")
            .unwrap()
            .read()
            .addressing(AddressingMode::DeviceWise { device_id: 5 })
            .channel(3)
            .encode()
            .unwrap();
        // 0x80 | ADDM | RW = 0x98, three bits set -> parity
        assert_eq!(frame, vec![0x99, 0x01, 0x00, 0x05, 0x03, 0x00, 0x00]);
    }

    #[test]
    fn test_binary_dext() {
        let frame = BinaryCommand::new(0x00).channel(8).values(vec![1, 5, 90]).encode().unwrap();
        // 0x80 | DEXT = 0x82, two bits set
        assert_eq!(
            frame,
            vec![0x82, 0x00, 0x00, 0x00, 0x08, 0x00, 0x03, 0x00, 0x01, 0x00, 0x05, 0x00, 0x5A]
        );
    }

    #[test]
    fn test_binary_validation() {
        let over = BinaryCommand::new(0)
            .addressing(AddressingMode::DeviceWise { device_id: 1 })
            .channel(0x100)
            .encode();
        assert!(matches!(over, Err(QontrolError::InvalidChannel { channel: 0x100, max: 0xFF })));

        assert!(BinaryCommand::new(0).channel(0xFFFF).encode().is_ok());
        assert!(matches!(
            BinaryCommand::new(0).value(0x1_0000).encode(),
            Err(QontrolError::InvalidValue(_))
        ));
        assert!(matches!(
            BinaryCommand::new(0).values(vec![1, -1]).encode(),
            Err(QontrolError::InvalidValue(_))
        ));
        assert!(matches!(BinaryCommand::named("bogus"), Err(QontrolError::InvalidCommand(_))));
    }
}
