use regex::Regex;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::channels::ChannelMap;
use crate::command::{BinaryCommand, BinaryPayload, Command};
use crate::config::SessionConfig;
use crate::constants::*;
use crate::error::{QontrolError, Result};
use crate::log::{EventLog, LogEntry, LogHandler};
use crate::parser::{classify_line, find_device_id, parse_chain_entry, parse_device_id};
use crate::transport::{list_ports, SerialTransport, Transport};
use crate::types::*;

static DEFAULT_OUTPUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(.*)").expect("valid default output regex"));

/// Signed decimal number, as returned by numeric queries
pub(crate) const NUMBER_REGEX: &str = r"([+-]?[\d.]+)";

/// Error codes that abort chain discovery
const CHAIN_TARGET_ERRORS: [u8; 8] = [0, 10, 11, 12, 13, 14, 15, 16];

/// Per-call options for [`Qontroller::issue_command`]
#[derive(Debug, Clone, Default)]
pub struct IssueOptions {
    /// Stop once this many data lines have arrived; `None` collects until
    /// the timeout or an acknowledgement
    pub n_lines_requested: Option<usize>,
    /// Errors that abort the call; `None` uses the session default
    pub target_errors: Option<TargetErrors>,
    /// Pattern each data line must match from its start; defaults to `(.*)`
    pub output_regex: Option<Regex>,
    /// Response timeout for this call only
    pub special_timeout: Option<Duration>,
}

impl IssueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(mut self, n: usize) -> Self {
        self.n_lines_requested = Some(n);
        self
    }

    pub fn target_errors(mut self, targets: TargetErrors) -> Self {
        self.target_errors = Some(targets);
        self
    }

    pub fn output_regex(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| QontrolError::Parse(format!("bad output pattern {pattern:?}: {e}")))?;
        self.output_regex = Some(regex);
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.special_timeout = Some(timeout);
        self
    }
}

/// Session with one daisy chain of Qontrol modules.
///
/// Owns the connection; every operation runs synchronously on the
/// caller's thread.
pub struct Qontroller {
    port: Option<Box<dyn Transport>>,
    device_id: Option<String>,
    serial_port_name: Option<String>,
    response_timeout: Duration,
    inter_response_timeout: Duration,
    wait_for_responses: bool,
    default_target_errors: TargetErrors,
    log: EventLog,
    chain: Vec<ModuleInfo>,
    channel_map: ChannelMap,
}

impl Qontroller {
    /// Connect according to `config`: by device id when one is given,
    /// otherwise on the named serial port.
    pub fn open(config: SessionConfig) -> Result<Self> {
        if config.device_id.is_some() {
            return Self::open_by_device_id(config);
        }

        let port_name = config.serial_port_name.clone().ok_or_else(|| {
            let available: Vec<String> = list_ports()
                .unwrap_or_default()
                .into_iter()
                .map(|p| p.port_name)
                .collect();
            QontrolError::DeviceNotFound(format!(
                "no serial port or device id given; available ports: {}",
                available.join(", ")
            ))
        })?;

        let transport = SerialTransport::open(&port_name)?;
        let mut qontroller = Self::with_transport(transport, config);
        qontroller.serial_port_name = Some(port_name.clone());

        let device_id = qontroller.identify()?.ok_or_else(|| {
            QontrolError::DeviceNotFound(format!("no reply to id? on {port_name}"))
        })?;
        info!(port = %port_name, device = %device_id, "connected");

        qontroller.discover_chain();
        Ok(qontroller)
    }

    /// Scan the available serial ports for the configured device id.
    ///
    /// Falls back to a device of the same type when the exact id is not
    /// found.
    pub fn open_by_device_id(config: SessionConfig) -> Result<Self> {
        let target = config
            .device_id
            .clone()
            .ok_or_else(|| QontrolError::InvalidDeviceId(String::new()))?;
        let (target_type, _) = parse_device_id(&target)?;

        let mut fallback: Option<Qontroller> = None;

        for info in list_ports()? {
            let transport = match SerialTransport::open(&info.port_name) {
                Ok(t) => t,
                Err(e) => {
                    debug!(port = %info.port_name, error = %e, "port busy");
                    continue;
                }
            };

            let mut candidate = Self::with_transport(transport, config.clone());
            candidate.serial_port_name = Some(info.port_name.clone());

            let found = match candidate.identify() {
                Ok(Some(id)) => id,
                Ok(None) | Err(_) => {
                    debug!(port = %info.port_name, "no response");
                    continue;
                }
            };

            if found == target {
                info!(port = %info.port_name, device = %found, "connected");
                candidate.discover_chain();
                return Ok(candidate);
            }

            debug!(port = %info.port_name, device = %found, "not the device we are looking for");
            let same_type = parse_device_id(&found)
                .map(|(t, _)| t == target_type)
                .unwrap_or(false);
            if same_type && fallback.is_none() {
                fallback = Some(candidate);
            }
        }

        let mut qontroller = fallback.ok_or_else(|| QontrolError::DeviceNotFound(target.clone()))?;
        warn!(
            requested = %target,
            using = qontroller.device_id.as_deref().unwrap_or(""),
            port = qontroller.serial_port_name.as_deref().unwrap_or(""),
            "device id not found, using device with matching type"
        );
        qontroller.discover_chain();
        Ok(qontroller)
    }

    /// Build a session over an already open transport. No I/O is performed.
    pub fn with_transport(transport: impl Transport + 'static, config: SessionConfig) -> Self {
        let mut log = EventLog::new(config.log_capacity);
        log.set_log_to_stdout(config.log_to_stdout);

        Qontroller {
            port: Some(Box::new(transport)),
            device_id: config.device_id.clone(),
            serial_port_name: config.serial_port_name.clone(),
            response_timeout: config.response_timeout(),
            inter_response_timeout: config.inter_response_timeout(),
            wait_for_responses: config.wait_for_responses,
            default_target_errors: config.default_target_errors,
            log,
            chain: Vec::new(),
            channel_map: ChannelMap::default(),
        }
    }

    /// Ask the device for its id with the `id?` challenge.
    pub fn identify(&mut self) -> Result<Option<String>> {
        let timeout = Duration::from_millis(ID_CHALLENGE_TIMEOUT_MS);

        for attempt in 1..=ID_CHALLENGE_ATTEMPTS {
            self.port
                .as_mut()
                .ok_or(QontrolError::PortClosed)?
                .clear_input()?;
            let wire = "id?\n";
            self.transmit(wire)?;
            self.log.append(LogEntry::command("id", None, None, wire))?;

            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let line = match self.receive_within(remaining) {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    // Line noise while the port settles
                    Err(QontrolError::MalformedError(raw)) => {
                        debug!(line = %raw, "ignoring malformed reply to id?");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if let Line::Data(reply) | Line::Other(reply) = line {
                    if let Some(id) = find_device_id(&reply) {
                        self.device_id = Some(id.clone());
                        return Ok(Some(id));
                    }
                }
            }
            debug!(attempt, "no device id received");
        }
        Ok(None)
    }

    /// Reset the daisy chain and read back its modules.
    ///
    /// Failure is not fatal: the chain is left empty and a warning logged.
    pub fn discover_chain(&mut self) -> &[ModuleInfo] {
        match self.read_chain() {
            Ok(chain) => {
                debug!(modules = chain.len(), "daisy chain discovered");
                self.channel_map = ChannelMap::from_chain(&chain);
                self.chain = chain;
            }
            Err(e) => {
                warn!(error = %e, "unable to determine daisy chain configuration");
                self.chain.clear();
                self.channel_map = ChannelMap::default();
            }
        }
        &self.chain
    }

    fn read_chain(&mut self) -> Result<Vec<ModuleInfo>> {
        self.issue_command(&Command::set("nup", 0), &IssueOptions::new())?;

        let options = IssueOptions::new()
            .target_errors(TargetErrors::codes(CHAIN_TARGET_ERRORS))
            .output_regex(r"\x00*([^:\s]+)\s*:\s*(\S+)")?;

        let replies = match self.issue_command(&Command::get("nupall"), &options) {
            Ok(replies) => replies,
            Err(e) => {
                debug!(error = %e, "nupall? failed, falling back to nup?");
                self.issue_command(&Command::get("nup"), &options)?
            }
        };

        let chain: Vec<ModuleInfo> = replies
            .iter()
            .filter_map(|reply| {
                let module = parse_chain_entry(&reply.raw);
                if module.is_none() {
                    warn!(line = %reply.raw, "unable to parse daisy chain entry");
                }
                module
            })
            .collect();

        for module in &chain {
            if module.index.is_none() {
                warn!(device = %module.device_id, "unable to determine daisy chain index");
            }
            if module.n_chs == 0 {
                warn!(device = %module.device_id, "unable to determine number of channels");
            }
        }
        Ok(chain)
    }

    /// Close the connection. Further operations fail with `PortClosed`.
    pub fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            port.close();
            info!(port = self.serial_port_name.as_deref().unwrap_or("<virtual>"), "closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Write raw text or bytes to the device.
    pub fn transmit(&mut self, payload: impl AsRef<[u8]>) -> Result<()> {
        let payload = payload.as_ref();
        let port = self.port.as_mut().ok_or(QontrolError::PortClosed)?;
        debug!(tx = %String::from_utf8_lossy(payload).trim_end(), "transmit");
        port.write_bytes(payload)?;
        Ok(())
    }

    /// Wait up to the response timeout for one line, classify and log it.
    pub fn receive(&mut self) -> Result<Line> {
        self.receive_within(self.response_timeout)?
            .ok_or_else(|| QontrolError::Timeout("receive".to_string()))
    }

    fn receive_within(&mut self, timeout: Duration) -> Result<Option<Line>> {
        let port = self.port.as_mut().ok_or(QontrolError::PortClosed)?;
        let raw = match port.read_line(timeout)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        debug!(rx = %raw, "receive");

        let line = match classify_line(&raw, self.log.elapsed()) {
            Ok(line) => line,
            Err(e) => {
                self.log.append(LogEntry::other(&raw))?;
                return Err(e);
            }
        };

        match &line {
            Line::Data(text) => self.log.append(LogEntry::data(text))?,
            Line::Ack => self.log.append(LogEntry::data(RESPONSE_OK))?,
            Line::Error(event) => {
                warn!(code = event.code, channel = ?event.channel, "device error: {}", event.description);
                self.log.append(LogEntry::error(event.clone()))?;
            }
            Line::Other(text) => self.log.append(LogEntry::other(text))?,
        }
        Ok(Some(line))
    }

    /// Send a text command and collect its response.
    pub fn issue_command(&mut self, command: &Command, options: &IssueOptions) -> Result<Vec<Payload>> {
        let wire = command.to_wire()?;
        self.transmit(&wire)?;
        self.log.append(LogEntry::command(
            &command.id,
            command.channel,
            command.value.clone(),
            &wire,
        ))?;

        if !command.is_get() && !self.wait_for_responses {
            return Ok(Vec::new());
        }
        self.collect_response(wire.trim_end(), !command.is_get(), options)
    }

    /// Send a binary command and collect its response.
    pub fn issue_binary_command(
        &mut self,
        command: &BinaryCommand,
        options: &IssueOptions,
    ) -> Result<Vec<Payload>> {
        let frame = command.encode()?;
        self.transmit(&frame)?;

        let hex: String = frame.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ");
        let value = match (&command.payload, command.is_read()) {
            (_, true) => None,
            (BinaryPayload::Word(v), false) => Some(Value::Int(*v)),
            (BinaryPayload::Words(vs), false) => {
                Some(Value::Vector(vs.iter().map(|v| *v as f64).collect()))
            }
        };
        self.log.append(LogEntry::command(
            &format!("{:#04x}", command.index),
            Some(command.channel),
            value,
            &hex,
        ))?;

        if !command.is_read() && !self.wait_for_responses {
            return Ok(Vec::new());
        }
        self.collect_response(&hex, !command.is_read(), options)
    }

    /// Read lines until the request is satisfied.
    ///
    /// An `OK` ends collection only for a write without a line count; any
    /// other `OK` is a late acknowledgement of an earlier write and is
    /// logged but otherwise ignored.
    fn collect_response(
        &mut self,
        sent: &str,
        is_write: bool,
        options: &IssueOptions,
    ) -> Result<Vec<Payload>> {
        let output = options.output_regex.as_ref().unwrap_or(&*DEFAULT_OUTPUT);
        let targets = options
            .target_errors
            .clone()
            .unwrap_or_else(|| self.default_target_errors.clone());
        let timeout = options.special_timeout.unwrap_or(self.response_timeout);
        let ends_on_ack = is_write && options.n_lines_requested.is_none();

        let mut deadline = Instant::now() + timeout;
        let mut payloads = Vec::new();
        let mut received_any = false;

        loop {
            if let Some(n) = options.n_lines_requested {
                if payloads.len() >= n {
                    return Ok(payloads);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let line = match self.receive_within(remaining)? {
                Some(line) => line,
                None => continue,
            };
            if matches!(line, Line::Ack) && !ends_on_ack {
                debug!(sent, "ignoring unexpected acknowledgement");
                continue;
            }
            received_any = true;
            deadline = deadline.max(Instant::now() + self.inter_response_timeout);

            match line {
                Line::Data(text) => match output.captures(&text) {
                    Some(caps) if caps.get(0).map_or(false, |m| m.start() == 0) => {
                        payloads.push(Payload {
                            groups: caps
                                .iter()
                                .skip(1)
                                .map(|m| m.map(|m| m.as_str().to_string()))
                                .collect(),
                            raw: text,
                        });
                    }
                    _ => warn!(line = %text, pattern = %output, "response does not match output pattern"),
                },
                Line::Ack => return Ok(payloads),
                Line::Error(event) if targets.contains(event.code) => {
                    return Err(QontrolError::Device { event, reason: None });
                }
                Line::Error(_) | Line::Other(_) => {}
            }
        }

        match options.n_lines_requested {
            Some(n) if payloads.len() < n => Err(QontrolError::Timeout(sent.to_string())),
            _ if !received_any => Err(QontrolError::Timeout(sent.to_string())),
            _ => Ok(payloads),
        }
    }

    /// Do nothing for `duration` while logging whatever the device sends.
    ///
    /// Returns the device errors observed during the wait.
    pub fn wait(&mut self, duration: Duration) -> Result<Vec<ErrorEvent>> {
        let deadline = Instant::now() + duration;
        let mut errors = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(errors);
            }
            if let Some(Line::Error(event)) = self.receive_within(remaining)? {
                errors.push(event);
            }
        }
    }

    /// Query a single value and return the raw reply line.
    pub fn query(&mut self, command_id: &str) -> Result<String> {
        let replies =
            self.issue_command(&Command::get(command_id), &IssueOptions::new().lines(1))?;
        first_reply(replies, command_id).map(|reply| reply.raw)
    }

    fn query_number(&mut self, command_id: &str) -> Result<f64> {
        let options = IssueOptions::new().lines(1).output_regex(NUMBER_REGEX)?;
        let replies = self.issue_command(&Command::get(command_id), &options)?;
        first_reply(replies, command_id)?.as_f64()
    }

    pub fn firmware(&mut self) -> Result<String> {
        self.query("firmware")
    }

    /// Full-scale voltage (V)
    pub fn vfull(&mut self) -> Result<f64> {
        self.query_number("vfull")
    }

    /// Full-scale current (mA)
    pub fn ifull(&mut self) -> Result<f64> {
        self.query_number("ifull")
    }

    pub fn lifetime(&mut self) -> Result<String> {
        self.query("lifetime")
    }

    /// Add an entry to the session log, e.g. an annotation from the caller.
    pub fn log_append(&mut self, entry: LogEntry) -> Result<()> {
        self.log.append(entry)
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Formatted log lines; the most recent `n`, or all for `None`
    pub fn log_lines(&self, n: Option<usize>) -> Vec<String> {
        self.log.lines(n)
    }

    pub fn print_log(&self, n: Option<usize>) {
        for line in self.log.lines(n) {
            println!("{line}");
        }
    }

    pub fn set_log_handler(&mut self, handler: Option<LogHandler>) {
        self.log.set_handler(handler);
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn serial_port_name(&self) -> Option<&str> {
        self.serial_port_name.as_deref()
    }

    pub fn chain(&self) -> &[ModuleInfo] {
        &self.chain
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    /// Override the module layout, e.g. when chain discovery is unavailable
    pub fn set_channel_map(&mut self, map: ChannelMap) {
        self.channel_map = map;
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    pub fn inter_response_timeout(&self) -> Duration {
        self.inter_response_timeout
    }

    pub fn set_inter_response_timeout(&mut self, timeout: Duration) {
        self.inter_response_timeout = timeout;
    }

    pub fn set_wait_for_responses(&mut self, wait: bool) {
        self.wait_for_responses = wait;
    }

    pub fn set_default_target_errors(&mut self, targets: TargetErrors) {
        self.default_target_errors = targets;
    }
}

/// First payload of a reply, or a parse error when there is none
fn first_reply(replies: Vec<Payload>, command_id: &str) -> Result<Payload> {
    replies
        .into_iter()
        .next()
        .ok_or_else(|| QontrolError::Parse(format!("no reply to {command_id}?")))
}

impl Drop for Qontroller {
    fn drop(&mut self) {
        self.close();
    }
}
