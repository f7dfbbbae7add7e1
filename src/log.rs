//! Bounded event log of commands sent and lines received.
//!
//! The log is a fixed-capacity ring buffer: once full, every append
//! overwrites the oldest entry. Error entries are handed to an optional
//! handler, which can ask for the running operation to be aborted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::constants::LOG_CAPACITY;
use crate::error::{QontrolError, Result};
use crate::types::{ErrorEvent, HandlerDecision, TargetErrors, Value};

/// Kind of log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    #[serde(rename = "cmd")]
    Command,
    #[serde(rename = "data")]
    Data,
    #[serde(rename = "err")]
    Error,
    #[serde(rename = "other")]
    Other,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogKind::Command => "cmd",
            LogKind::Data => "data",
            LogKind::Error => "err",
            LogKind::Other => "other",
        })
    }
}

/// One log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub kind: LogKind,
    /// Command mnemonic, or error code for error entries
    pub id: String,
    pub channel: Option<u32>,
    pub value: Option<Value>,
    pub description: String,
    pub raw: String,
    /// Decoded error, for error entries
    pub error: Option<ErrorEvent>,
    pub timestamp: DateTime<Utc>,
    /// Time since the log was created
    pub proctime: Duration,
}

impl LogEntry {
    fn new(kind: LogKind, description: String, raw: String) -> Self {
        LogEntry {
            kind,
            id: String::new(),
            channel: None,
            value: None,
            description,
            raw,
            error: None,
            timestamp: Utc::now(),
            proctime: Duration::ZERO,
        }
    }

    /// Transmitted command
    pub fn command(id: &str, channel: Option<u32>, value: Option<Value>, raw: &str) -> Self {
        let wire = raw.trim_end();
        LogEntry {
            id: id.to_string(),
            channel,
            value,
            ..LogEntry::new(LogKind::Command, format!("Command: \"{wire}\"."), wire.to_string())
        }
    }

    pub fn data(line: &str) -> Self {
        LogEntry::new(LogKind::Data, line.to_string(), line.to_string())
    }

    pub fn error(event: ErrorEvent) -> Self {
        LogEntry {
            id: event.code.to_string(),
            channel: event.channel,
            ..LogEntry::new(LogKind::Error, event.description.clone(), event.raw.clone())
        }
        .with_error(event)
    }

    pub fn other(line: &str) -> Self {
        LogEntry::new(LogKind::Other, format!("{line:?}"), line.to_string())
    }

    fn with_error(mut self, event: ErrorEvent) -> Self {
        self.error = Some(event);
        self
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.proctime.as_secs_f64() * 1000.0;
        write!(f, "@ {ms:.2} ms, {} : {}", self.kind, self.description)
    }
}

/// Callback receiving every error entry as it is logged
pub type LogHandler = Box<dyn FnMut(&LogEntry) -> HandlerDecision + Send>;

/// Handler that aborts on the given device errors.
///
/// `TargetErrors::All` aborts on every error entry.
pub fn fatal_error_handler(fatal: TargetErrors) -> LogHandler {
    Box::new(move |entry: &LogEntry| match &entry.error {
        Some(event) if fatal.contains(event.code) => HandlerDecision::Abort(format!(
            "Caught Qontrol error {} \"{}\" at {:.1} ms",
            event.raw,
            event.description,
            entry.proctime.as_secs_f64() * 1000.0
        )),
        _ => HandlerDecision::Continue,
    })
}

/// Fixed-capacity ring buffer of [`LogEntry`] values
pub struct EventLog {
    slots: Vec<Option<LogEntry>>,
    /// Slot holding the oldest entry
    head: usize,
    len: usize,
    started: Instant,
    handler: Option<LogHandler>,
    to_stdout: bool,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        EventLog {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
            started: Instant::now(),
            handler: None,
            to_stdout: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Time elapsed since the log was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn set_handler(&mut self, handler: Option<LogHandler>) {
        self.handler = handler;
    }

    /// Echo every new entry to stdout
    pub fn set_log_to_stdout(&mut self, enabled: bool) {
        self.to_stdout = enabled;
    }

    /// Stamp and store an entry, evicting the oldest one when full.
    ///
    /// Error entries are passed to the handler; an abort decision is
    /// returned as a `Device` error after the entry has been stored.
    pub fn append(&mut self, mut entry: LogEntry) -> Result<()> {
        entry.timestamp = Utc::now();
        entry.proctime = self.elapsed();

        if self.to_stdout {
            println!("{entry}");
        }

        let decision = match (&mut self.handler, entry.kind) {
            (Some(handler), LogKind::Error) => handler(&entry),
            _ => HandlerDecision::Continue,
        };
        let event = entry.error.clone();

        self.push(entry);

        match (decision, event) {
            (HandlerDecision::Abort(reason), Some(event)) => Err(QontrolError::Device {
                event,
                reason: Some(reason),
            }),
            _ => Ok(()),
        }
    }

    fn push(&mut self, entry: LogEntry) {
        let capacity = self.capacity();
        if self.len < capacity {
            self.slots[(self.head + self.len) % capacity] = Some(entry);
            self.len += 1;
        } else {
            self.slots[self.head] = Some(entry);
            self.head = (self.head + 1) % capacity;
        }
    }

    /// Entries from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> + '_ {
        let capacity = self.capacity();
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % capacity].as_ref())
    }

    /// The most recent `n` entries (all of them for `None`), oldest first
    pub fn recent(&self, n: Option<usize>) -> impl Iterator<Item = &LogEntry> + '_ {
        let n = n.unwrap_or(self.len).min(self.len);
        self.iter().skip(self.len - n)
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.recent(Some(1)).next()
    }

    /// Formatted `@ <ms> ms, <kind> : <description>` lines
    pub fn lines(&self, n: Option<usize>) -> Vec<String> {
        self.recent(n).map(|e| e.to_string()).collect()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.len = 0;
    }
}

impl Default for EventLog {
    fn default() -> Self {
        EventLog::new(LOG_CAPACITY)
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_error_token;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    fn data_ids(log: &EventLog) -> Vec<String> {
        log.iter().map(|e| e.raw.clone()).collect()
    }

    #[test]
    fn test_eviction_keeps_most_recent() {
        let capacity = 4;
        for extra in 0..10 {
            let mut log = EventLog::new(capacity);
            for i in 0..capacity + extra {
                log.append(LogEntry::data(&i.to_string())).unwrap();
            }
            assert_eq!(log.len(), capacity);
            let expected: Vec<String> = (extra..capacity + extra).map(|i| i.to_string()).collect();
            assert_eq!(data_ids(&log), expected);
        }
    }

    #[test]
    fn test_default_capacity() {
        let mut log = EventLog::default();
        for i in 0..300 {
            log.append(LogEntry::data(&i.to_string())).unwrap();
        }
        assert_eq!(log.capacity(), 256);
        assert_eq!(log.len(), 256);
        assert_eq!(log.iter().next().unwrap().raw, "44");
        assert_eq!(log.last().unwrap().raw, "299");
    }

    #[test]
    fn test_recent_entries() {
        let mut log = EventLog::new(8);
        for i in 0..5 {
            log.append(LogEntry::data(&i.to_string())).unwrap();
        }
        let last_two: Vec<&str> = log.recent(Some(2)).map(|e| e.raw.as_str()).collect();
        assert_eq!(last_two, vec!["3", "4"]);
        assert_eq!(log.recent(None).count(), 5);
        assert_eq!(log.recent(Some(50)).count(), 5);
        assert!(log.lines(Some(1))[0].ends_with("data : 4"));
    }

    #[test]
    fn test_handler_sees_errors_only() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut log = EventLog::new(16);
        log.set_handler(Some(Box::new(move |entry: &LogEntry| {
            sink.lock().unwrap().push(entry.kind);
            HandlerDecision::Continue
        })));

        log.append(LogEntry::command("v", Some(1), Some(Value::Float(1.0)), "v1=1.0\n")).unwrap();
        log.append(LogEntry::data("1.0")).unwrap();
        log.append(LogEntry::error(parse_error_token("E01:1", Duration::ZERO).unwrap())).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![LogKind::Error]);
    }

    #[test]
    fn test_fatal_handler_aborts_after_logging() {
        let mut log = EventLog::new(16);
        log.set_handler(Some(fatal_error_handler(TargetErrors::codes([2]))));

        log.append(LogEntry::error(parse_error_token("E01:0", Duration::ZERO).unwrap())).unwrap();
        let err = log
            .append(LogEntry::error(parse_error_token("E02:5", Duration::ZERO).unwrap()))
            .unwrap_err();

        match err {
            QontrolError::Device { event, reason } => {
                assert_eq!(event.code, 2);
                assert_eq!(event.channel, Some(5));
                assert!(reason.unwrap().contains("Overcurrent"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_entry_serialization() {
        let entry = LogEntry::command("v", Some(7), Some(Value::Float(1.0)), "v7=1.0\n");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "cmd");
        assert_eq!(json["id"], "v");
        assert_eq!(json["channel"], 7);
        assert_eq!(json["raw"], "v7=1.0");
    }
}
