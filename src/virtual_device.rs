//! Scripted in-memory device for tests and offline development.
//!
//! A [`VirtualDevice`] answers each exact command it receives with a
//! programmed list of lines. Unknown commands get no reply, just like a
//! device that missed the command. The handle is cheap to clone, so a test
//! can keep one copy while the session owns the other.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::transport::Transport;

#[derive(Debug, Default)]
struct VirtualState {
    program: HashMap<Vec<u8>, Vec<String>>,
    outgoing: VecDeque<String>,
    written: Vec<Vec<u8>>,
    closed: bool,
}

/// In-memory [`Transport`] driven by a command/response program
#[derive(Debug, Clone, Default)]
pub struct VirtualDevice {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single Q8iv module that answers identification and chain discovery
    pub fn q8iv() -> Self {
        VirtualDevice::new()
            .respond("id?", &["Q8iv-0000"])
            .respond("nup=0", &["OK"])
            .respond("nupall?", &["Q8iv-0000 : 0"])
    }

    fn state(&self) -> MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer the text command `command` (without terminator) with `lines`.
    pub fn respond(self, command: &str, lines: &[&str]) -> Self {
        let mut key = command.as_bytes().to_vec();
        key.push(b'\n');
        self.respond_bytes(&key, lines)
    }

    /// Answer an exact byte sequence, e.g. a binary frame, with `lines`.
    pub fn respond_bytes(self, frame: &[u8], lines: &[&str]) -> Self {
        self.state().program.insert(
            frame.to_vec(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
        self
    }

    /// Queue a line as if the device sent it unprompted.
    pub fn push_line(&self, line: &str) {
        self.state().outgoing.push_back(line.to_string());
    }

    /// Everything written so far, decoded as text
    pub fn written(&self) -> Vec<String> {
        self.state()
            .written
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// Everything written so far, as raw frames
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl Transport for VirtualDevice {
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "virtual port closed"));
        }
        state.written.push(data.to_vec());
        if let Some(lines) = state.program.get(data).cloned() {
            state.outgoing.extend(lines);
        }
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        if let Some(line) = self.state().outgoing.pop_front() {
            return Ok(Some(line));
        }
        thread::sleep(timeout);
        Ok(self.state().outgoing.pop_front())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state().outgoing.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.state().closed = true;
    }
}
