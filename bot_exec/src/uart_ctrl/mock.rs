//! # Mock transport
//!
//! In-memory stand-in for the microcontroller. Clones share the same buffers, so a test can keep
//! one handle while the controller owns another.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::debug;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::transport::Transport;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Mock transport which records every written line and can answer heartbeats.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

struct MockTransportInner {
    read_buffer: VecDeque<u8>,
    write_buffer: Vec<u8>,

    /// Complete lines written so far, without terminators
    written_lines: Vec<String>,

    /// Bytes of the line currently being written
    partial_line: String,

    /// Answer every `?` with `heartbeat_reply`
    responsive: bool,
    heartbeat_reply: String,

    /// Fail every write with a broken pipe
    fail_writes: bool,

    /// Lines whose write was failed
    rejected_lines: Vec<String>,

    /// Time a read blocks for when nothing is waiting
    read_timeout: Duration,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl MockTransport {
    /// Create a responsive mock transport.
    pub fn new() -> Self {
        MockTransport {
            inner: Arc::new(Mutex::new(MockTransportInner {
                read_buffer: VecDeque::new(),
                write_buffer: Vec::new(),
                written_lines: Vec::new(),
                partial_line: String::new(),
                responsive: true,
                heartbeat_reply: String::from("!"),
                fail_writes: false,
                rejected_lines: Vec::new(),
                read_timeout: Duration::from_millis(1),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inject raw data to be read by the controller
    pub fn inject_read(&self, data: &[u8]) {
        self.lock().read_buffer.extend(data);
    }

    /// Inject a single line, the terminator is added
    pub fn inject_line(&self, line: &str) {
        let mut inner = self.lock();
        inner.read_buffer.extend(line.as_bytes());
        inner.read_buffer.push_back(b'\n');
    }

    /// Get all written data
    pub fn get_written(&self) -> Vec<u8> {
        self.lock().write_buffer.clone()
    }

    /// Get all complete lines written so far
    pub fn written_lines(&self) -> Vec<String> {
        self.lock().written_lines.clone()
    }

    /// Clear written data
    pub fn clear_written(&self) {
        let mut inner = self.lock();
        inner.write_buffer.clear();
        inner.written_lines.clear();
        inner.partial_line.clear();
    }

    /// Set whether heartbeats are acknowledged.
    pub fn set_responsive(&self, responsive: bool) {
        self.lock().responsive = responsive;
    }

    /// Stop acknowledging heartbeats, as if the microcontroller had gone away.
    pub fn simulate_disconnect(&self) {
        debug!("MockTransport: simulating disconnect");
        let mut inner = self.lock();
        inner.responsive = false;
        inner.read_buffer.clear();
    }

    /// Set the line sent back for each heartbeat, `!` by default.
    pub fn set_heartbeat_reply(&self, reply: &str) {
        self.lock().heartbeat_reply = reply.to_string();
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Lines the controller tried to write while writes were failing
    pub fn rejected_lines(&self) -> Vec<String> {
        self.lock().rejected_lines.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let timeout = {
            let mut inner = self.lock();
            let available = inner.read_buffer.len().min(buffer.len());

            if available > 0 {
                for (item, byte) in buffer.iter_mut().zip(inner.read_buffer.drain(..available)) {
                    *item = byte;
                }
                return Ok(available);
            }

            inner.read_timeout
        };

        // Behave like a port with a read timeout
        thread::sleep(timeout);
        Ok(0)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut inner = self.lock();

        if inner.fail_writes {
            let rejected = String::from_utf8_lossy(data);
            inner
                .rejected_lines
                .extend(rejected.lines().filter(|l| !l.is_empty()).map(String::from));
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }

        inner.write_buffer.extend_from_slice(data);

        for c in String::from_utf8_lossy(data).chars() {
            if c == '\n' {
                let line = std::mem::take(&mut inner.partial_line);
                if line == "?" && inner.responsive {
                    let reply = format!("{}\n", inner.heartbeat_reply);
                    inner.read_buffer.extend(reply.as_bytes());
                }
                inner.written_lines.push(line);
            } else {
                inner.partial_line.push(c);
            }
        }

        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn available(&mut self) -> io::Result<usize> {
        Ok(self.lock().read_buffer.len())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.lock().read_buffer.clear();
        Ok(())
    }
}
