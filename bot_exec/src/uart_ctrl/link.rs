//! # Line framing over a transport

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::mcu::{Command, LINE_TERMINATOR};
use log::trace;
use std::io;
use std::time::{Duration, Instant};

use super::transport::Transport;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Size of a single read from the transport.
const READ_CHUNK_SIZE: usize = 64;

/// Longest line kept before the buffer is discarded as garbage.
const MAX_LINE_LEN: usize = 256;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// An open link to the microcontroller, splitting the inbound byte stream into lines.
pub struct Link {
    transport: Box<dyn Transport>,

    /// Bytes received but not yet terminated by a newline
    rx_buffer: Vec<u8>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Link {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            rx_buffer: Vec::with_capacity(MAX_LINE_LEN),
        }
    }

    /// Encode and transmit a single command.
    pub fn send(&mut self, cmd: &Command) -> io::Result<()> {
        trace!("UART tx: {}", cmd);
        self.write_line(&cmd.to_string())
    }

    /// Write a line, appending the terminator.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut frame = String::with_capacity(line.len() + 1);
        frame.push_str(line);
        frame.push(LINE_TERMINATOR);

        self.write_all(frame.as_bytes())?;
        self.transport.flush()
    }

    /// True if there are bytes waiting or a complete line already buffered.
    pub fn has_input(&mut self) -> io::Result<bool> {
        if self.rx_buffer.contains(&b'\n') {
            return Ok(true);
        }
        Ok(self.transport.available()? > 0)
    }

    /// Read one line, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` if no complete line arrived in time. Partial lines are kept for the
    /// next call. The returned line has its terminator and surrounding whitespace removed.
    pub fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            if let Some(line) = self.take_line() {
                trace!("UART rx: {}", line);
                return Ok(Some(line));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let n = self.transport.read(&mut chunk)?;
            self.rx_buffer.extend_from_slice(&chunk[..n]);

            if self.rx_buffer.len() > MAX_LINE_LEN && !self.rx_buffer.contains(&b'\n') {
                self.rx_buffer.clear();
            }
        }
    }

    /// Discard any buffered or pending input.
    pub fn clear_input(&mut self) -> io::Result<()> {
        self.rx_buffer.clear();
        self.transport.clear_input()
    }

    /// Push a whole buffer through the transport, whose writes may be partial.
    fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match self.transport.write(data)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport accepted no bytes",
                    ))
                }
                n => data = &data[n..],
            }
        }
        Ok(())
    }

    /// Pop the first complete line from the buffer.
    fn take_line(&mut self) -> Option<String> {
        let pos = self.rx_buffer.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.rx_buffer.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::uart_ctrl::mock::MockTransport;

    #[test]
    fn test_read_partial_lines() {
        let mock = MockTransport::new();
        let mut link = Link::new(Box::new(mock.clone()));

        mock.inject_read(b"F0.5,1,");
        assert_eq!(link.read_line(Duration::from_millis(5)).unwrap(), None);

        mock.inject_read(b"2,3\r\nOK\n");
        assert_eq!(
            link.read_line(Duration::from_millis(5)).unwrap(),
            Some("F0.5,1,2,3".to_string())
        );
        assert!(link.has_input().unwrap());
        assert_eq!(
            link.read_line(Duration::from_millis(5)).unwrap(),
            Some("OK".to_string())
        );
        assert!(!link.has_input().unwrap());
    }

    #[test]
    fn test_send() {
        let mock = MockTransport::new();
        let mut link = Link::new(Box::new(mock.clone()));

        link.send(&Command::Velocity(0.8)).unwrap();
        link.send(&Command::Enable).unwrap();

        assert_eq!(mock.get_written(), b"V800\nE1\n".to_vec());
    }
}
