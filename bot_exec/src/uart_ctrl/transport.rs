//! # Byte transports
//!
//! The controller talks to the microcontroller through a [`Transport`], which is either a real
//! serial port or an in-memory [`MockTransport`](super::mock::MockTransport).

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::info;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// A bidirectional byte stream to the microcontroller.
pub trait Transport: Send {
    /// Read into `buffer`, blocking for at most the transport's short timeout. Returns 0 if
    /// nothing arrived.
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()>;

    /// Number of bytes waiting to be read.
    fn available(&mut self) -> io::Result<usize>;

    /// Discard anything waiting to be read.
    fn clear_input(&mut self) -> io::Result<()>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Serial port transport, 8N1 without flow control.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SerialTransport {
    /// Open a serial port
    ///
    /// # Arguments
    /// * `path` - Serial port path (e.g., "/dev/ttyACM0")
    /// * `baud_rate` - Baud rate (e.g., 115200)
    /// * `timeout` - Timeout of a single read
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, serialport::Error> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()?;

        info!("Opened serial port {} at {} baud", path, baud_rate);

        Ok(SerialTransport { port })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.port.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }

    fn available(&mut self) -> io::Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}
