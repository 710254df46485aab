//! Byte stream abstraction
//!
//! The session talks to a [`CommunicationChannel`] so real ports and the
//! simulated supply are interchangeable.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

/// Abstraction over the byte stream to one instrument
///
/// Implemented by [`SerialChannel`] for real hardware and by the simulated
/// instrument in [`crate::sim`].
pub trait CommunicationChannel: Read + Write + Send {
    /// Set the read timeout used by subsequent `read` calls
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Current read timeout
    fn timeout(&self) -> Duration;

    /// Discard any bytes received but not yet read
    fn clear_input_buffer(&mut self) -> io::Result<()>;
}

/// Serial port wrapper implementing CommunicationChannel
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Wrap an open serial port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl CommunicationChannel for SerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::other)
    }

    fn timeout(&self) -> Duration {
        self.port.timeout()
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }
}
