//! Transport session
//!
//! Owns at most one open channel to the instrument. Opening replaces any
//! channel already held; closing is always safe.

use chrono::{DateTime, Utc};
use std::io::{ErrorKind, Read, Write};
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::serial::PortProvider;
use super::status::StatusSnapshot;
use super::stream::CommunicationChannel;
use super::{ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_LINE_TERMINATOR, DEFAULT_TIMEOUT_MS};

/// A status snapshot together with when it was read
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedStatus {
    /// Parsed frame
    pub snapshot: StatusSnapshot,
    /// When the query finished
    pub observed_at: DateTime<Utc>,
}

/// One serial session with one instrument
pub struct Session {
    channel: Option<Box<dyn CommunicationChannel>>,
    port_name: Option<String>,
    baud_rate: u32,
    timeout: Duration,
    line_terminator: String,
    /// Bytes received but not yet returned as a line
    rx_buffer: Vec<u8>,
    last_status: Option<ObservedStatus>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE, Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }
}

impl Session {
    /// Create a closed session
    pub fn new(baud_rate: u32, timeout: Duration) -> Self {
        Self {
            channel: None,
            port_name: None,
            baud_rate,
            timeout,
            line_terminator: DEFAULT_LINE_TERMINATOR.to_string(),
            rx_buffer: Vec::new(),
            last_status: None,
        }
    }

    /// Set the terminator appended to outgoing commands
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Open `port_name`, closing whatever was open before
    pub fn open(
        &mut self,
        provider: &dyn PortProvider,
        port_name: &str,
    ) -> Result<(), ProtocolError> {
        self.close();
        let channel = provider.open(port_name, self.baud_rate, self.timeout)?;
        self.attach(port_name, channel);
        Ok(())
    }

    /// Adopt an already-open channel, closing whatever was open before
    pub fn attach(&mut self, port_name: &str, channel: Box<dyn CommunicationChannel>) {
        self.close();
        info!(
            "Opened {} at {} baud (timeout {}ms)",
            port_name,
            self.baud_rate,
            self.timeout.as_millis()
        );
        self.channel = Some(channel);
        self.port_name = Some(port_name.to_string());
    }

    /// Release the channel. No-op when already closed.
    pub fn close(&mut self) {
        if self.channel.take().is_some() {
            info!("Closed {}", self.port_name.as_deref().unwrap_or("<unnamed>"));
        }
        self.port_name = None;
        self.rx_buffer.clear();
    }

    /// Whether a channel is held
    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Name of the open port
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    /// Configured baud rate
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Configured read timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read timeout currently set on the open channel
    pub fn channel_timeout(&self) -> Option<Duration> {
        self.channel.as_ref().map(|c| c.timeout())
    }

    /// Terminator appended to commands
    pub fn line_terminator(&self) -> &str {
        &self.line_terminator
    }

    /// Most recent status read through this session
    pub fn last_status(&self) -> Option<&ObservedStatus> {
        self.last_status.as_ref()
    }

    pub(crate) fn record_status(&mut self, snapshot: StatusSnapshot) {
        self.last_status = Some(ObservedStatus {
            snapshot,
            observed_at: Utc::now(),
        });
    }

    fn channel_mut(&mut self) -> Result<&mut Box<dyn CommunicationChannel>, ProtocolError> {
        self.channel.as_mut().ok_or(ProtocolError::NotConnected)
    }

    /// Write bytes and flush
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let channel = self.channel_mut()?;
        channel
            .write_all(bytes)
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        channel
            .flush()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        debug!("tx {} bytes: {:?}", bytes.len(), String::from_utf8_lossy(bytes));
        Ok(())
    }

    /// Read up to `max_bytes`, waiting at most the current read timeout.
    /// A timeout yields an empty vector.
    pub fn read_raw(&mut self, max_bytes: usize) -> Result<Vec<u8>, ProtocolError> {
        let channel = self.channel_mut()?;
        let mut buf = vec![0u8; max_bytes];
        match channel.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(ref e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(Vec::new())
            }
            Err(e) => Err(ProtocolError::SerialError(e.to_string())),
        }
    }

    /// Discard stale input, both in the OS buffer and in the line buffer
    pub fn clear_input(&mut self) -> Result<(), ProtocolError> {
        let channel = self.channel_mut()?;
        channel
            .clear_input_buffer()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        self.rx_buffer.clear();
        Ok(())
    }

    /// Read one line within `timeout`.
    ///
    /// Returns the line without its terminator, or `None` if no complete line
    /// arrived in time. Bytes of an incomplete line stay buffered for the next
    /// call.
    pub fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, ProtocolError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.with_timeout(timeout)?;
        loop {
            if let Some(line) = guard.take_buffered_line() {
                return Ok(Some(line));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            guard.set_channel_timeout(remaining)?;
            let chunk = guard.read_raw(256)?;
            if chunk.is_empty() {
                return Ok(None);
            }
            guard.rx_buffer.extend_from_slice(&chunk);
        }
    }

    /// Hand back whatever partial line is buffered, emptying the buffer
    pub fn take_partial_line(&mut self) -> Option<String> {
        if self.rx_buffer.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.rx_buffer);
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn take_buffered_line(&mut self) -> Option<String> {
        let pos = self.rx_buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.rx_buffer.drain(..=pos).collect();
        Some(
            String::from_utf8_lossy(&line)
                .trim_end_matches(['\r', '\n'])
                .to_string(),
        )
    }

    fn set_channel_timeout(&mut self, timeout: Duration) -> Result<(), ProtocolError> {
        self.channel_mut()?
            .set_timeout(timeout)
            .map_err(|e| ProtocolError::SerialError(e.to_string()))
    }

    /// Swap in a temporary read timeout
    ///
    /// The previous timeout is put back when the guard drops, on every exit
    /// path.
    pub fn with_timeout(&mut self, timeout: Duration) -> Result<TimeoutGuard<'_>, ProtocolError> {
        let channel = self.channel_mut()?;
        let restore = channel.timeout();
        channel
            .set_timeout(timeout)
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        Ok(TimeoutGuard {
            session: self,
            restore,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Scoped read-timeout override; see [`Session::with_timeout`]
pub struct TimeoutGuard<'a> {
    session: &'a mut Session,
    restore: Duration,
}

impl Deref for TimeoutGuard<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for TimeoutGuard<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for TimeoutGuard<'_> {
    fn drop(&mut self) {
        if let Some(channel) = self.session.channel.as_mut() {
            if let Err(e) = channel.set_timeout(self.restore) {
                warn!("Failed to restore read timeout: {}", e);
            }
        }
    }
}
