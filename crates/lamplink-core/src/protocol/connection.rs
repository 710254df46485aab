//! Connection management
//!
//! [`Connection`] is the handle the UI layer holds: it owns the session, the
//! port provider and timing configuration, and the cooperative pause state of
//! background status polling.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::commands::{send_command, Command};
use super::discovery::{find_port_by_serial, find_port_by_serial_async, ProbeOptions};
use super::query::{query_status, QueryTiming};
use super::serial::{PortProvider, SystemPorts};
use super::session::ObservedStatus;
use super::status::StatusSnapshot;
use super::{ProtocolError, Session, DEFAULT_BAUD_RATE, DEFAULT_LINE_TERMINATOR, DEFAULT_TIMEOUT_MS};
use crate::switch::SwitchTiming;

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Port read timeout in milliseconds
    pub timeout_ms: u64,
    /// Terminator appended to every command
    pub line_terminator: String,
    /// Settle delay after plain commands, in milliseconds
    pub command_settle_ms: u64,
    /// Status query timing
    pub query: QueryTiming,
    /// Switch confirmation timing
    pub switch: SwitchTiming,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            line_terminator: DEFAULT_LINE_TERMINATOR.to_string(),
            command_settle_ms: 0,
            query: QueryTiming::default(),
            switch: SwitchTiming::default(),
        }
    }
}

impl ConnectionConfig {
    /// Load from a JSON document handed over by the UI layer
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Port read timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Probe settings derived from this configuration
    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            baud_rate: self.baud_rate,
            timeout: self.timeout(),
            query: self.query,
            line_terminator: self.line_terminator.clone(),
        }
    }
}

/// Background status polling state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollingState {
    /// The UI wants periodic status refresh
    pub enabled: bool,
    /// Temporarily held off while another exchange owns the line
    pub paused: bool,
}

impl PollingState {
    /// Whether a poll tick should touch the device
    pub fn is_running(&self) -> bool {
        self.enabled && !self.paused
    }
}

/// Handle to one instrument
pub struct Connection {
    session: Session,
    provider: Arc<dyn PortProvider>,
    config: ConnectionConfig,
    polling: PollingState,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

impl Connection {
    /// Connection using the host's serial ports
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_provider(config, Arc::new(SystemPorts))
    }

    /// Connection using a custom port provider
    pub fn with_provider(config: ConnectionConfig, provider: Arc<dyn PortProvider>) -> Self {
        let session = Session::new(config.baud_rate, config.timeout())
            .with_line_terminator(config.line_terminator.clone());
        Self {
            session,
            provider,
            config,
            polling: PollingState::default(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The underlying session
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Port names the provider can see, in probe order
    pub fn list_available_ports(&self) -> Result<Vec<String>, ProtocolError> {
        self.provider.available_ports()
    }

    /// Connect to `port_name`, dropping any current connection first
    pub fn connect(&mut self, port_name: &str) -> Result<(), ProtocolError> {
        let port_name = port_name.trim();
        self.session.open(self.provider.as_ref(), port_name)?;
        info!("Connected to {}", port_name);
        Ok(())
    }

    /// Disconnect. Safe to call when not connected.
    pub fn disconnect(&mut self) {
        self.session.close();
    }

    /// Whether a port is open
    pub fn is_connected(&self) -> bool {
        self.session.is_open()
    }

    /// Name of the connected port
    pub fn port_name(&self) -> Option<&str> {
        self.session.port_name()
    }

    /// Send a raw token with the configured settle delay
    pub fn send_command(&mut self, token: &str) -> Result<(), ProtocolError> {
        let settle = Duration::from_millis(self.config.command_settle_ms);
        send_command(&mut self.session, token, settle)
    }

    /// Send a command with an explicit settle delay
    pub fn send_with_settle(&mut self, command: &Command, settle: Duration) -> Result<(), ProtocolError> {
        send_command(&mut self.session, &command.token(), settle)
    }

    /// Send a typed command with the configured settle delay
    pub fn send(&mut self, command: &Command) -> Result<(), ProtocolError> {
        self.send_command(&command.token())
    }

    /// Set lamp power. Fire-and-forget: nothing is read back.
    pub fn set_power(&mut self, value: u32) -> Result<(), ProtocolError> {
        let command = Command::set_power(value)?;
        self.send(&command)
    }

    /// Query the device status
    pub fn query_status(&mut self) -> Result<StatusSnapshot, ProtocolError> {
        let timing = self.config.query;
        query_status(&mut self.session, &timing)
    }

    /// Last status read on this connection
    pub fn last_status(&self) -> Option<&ObservedStatus> {
        self.session.last_status()
    }

    /// Find the port of the instrument reporting `target_serial`
    ///
    /// The current connection is left alone; callers normally disconnect
    /// first so the scan can open the instrument's port.
    pub fn find_port_by_serial(&self, target_serial: &str) -> Result<Option<String>, ProtocolError> {
        find_port_by_serial(self.provider.as_ref(), target_serial, self.config.probe_options())
    }

    /// Discovery without blocking the async runtime
    ///
    /// The returned future does not borrow the connection.
    pub fn find_port_by_serial_async(
        &self,
        target_serial: &str,
    ) -> impl Future<Output = Result<Option<String>, ProtocolError>> + Send + 'static {
        find_port_by_serial_async(
            Arc::clone(&self.provider),
            target_serial.to_string(),
            self.config.probe_options(),
        )
    }

    /// Disconnect, scan for `target_serial`, and connect to the match
    pub fn auto_connect(&mut self, target_serial: &str) -> Result<Option<String>, ProtocolError> {
        self.disconnect();
        let Some(port) = self.find_port_by_serial(target_serial)? else {
            return Ok(None);
        };
        self.connect(&port)?;
        Ok(Some(port))
    }

    /// Current polling state
    pub fn polling(&self) -> PollingState {
        self.polling
    }

    /// Enable periodic status refresh
    pub fn start_polling(&mut self) {
        self.polling.enabled = true;
    }

    /// Disable periodic status refresh
    pub fn stop_polling(&mut self) {
        self.polling.enabled = false;
    }

    /// One periodic refresh. Does nothing while polling is disabled, paused,
    /// or the device is disconnected.
    pub fn poll_tick(&mut self) -> Result<Option<StatusSnapshot>, ProtocolError> {
        if !self.polling.is_running() || !self.is_connected() {
            return Ok(None);
        }
        self.query_status().map(Some)
    }

    /// Hold off polling until the returned guard drops
    pub fn pause_polling(&mut self) -> PollingPause<'_> {
        let was_paused = self.polling.paused;
        self.polling.paused = true;
        debug!("polling paused (enabled={})", self.polling.enabled);
        PollingPause {
            connection: self,
            was_paused,
        }
    }
}

/// Scoped polling pause; see [`Connection::pause_polling`]
pub struct PollingPause<'a> {
    connection: &'a mut Connection,
    was_paused: bool,
}

impl Deref for PollingPause<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection
    }
}

impl DerefMut for PollingPause<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection
    }
}

impl Drop for PollingPause<'_> {
    fn drop(&mut self) {
        self.connection.polling.paused = self.was_paused;
        debug!(
            "polling {} (enabled={})",
            if self.was_paused { "still paused" } else { "resumed" },
            self.connection.polling.enabled
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.line_terminator, "\n");
    }

    #[test]
    fn test_config_from_partial_json() {
        let config = ConnectionConfig::from_json(r#"{"baud_rate": 19200, "query": {"budget_ms": 500}}"#)
            .expect("valid config");
        assert_eq!(config.baud_rate, 19200);
        assert_eq!(config.query.budget_ms, 500);
        assert_eq!(config.query.attempt_timeout_ms, QueryTiming::default().attempt_timeout_ms);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn test_new_connection_is_disconnected() {
        let mut conn = Connection::default();
        assert!(!conn.is_connected());
        assert!(conn.last_status().is_none());
        assert!(matches!(conn.query_status(), Err(ProtocolError::NotConnected)));
        assert!(matches!(conn.send_command("C1"), Err(ProtocolError::NotConnected)));
        conn.disconnect();
        conn.disconnect();
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_set_power_validates_before_connection_check() {
        let mut conn = Connection::default();
        assert!(matches!(conn.set_power(12_345), Err(ProtocolError::InvalidPower(12_345))));
        assert!(matches!(conn.set_power(150), Err(ProtocolError::NotConnected)));
    }

    #[test]
    fn test_polling_pause_restores_state() {
        let mut conn = Connection::default();
        conn.start_polling();
        assert!(conn.polling().is_running());
        {
            let paused = conn.pause_polling();
            assert!(paused.polling().paused);
            assert!(!paused.polling().is_running());
        }
        assert!(conn.polling().is_running());

        conn.stop_polling();
        {
            let _outer = conn.pause_polling();
        }
        assert_eq!(conn.polling(), PollingState::default());
    }

    #[test]
    fn test_poll_tick_is_noop_when_idle() {
        let mut conn = Connection::default();
        assert!(matches!(conn.poll_tick(), Ok(None)));
        conn.start_polling();
        assert!(matches!(conn.poll_tick(), Ok(None)));
    }
}
