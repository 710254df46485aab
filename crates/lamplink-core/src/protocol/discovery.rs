//! Device discovery by instrument serial number
//!
//! Every visible port is opened in turn, asked for its status, and released.
//! The first port whose status frame reports the wanted serial number wins.
//! Ports that fail to open or answer are skipped.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::query::{query_status, QueryTiming};
use super::serial::PortProvider;
use super::status::StatusSnapshot;
use super::{ProtocolError, Session, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Status keys that may carry the instrument serial number (case-insensitive)
pub const SERIAL_NUMBER_KEYS: &[&str] = &["SN", "SERIAL", "SERIAL_NO", "SERIAL_NUMBER", "SERIALNUMBER"];

/// Port settings used while probing
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Baud rate each probe opens with
    pub baud_rate: u32,
    /// Port read timeout
    pub timeout: Duration,
    /// Status query timing per probe
    pub query: QueryTiming,
    /// Terminator appended to the status request
    pub line_terminator: String,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            query: QueryTiming::default(),
            line_terminator: super::DEFAULT_LINE_TERMINATOR.to_string(),
        }
    }
}

/// What probing one port found
#[derive(Debug)]
pub enum ProbeOutcome {
    /// Reported serial equals the target
    Matched,
    /// Reported a different serial
    Mismatch {
        /// Serial the device reported
        reported: String,
    },
    /// Answered without a serial field (or not at all)
    NoSerial,
    /// Could not be opened or queried
    Failed(ProtocolError),
}

/// Result of probing one port
#[derive(Debug)]
pub struct PortProbe {
    /// Port that was probed
    pub port: String,
    /// What the probe found
    pub outcome: ProbeOutcome,
}

impl PortProbe {
    /// Whether this port reported the wanted serial
    pub fn is_match(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Matched)
    }
}

/// Serial number reported in a status snapshot, if any
pub fn reported_serial(snapshot: &StatusSnapshot) -> Option<String> {
    SERIAL_NUMBER_KEYS
        .iter()
        .find_map(|key| snapshot.raw(key))
        .map(|raw| raw.trim().to_string())
}

/// Compare the reported serial to `target` as trimmed text. Leading zeros
/// are significant: `0123` and `123` are different instruments.
fn serial_matches(snapshot: &StatusSnapshot, target: &str) -> Option<(bool, String)> {
    let reported = reported_serial(snapshot)?;
    Some((reported == target.trim(), reported))
}

/// Caller-driven scan over candidate ports
///
/// Each call to `next` probes one port. At most one port is open at a time;
/// dropping the iterator stops the scan.
pub struct DiscoveryScan<'a> {
    provider: &'a dyn PortProvider,
    target: String,
    options: ProbeOptions,
    ports: std::vec::IntoIter<String>,
}

impl<'a> DiscoveryScan<'a> {
    /// Enumerate ports and prepare to probe them in order
    pub fn new(
        provider: &'a dyn PortProvider,
        target_serial: &str,
        options: ProbeOptions,
    ) -> Result<Self, ProtocolError> {
        let ports = provider.available_ports()?;
        debug!("discovery: {} candidate port(s)", ports.len());
        Ok(Self {
            provider,
            target: target_serial.trim().to_string(),
            options,
            ports: ports.into_iter(),
        })
    }

    fn probe(&self, port: &str) -> ProbeOutcome {
        let mut session = Session::new(self.options.baud_rate, self.options.timeout)
            .with_line_terminator(self.options.line_terminator.clone());

        let result = session
            .open(self.provider, port)
            .and_then(|_| query_status(&mut session, &self.options.query));
        session.close();

        match result {
            Ok(snapshot) => match serial_matches(&snapshot, &self.target) {
                Some((true, _)) => ProbeOutcome::Matched,
                Some((false, reported)) => ProbeOutcome::Mismatch { reported },
                None => ProbeOutcome::NoSerial,
            },
            Err(e) => ProbeOutcome::Failed(e),
        }
    }
}

impl Iterator for DiscoveryScan<'_> {
    type Item = PortProbe;

    fn next(&mut self) -> Option<PortProbe> {
        let port = self.ports.next()?;
        let outcome = self.probe(&port);
        match &outcome {
            ProbeOutcome::Matched => info!("discovery: {} reports serial {}", port, self.target),
            ProbeOutcome::Mismatch { reported } => {
                debug!("discovery: {} reports serial {}, skipping", port, reported)
            }
            ProbeOutcome::NoSerial => debug!("discovery: {} gave no serial number", port),
            ProbeOutcome::Failed(e) => debug!("discovery: {} probe failed: {}", port, e),
        }
        Some(PortProbe { port, outcome })
    }
}

/// Find the port whose instrument reports `target_serial`.
///
/// Returns `Ok(None)` when no port matches. Only a failure to enumerate ports
/// is an error.
pub fn find_port_by_serial(
    provider: &dyn PortProvider,
    target_serial: &str,
    options: ProbeOptions,
) -> Result<Option<String>, ProtocolError> {
    let found = DiscoveryScan::new(provider, target_serial, options)?
        .find(PortProbe::is_match)
        .map(|probe| probe.port);
    if found.is_none() {
        info!("discovery: no port reports serial {}", target_serial.trim());
    }
    Ok(found)
}

/// [`find_port_by_serial`] on the blocking thread pool
pub async fn find_port_by_serial_async(
    provider: Arc<dyn PortProvider>,
    target_serial: String,
    options: ProbeOptions,
) -> Result<Option<String>, ProtocolError> {
    tokio::task::spawn_blocking(move || {
        find_port_by_serial(provider.as_ref(), &target_serial, options)
    })
    .await
    .map_err(|e| ProtocolError::SerialError(format!("discovery task failed: {}", e)))?
}
