//! Serial Protocol Communication
//!
//! Line-oriented ASCII protocol of the lamp supply: short command tokens out,
//! `START…END` status frames in.

pub mod commands;
mod connection;
pub mod discovery;
mod error;
pub mod query;
pub mod serial;
mod session;
pub mod status;
pub mod stream;

pub use commands::{command_for, send_command, Command, Control};
pub use connection::{Connection, ConnectionConfig, PollingPause, PollingState};
pub use discovery::{find_port_by_serial, find_port_by_serial_async, DiscoveryScan, ProbeOptions};
pub use error::ProtocolError;
pub use query::{query_status, QueryTiming};
pub use serial::{list_ports, open_port, PortInfo, PortProvider, SystemPorts};
pub use session::{ObservedStatus, Session, TimeoutGuard};
pub use status::{parse_status_block, StatusSnapshot, StatusValue};
pub use stream::CommunicationChannel;

/// Default baud rate of the supply's serial interface
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default port read timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Terminator appended to outgoing commands
pub const DEFAULT_LINE_TERMINATOR: &str = "\n";

/// Overall time a status query waits for `END`, in milliseconds
pub const STATUS_QUERY_BUDGET_MS: u64 = 300;

/// Read timeout of each line attempt inside a status query, in milliseconds
pub const STATUS_ATTEMPT_TIMEOUT_MS: u64 = 30;
