//! Protocol errors

use thiserror::Error;

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Reading or writing the port failed
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// No port is open
    #[error("Not connected to device")]
    NotConnected,

    /// The port could not be opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Control name not in the fixed set
    #[error("Unknown control '{0}'")]
    UnknownControl(String),

    /// Power setpoint above 9999
    #[error("Power value {0} out of range (0-9999)")]
    InvalidPower(u32),

    /// Command token contains a line terminator
    #[error("Invalid command token: {0:?}")]
    InvalidCommand(String),

    /// Listing serial ports failed
    #[error("Could not enumerate serial ports: {0}")]
    PortEnumeration(String),

    /// Other I/O failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
