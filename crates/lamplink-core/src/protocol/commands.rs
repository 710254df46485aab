//! Protocol commands
//!
//! Every command is a short ASCII token followed by the line terminator.
//! Switches take an on/off token pair, power is `P=dddd`, and `FS` requests a
//! status frame.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::{ProtocolError, Session};

/// Highest accepted lamp power setpoint
pub const MAX_POWER: u16 = 9999;

/// Status request token
pub const STATUS_REQUEST: &str = "FS";

/// A switchable output on the supply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Control {
    /// Lamp housing cooling fan
    Fan,
    /// Mechanical shutter
    Shutter,
    /// Lamp ignition
    Lamp,
}

impl Control {
    /// All controls, in UI order
    pub const ALL: [Control; 3] = [Control::Fan, Control::Shutter, Control::Lamp];

    /// Token that switches the control on
    pub fn on_token(&self) -> &'static str {
        match self {
            Control::Fan => "C1",
            Control::Shutter => "S1",
            Control::Lamp => "L1",
        }
    }

    /// Token that switches the control off
    pub fn off_token(&self) -> &'static str {
        match self {
            Control::Fan => "C0",
            Control::Shutter => "S0",
            Control::Lamp => "L0",
        }
    }

    /// Token for the requested state
    pub fn token(&self, on: bool) -> &'static str {
        if on {
            self.on_token()
        } else {
            self.off_token()
        }
    }

    /// Key the device reports this control's state under
    pub fn status_key(&self) -> &'static str {
        match self {
            Control::Fan => "COOL",
            Control::Shutter => "SHUTTER",
            Control::Lamp => "LAMP",
        }
    }

    /// Lowercase name used by the UI layer
    pub fn name(&self) -> &'static str {
        match self {
            Control::Fan => "fan",
            Control::Shutter => "shutter",
            Control::Lamp => "lamp",
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Control {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Control::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ProtocolError::UnknownControl(wanted.to_string()))
    }
}

/// Map a control name and desired state to its token
pub fn command_for(name: &str, on: bool) -> Result<&'static str, ProtocolError> {
    Ok(name.parse::<Control>()?.token(on))
}

/// A command to the supply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Switch a control on or off
    Switch {
        /// Which output
        control: Control,
        /// Requested state
        on: bool,
    },
    /// Set lamp power (0..=9999)
    SetPower(u16),
    /// Request a status frame
    QueryStatus,
    /// Any other token, sent as-is
    Raw(String),
}

impl Command {
    /// Build a power command, rejecting values above [`MAX_POWER`]
    pub fn set_power(value: u32) -> Result<Self, ProtocolError> {
        match u16::try_from(value) {
            Ok(v) if v <= MAX_POWER => Ok(Command::SetPower(v)),
            _ => Err(ProtocolError::InvalidPower(value)),
        }
    }

    /// Render the token (without terminator)
    pub fn token(&self) -> String {
        match self {
            Command::Switch { control, on } => control.token(*on).to_string(),
            Command::SetPower(value) => format!("P={:04}", value),
            Command::QueryStatus => STATUS_REQUEST.to_string(),
            Command::Raw(token) => token.clone(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

/// Send a command token.
///
/// Stale input is discarded first so that a later status read only sees the
/// device's answer to this command. When `settle` is non-zero the caller is
/// paused for that long after the write. Nothing is read back.
pub fn send_command(
    session: &mut Session,
    token: &str,
    settle: Duration,
) -> Result<(), ProtocolError> {
    if !session.is_open() {
        return Err(ProtocolError::NotConnected);
    }
    if token.contains(['\r', '\n']) {
        return Err(ProtocolError::InvalidCommand(token.to_string()));
    }

    session.clear_input()?;

    let mut frame = Vec::with_capacity(token.len() + session.line_terminator().len());
    frame.extend_from_slice(token.as_bytes());
    frame.extend_from_slice(session.line_terminator().as_bytes());
    session.write_raw(&frame)?;
    debug!("send_command: {:?} sent, settle {}ms", token, settle.as_millis());

    if !settle.is_zero() {
        std::thread::sleep(settle);
    }
    Ok(())
}
