//! # LampLink Core Library
//!
//! Protocol engine for laboratory lamp power supplies controlled over a
//! serial line.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Serial session management and port enumeration
//! - Command framing for the fan, shutter, lamp and power setpoint
//! - `START…END` status frame parsing
//! - Bounded-time status queries
//! - Instrument discovery by serial number
//! - Optimistic switch toggling with device confirmation
//! - A simulated supply for demo mode and tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use lamplink_core::prelude::*;
//!
//! let mut conn = Connection::default();
//! if conn.auto_connect("A1234")?.is_some() {
//!     let mut panel = ControlPanel::new();
//!     panel.apply_observed(&conn.query_status()?);
//!
//!     let outcome = panel.request_toggle(&mut conn, Control::Shutter, true);
//!     println!("shutter now {}", outcome.state());
//!
//!     conn.set_power(150)?;
//! }
//! ```

pub mod protocol;
pub mod sim;
pub mod switch;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        Command, Connection, ConnectionConfig, Control, ProtocolError, QueryTiming,
        StatusSnapshot, StatusValue,
    };
    pub use crate::sim::{SimulatedDevice, SimulatedPorts};
    pub use crate::switch::{ControlPanel, RevertReason, SwitchOutcome, SwitchTiming};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
