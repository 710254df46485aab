//! Switch reconciliation
//!
//! A UI switch flips the moment the user clicks it, but the supply (the
//! shutter in particular) needs time to actually move. A toggle therefore
//! runs as a short state machine:
//!
//! ```text
//! Idle -> Pending(desired) -> send command -> wait grace -> read status
//!                                 |                          |
//!                                 v                          v
//!                             Reverted              Confirmed | Reverted
//! ```
//!
//! Readings that come from the device go through [`ControlPanel::apply_observed`]
//! instead, which never sends anything, so applying a confirmed snapshot
//! cannot start another toggle.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::protocol::{Command, Connection, Control, ProtocolError, StatusSnapshot};

/// Timing of a switch toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchTiming {
    /// Pause after writing the command, in milliseconds
    pub settle_ms: u64,
    /// Wait before the first confirmation read, in milliseconds
    pub grace_ms: u64,
    /// Number of status reads before giving up
    pub confirm_attempts: u32,
    /// Wait between confirmation reads, in milliseconds
    pub confirm_interval_ms: u64,
}

impl Default for SwitchTiming {
    fn default() -> Self {
        Self {
            settle_ms: 50,
            grace_ms: 500,
            confirm_attempts: 1,
            confirm_interval_ms: 250,
        }
    }
}

impl SwitchTiming {
    /// Pause after the command write
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Wait before the first confirmation read
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// Wait between confirmation reads
    pub fn confirm_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_interval_ms)
    }
}

/// Why a toggle was rolled back
#[derive(Debug)]
pub enum RevertReason {
    /// No open connection
    NotConnected,
    /// Writing the command failed
    SendFailed(ProtocolError),
    /// The device never reported the requested state
    Mismatch {
        /// Last state the device reported, if it reported one
        reported: Option<bool>,
    },
    /// Reading status during confirmation failed
    QueryFailed(ProtocolError),
}

/// Final result of a toggle
#[derive(Debug)]
pub enum SwitchOutcome {
    /// The device reports the requested state
    Confirmed {
        /// Toggled control
        control: Control,
        /// Confirmed state
        state: bool,
    },
    /// The control was restored to `state`
    Reverted {
        /// Toggled control
        control: Control,
        /// State shown after the revert
        state: bool,
        /// Why the request did not stick
        reason: RevertReason,
    },
}

impl SwitchOutcome {
    /// Control the toggle was for
    pub fn control(&self) -> Control {
        match self {
            SwitchOutcome::Confirmed { control, .. } | SwitchOutcome::Reverted { control, .. } => {
                *control
            }
        }
    }

    /// State the control ends up showing
    pub fn state(&self) -> bool {
        match self {
            SwitchOutcome::Confirmed { state, .. } | SwitchOutcome::Reverted { state, .. } => *state,
        }
    }

    /// Whether the device confirmed the request
    pub fn is_confirmed(&self) -> bool {
        matches!(self, SwitchOutcome::Confirmed { .. })
    }
}

/// UI-facing switch states plus what the device last reported
#[derive(Debug, Clone, Default)]
pub struct ControlPanel {
    shown: HashMap<Control, bool>,
    observed: HashMap<Control, bool>,
}

impl ControlPanel {
    /// Everything off, nothing observed yet
    pub fn new() -> Self {
        Self::default()
    }

    /// State the switch currently shows
    pub fn state(&self, control: Control) -> bool {
        self.shown.get(&control).copied().unwrap_or(false)
    }

    /// Last state the device reported, if any
    pub fn observed(&self, control: Control) -> Option<bool> {
        self.observed.get(&control).copied()
    }

    /// Apply a device reading to every control it mentions. Returns the
    /// controls whose shown state changed.
    pub fn apply_observed(&mut self, snapshot: &StatusSnapshot) -> Vec<Control> {
        let mut changed = Vec::new();
        for control in Control::ALL {
            let Some(on) = snapshot.flag(control.status_key()) else {
                continue;
            };
            let before = self.state(control);
            self.observed.insert(control, on);
            self.shown.insert(control, on);
            if before != on {
                changed.push(control);
            }
        }
        changed
    }

    /// User toggled `control` to `desired`, using the connection's timing
    pub fn request_toggle(
        &mut self,
        conn: &mut Connection,
        control: Control,
        desired: bool,
    ) -> SwitchOutcome {
        let timing = conn.config().switch;
        self.request_toggle_with(conn, control, desired, &timing)
    }

    /// User toggled `control` to `desired`
    ///
    /// The switch shows `desired` immediately and keeps it only if the device
    /// confirms. Background polling is paused until this returns.
    pub fn request_toggle_with(
        &mut self,
        conn: &mut Connection,
        control: Control,
        desired: bool,
        timing: &SwitchTiming,
    ) -> SwitchOutcome {
        let prior = self.state(control);

        if !conn.is_connected() {
            warn!("{} toggle ignored: not connected", control);
            return self.revert(control, prior, RevertReason::NotConnected);
        }

        self.shown.insert(control, desired);
        debug!("{} pending -> {}", control, desired);

        let mut conn = conn.pause_polling();

        let command = Command::Switch {
            control,
            on: desired,
        };
        if let Err(e) = conn.send_with_settle(&command, timing.settle()) {
            return self.revert(control, prior, RevertReason::SendFailed(e));
        }

        std::thread::sleep(timing.grace());

        let mut last_reported = None;
        for attempt in 0..timing.confirm_attempts.max(1) {
            if attempt > 0 {
                std::thread::sleep(timing.confirm_interval());
            }
            let snapshot = match conn.query_status() {
                Ok(snapshot) => snapshot,
                Err(e) => return self.revert(control, !desired, RevertReason::QueryFailed(e)),
            };
            let reported = snapshot.flag(control.status_key());
            if reported == Some(desired) {
                self.apply_observed(&snapshot);
                info!("{} confirmed {}", control, desired);
                return SwitchOutcome::Confirmed {
                    control,
                    state: desired,
                };
            }
            if let Some(actual) = reported {
                self.observed.insert(control, actual);
                last_reported = Some(actual);
            }
            debug!(
                "{} attempt {}: device reports {:?}, wanted {}",
                control,
                attempt + 1,
                reported,
                desired
            );
        }

        let restore = self.observed(control).unwrap_or(!desired);
        self.revert(
            control,
            restore,
            RevertReason::Mismatch {
                reported: last_reported,
            },
        )
    }

    fn revert(&mut self, control: Control, state: bool, reason: RevertReason) -> SwitchOutcome {
        warn!("{} reverted to {} ({:?})", control, state, reason);
        self.shown.insert(control, state);
        SwitchOutcome::Reverted {
            control,
            state,
            reason,
        }
    }
}
