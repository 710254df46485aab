//! Bounded-latency status query
//!
//! The supply emits its status frame at an uneven cadence. Rather than one
//! long read that could stall for the full port timeout when the device is
//! silent, lines are polled with a short per-attempt timeout until `END`
//! arrives or an overall budget runs out.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use super::commands::{send_command, STATUS_REQUEST};
use super::status::{parse_status_frame, StatusSnapshot, FRAME_END};
use super::{ProtocolError, Session, STATUS_ATTEMPT_TIMEOUT_MS, STATUS_QUERY_BUDGET_MS};

/// Timing of one status query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryTiming {
    /// Overall time allowed for the frame to arrive, in milliseconds
    pub budget_ms: u64,
    /// Read timeout for each line attempt, in milliseconds
    pub attempt_timeout_ms: u64,
}

impl Default for QueryTiming {
    fn default() -> Self {
        Self {
            budget_ms: STATUS_QUERY_BUDGET_MS,
            attempt_timeout_ms: STATUS_ATTEMPT_TIMEOUT_MS,
        }
    }
}

impl QueryTiming {
    /// Overall time allowed for the frame
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }

    /// Read timeout of one line attempt, never below 1 ms
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms.max(1))
    }
}

/// Request and read one status frame.
///
/// Running out of budget before `END` is not an error: whatever arrived is
/// parsed and returned. The session's own read timeout is untouched when this
/// returns.
pub fn query_status(
    session: &mut Session,
    timing: &QueryTiming,
) -> Result<StatusSnapshot, ProtocolError> {
    if !session.is_open() {
        return Err(ProtocolError::NotConnected);
    }

    send_command(session, STATUS_REQUEST, Duration::ZERO)?;

    let start = Instant::now();
    let deadline = start + timing.budget();
    let mut accumulated = String::new();
    let mut terminated = false;

    {
        let mut poll = session.with_timeout(timing.attempt_timeout())?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let attempt = remaining.min(timing.attempt_timeout());
            let Some(line) = poll.read_line(attempt)? else {
                continue;
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            accumulated.push_str(trimmed);
            accumulated.push('\n');
            if trimmed.eq_ignore_ascii_case(FRAME_END) {
                terminated = true;
                break;
            }
        }
        if !terminated {
            if let Some(partial) = poll.take_partial_line() {
                accumulated.push_str(&partial);
            }
        }
    }

    let parsed = parse_status_frame(&accumulated);
    if parsed.complete {
        debug!(
            "query_status: {} keys in {}ms",
            parsed.snapshot.len(),
            start.elapsed().as_millis()
        );
    } else {
        debug!(
            "query_status: no END within {}ms, returning {} keys",
            timing.budget_ms,
            parsed.snapshot.len()
        );
    }

    session.record_status(parsed.snapshot.clone());
    Ok(parsed.snapshot)
}
