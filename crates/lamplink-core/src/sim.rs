//! Simulated lamp supply
//!
//! Speaks the same line protocol as the hardware so the UI and the protocol
//! engine can run without an instrument attached (demo mode), and so tests
//! can exercise actuation lag, silent ports and truncated frames.
//!
//! Switch commands take effect after a per-control actuation lag plus a
//! random jitter, like the real shutter which reports its old position for a
//! while after the command is acknowledged.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::protocol::commands::{Control, STATUS_REQUEST};
use crate::protocol::status::{FRAME_END, FRAME_START};
use crate::protocol::{CommunicationChannel, PortProvider, ProtocolError};

/// How the simulated device answers status requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Full `START…END` frame
    Normal,
    /// Frame cut off before `END`
    Truncated,
    /// Never answers
    Silent,
}

struct DeviceState {
    serial: String,
    switches: HashMap<Control, bool>,
    power: u16,
    /// Switch changes acknowledged but not yet physically complete
    pending: Vec<(Control, bool, Instant)>,
    lag: HashMap<Control, Duration>,
    jitter_ms: u64,
    rng: StdRng,
    stuck: HashMap<Control, bool>,
    reply_mode: ReplyMode,
    acknowledge: bool,
    fail_writes: bool,
    writes_until_failure: Option<usize>,
    rx: VecDeque<u8>,
    tx_line: Vec<u8>,
    received: Vec<String>,
}

impl DeviceState {
    fn settle_pending(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|(_, _, at)| *at <= now);
        self.pending = waiting;
        for (control, on, _) in due {
            self.switches.insert(control, on);
        }
    }

    fn status_frame(&mut self) -> String {
        self.settle_pending(Instant::now());
        let flag = |on: Option<&bool>| if on.copied().unwrap_or(false) { 1 } else { 0 };
        let mut lines = vec![
            FRAME_START.to_string(),
            format!("SN={}", self.serial),
            format!("COOL={}", flag(self.switches.get(&Control::Fan))),
            format!("SHUTTER={}", flag(self.switches.get(&Control::Shutter))),
            format!("LAMP={}", flag(self.switches.get(&Control::Lamp))),
            format!("POWER={:04}", self.power),
            FRAME_END.to_string(),
        ];
        if self.reply_mode == ReplyMode::Truncated {
            lines.truncate(lines.len() - 2);
            // half of the POWER line, no newline
            return format!("{}\nPOW", lines.join("\n"));
        }
        lines.join("\n") + "\n"
    }

    fn handle_line(&mut self, line: &str) {
        let token = line.trim();
        if token.is_empty() {
            return;
        }
        self.received.push(token.to_string());

        let reply = if token.eq_ignore_ascii_case(STATUS_REQUEST) {
            match self.reply_mode {
                ReplyMode::Silent => None,
                _ => Some(self.status_frame()),
            }
        } else if let Some(value) = token.strip_prefix("P=") {
            match value.parse::<u16>() {
                Ok(p) if value.len() == 4 => {
                    self.power = p;
                    Some("OK\n".to_string())
                }
                _ => Some("ERR\n".to_string()),
            }
        } else if let Some((control, on)) = Control::ALL.into_iter().find_map(|c| {
            if token == c.on_token() {
                Some((c, true))
            } else if token == c.off_token() {
                Some((c, false))
            } else {
                None
            }
        }) {
            self.schedule(control, on);
            Some("OK\n".to_string())
        } else {
            Some("ERR\n".to_string())
        };

        if let Some(reply) = reply {
            let is_ack = !reply.starts_with(FRAME_START);
            if !is_ack || self.acknowledge {
                self.rx.extend(reply.bytes());
            }
        }
    }

    fn schedule(&mut self, control: Control, on: bool) {
        if let Some(stuck) = self.stuck.get(&control) {
            self.switches.insert(control, *stuck);
            return;
        }
        let lag = self.lag.get(&control).copied().unwrap_or_default();
        let jitter = if self.jitter_ms > 0 {
            Duration::from_millis(self.rng.gen_range(0..=self.jitter_ms))
        } else {
            Duration::ZERO
        };
        self.pending.retain(|(c, _, _)| *c != control);
        self.pending.push((control, on, Instant::now() + lag + jitter));
    }
}

/// Handle to a simulated supply; clones share the same device
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    /// A device reporting `serial`, everything off, no lag
    pub fn new(serial: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                serial: serial.to_string(),
                switches: HashMap::new(),
                power: 0,
                pending: Vec::new(),
                lag: HashMap::new(),
                jitter_ms: 0,
                rng: StdRng::seed_from_u64(0),
                stuck: HashMap::new(),
                reply_mode: ReplyMode::Normal,
                acknowledge: true,
                fail_writes: false,
                writes_until_failure: None,
                rx: VecDeque::new(),
                tx_line: Vec::new(),
                received: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay between acknowledging a switch command and the switch moving
    pub fn with_lag(self, control: Control, lag: Duration) -> Self {
        self.lock().lag.insert(control, lag);
        self
    }

    /// Extra random delay of up to `max_ms` per switch command
    pub fn with_jitter(self, max_ms: u64, seed: u64) -> Self {
        {
            let mut state = self.lock();
            state.jitter_ms = max_ms;
            state.rng = StdRng::seed_from_u64(seed);
        }
        self
    }

    /// How status requests are answered
    pub fn with_reply_mode(self, mode: ReplyMode) -> Self {
        self.lock().reply_mode = mode;
        self
    }

    /// Whether switch and power commands are answered with `OK`
    pub fn with_acknowledgements(self, acknowledge: bool) -> Self {
        self.lock().acknowledge = acknowledge;
        self
    }

    /// Initial switch state
    pub fn with_switch(self, control: Control, on: bool) -> Self {
        self.lock().switches.insert(control, on);
        self
    }

    /// Bytes waiting in the receive buffer before any command, as if the
    /// device had been chattering before the port was opened
    pub fn with_pending_output(self, text: &str) -> Self {
        self.lock().rx.extend(text.bytes());
        self
    }

    /// Make `control` ignore commands and sit at `position`
    pub fn set_stuck(&self, control: Control, position: bool) {
        let mut state = self.lock();
        state.stuck.insert(control, position);
        state.switches.insert(control, position);
    }

    /// Make every write fail, as if the cable was pulled
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Accept `writes` more write calls, then fail every write after that
    pub fn fail_writes_after(&self, writes: usize) {
        let mut state = self.lock();
        state.writes_until_failure = Some(writes);
        state.fail_writes = writes == 0;
    }

    /// Change how status requests are answered
    pub fn set_reply_mode(&self, mode: ReplyMode) {
        self.lock().reply_mode = mode;
    }

    /// Physical switch state right now
    pub fn switch_state(&self, control: Control) -> bool {
        let mut state = self.lock();
        state.settle_pending(Instant::now());
        state.switches.get(&control).copied().unwrap_or(false)
    }

    /// Current power setpoint
    pub fn power(&self) -> u16 {
        self.lock().power
    }

    /// Command tokens received so far, in order
    pub fn received_commands(&self) -> Vec<String> {
        self.lock().received.clone()
    }

    /// A channel to this device
    pub fn channel(&self, timeout: Duration) -> SimulatedChannel {
        SimulatedChannel {
            device: self.clone(),
            timeout,
            open_count: None,
        }
    }
}

/// Byte stream to a [`SimulatedDevice`]
pub struct SimulatedChannel {
    device: SimulatedDevice,
    timeout: Duration,
    open_count: Option<Arc<AtomicUsize>>,
}

impl Read for SimulatedChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.device.lock().rx.is_empty() {
            std::thread::sleep(self.timeout);
        }
        let mut state = self.device.lock();
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.device.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected"));
        }
        for &byte in buf {
            if byte == b'\n' || byte == b'\r' {
                let line = String::from_utf8_lossy(&state.tx_line).into_owned();
                state.tx_line.clear();
                state.handle_line(&line);
            } else {
                state.tx_line.push(byte);
            }
        }
        if let Some(left) = state.writes_until_failure {
            let left = left.saturating_sub(1);
            state.writes_until_failure = Some(left);
            state.fail_writes = left == 0;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CommunicationChannel for SimulatedChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.device.lock().rx.clear();
        Ok(())
    }
}

impl Drop for SimulatedChannel {
    fn drop(&mut self) {
        if let Some(count) = &self.open_count {
            count.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

enum PortSlot {
    Device(SimulatedDevice),
    Unavailable(String),
}

/// Port provider backed by simulated devices
///
/// Records every open so tests can check which ports a scan touched and how
/// many were held at once.
#[derive(Clone, Default)]
pub struct SimulatedPorts {
    ports: Arc<Mutex<Vec<(String, PortSlot)>>>,
    opened: Arc<Mutex<Vec<String>>>,
    open_now: Arc<AtomicUsize>,
    open_peak: Arc<AtomicUsize>,
}

impl SimulatedPorts {
    /// No ports
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a port with a device behind it
    pub fn with_device(self, port: &str, device: SimulatedDevice) -> Self {
        self.lock_ports()
            .push((port.to_string(), PortSlot::Device(device)));
        self
    }

    /// Add a port that fails to open (busy, permission denied, ...)
    pub fn with_unavailable(self, port: &str, reason: &str) -> Self {
        self.lock_ports()
            .push((port.to_string(), PortSlot::Unavailable(reason.to_string())));
        self
    }

    fn lock_ports(&self) -> MutexGuard<'_, Vec<(String, PortSlot)>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ports opened so far, in order
    pub fn opened(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Channels currently open
    pub fn open_now(&self) -> usize {
        self.open_now.load(Ordering::SeqCst)
    }

    /// Most channels ever open at the same time
    pub fn open_peak(&self) -> usize {
        self.open_peak.load(Ordering::SeqCst)
    }
}

impl PortProvider for SimulatedPorts {
    fn available_ports(&self) -> Result<Vec<String>, ProtocolError> {
        Ok(self.lock_ports().iter().map(|(name, _)| name.clone()).collect())
    }

    fn open(
        &self,
        port_name: &str,
        _baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn CommunicationChannel>, ProtocolError> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(port_name.to_string());

        let ports = self.lock_ports();
        let device = match ports.iter().find(|(name, _)| name == port_name) {
            Some((_, PortSlot::Device(device))) => device.clone(),
            Some((_, PortSlot::Unavailable(reason))) => {
                return Err(ProtocolError::ConnectionFailed(format!(
                    "{}: {}",
                    port_name, reason
                )))
            }
            None => {
                return Err(ProtocolError::ConnectionFailed(format!(
                    "{}: no such port",
                    port_name
                )))
            }
        };

        let now = self.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.open_peak.fetch_max(now, Ordering::SeqCst);

        let mut channel = device.channel(timeout);
        channel.open_count = Some(Arc::clone(&self.open_now));
        Ok(Box::new(channel))
    }
}
