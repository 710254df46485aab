mod common;

use lamplink_core::protocol::Control;
use lamplink_core::sim::{ReplyMode, SimulatedDevice, SimulatedPorts};
use lamplink_core::switch::{ControlPanel, RevertReason, SwitchOutcome, SwitchTiming};
use pretty_assertions::assert_eq;
use std::time::Duration;

use common::{connected, init_tracing};

fn setup(device: &SimulatedDevice) -> (SimulatedPorts, lamplink_core::protocol::Connection) {
    let ports = SimulatedPorts::new().with_device("COM3", device.clone());
    let conn = connected(&ports, "COM3");
    (ports, conn)
}

#[test]
fn test_fan_toggle_confirmed() {
    init_tracing();
    let device = SimulatedDevice::new("A1").with_switch(Control::Lamp, true);
    let (_ports, mut conn) = setup(&device);
    let mut panel = ControlPanel::new();

    let outcome = panel.request_toggle(&mut conn, Control::Fan, true);

    assert!(matches!(
        outcome,
        SwitchOutcome::Confirmed {
            control: Control::Fan,
            state: true
        }
    ));
    assert!(panel.state(Control::Fan));
    // the confirming snapshot is applied to every control
    assert!(panel.state(Control::Lamp));
    assert!(!panel.state(Control::Shutter));
    assert_eq!(device.received_commands(), vec!["C1", "FS"]);
}

#[test]
fn test_stuck_shutter_reverts_to_reported_state() {
    let device = SimulatedDevice::new("A1");
    device.set_stuck(Control::Shutter, false);
    let (_ports, mut conn) = setup(&device);
    let mut panel = ControlPanel::new();

    let outcome = panel.request_toggle(&mut conn, Control::Shutter, true);

    assert!(matches!(
        outcome,
        SwitchOutcome::Reverted {
            state: false,
            reason: RevertReason::Mismatch {
                reported: Some(false)
            },
            ..
        }
    ));
    assert!(!panel.state(Control::Shutter));
    assert_eq!(panel.observed(Control::Shutter), Some(false));
}

#[test]
fn test_stuck_on_lamp_turn_off_reverts_to_on() {
    let device = SimulatedDevice::new("A1");
    device.set_stuck(Control::Lamp, true);
    let (_ports, mut conn) = setup(&device);
    let mut panel = ControlPanel::new();
    panel.apply_observed(&conn.query_status().expect("status"));
    assert!(panel.state(Control::Lamp));

    let outcome = panel.request_toggle(&mut conn, Control::Lamp, false);

    assert!(!outcome.is_confirmed());
    assert!(outcome.state());
    assert!(panel.state(Control::Lamp));
}

#[test]
fn test_slow_shutter_needs_grace_window() {
    let device = SimulatedDevice::new("A1").with_lag(Control::Shutter, Duration::from_millis(120));
    let (_ports, mut conn) = setup(&device);
    let mut panel = ControlPanel::new();

    // grace shorter than the actuation lag: the read still shows the old position
    let short = SwitchTiming {
        settle_ms: 0,
        grace_ms: 10,
        confirm_attempts: 1,
        confirm_interval_ms: 0,
    };
    let outcome = panel.request_toggle_with(&mut conn, Control::Shutter, true, &short);
    assert!(matches!(
        outcome,
        SwitchOutcome::Reverted {
            state: false,
            ..
        }
    ));
    assert!(!panel.state(Control::Shutter));

    // the late actuation lands after the revert
    std::thread::sleep(Duration::from_millis(150));
    assert!(device.switch_state(Control::Shutter));

    // a later confirmation read sees the shutter close
    let patient = SwitchTiming {
        settle_ms: 0,
        grace_ms: 10,
        confirm_attempts: 3,
        confirm_interval_ms: 80,
    };
    let outcome = panel.request_toggle_with(&mut conn, Control::Shutter, false, &patient);
    assert!(outcome.is_confirmed());
    assert!(!panel.state(Control::Shutter));
    assert!(!device.switch_state(Control::Shutter));
}

#[test]
fn test_jittered_lag_within_retry_window_confirms() {
    let device = SimulatedDevice::new("A1")
        .with_lag(Control::Lamp, Duration::from_millis(20))
        .with_jitter(30, 7);
    let (_ports, mut conn) = setup(&device);
    let mut panel = ControlPanel::new();
    let timing = SwitchTiming {
        settle_ms: 0,
        grace_ms: 20,
        confirm_attempts: 4,
        confirm_interval_ms: 30,
    };

    let outcome = panel.request_toggle_with(&mut conn, Control::Lamp, true, &timing);
    assert!(outcome.is_confirmed());
}

#[test]
fn test_send_failure_restores_prior_value() {
    let device = SimulatedDevice::new("A1");
    let (_ports, mut conn) = setup(&device);
    let mut panel = ControlPanel::new();
    device.set_fail_writes(true);

    let outcome = panel.request_toggle(&mut conn, Control::Fan, true);

    assert!(matches!(
        outcome,
        SwitchOutcome::Reverted {
            state: false,
            reason: RevertReason::SendFailed(_),
            ..
        }
    ));
    assert!(!panel.state(Control::Fan));
}

#[test]
fn test_query_failure_reverts_to_negation() {
    let device = SimulatedDevice::new("A1").with_switch(Control::Fan, true);
    let (_ports, mut conn) = setup(&device);
    let mut panel = ControlPanel::new();
    panel.apply_observed(&conn.query_status().expect("status"));

    // the switch command goes out, the status request does not
    device.fail_writes_after(1);
    let outcome = panel.request_toggle(&mut conn, Control::Fan, false);

    assert!(matches!(
        outcome,
        SwitchOutcome::Reverted {
            state: true,
            reason: RevertReason::QueryFailed(_),
            ..
        }
    ));
    assert!(panel.state(Control::Fan));
}

#[test]
fn test_silent_device_reverts_to_negation_without_history() {
    let device = SimulatedDevice::new("A1").with_reply_mode(ReplyMode::Silent);
    let (_ports, mut conn) = setup(&device);
    let mut panel = ControlPanel::new();

    let outcome = panel.request_toggle(&mut conn, Control::Lamp, true);

    assert!(matches!(
        outcome,
        SwitchOutcome::Reverted {
            state: false,
            reason: RevertReason::Mismatch { reported: None },
            ..
        }
    ));
}

#[test]
fn test_polling_resumes_after_toggle() {
    let device = SimulatedDevice::new("A1");
    let (_ports, mut conn) = setup(&device);
    let mut panel = ControlPanel::new();
    conn.start_polling();

    assert!(panel.request_toggle(&mut conn, Control::Fan, true).is_confirmed());
    assert!(conn.polling().is_running());

    device.set_stuck(Control::Fan, false);
    assert!(!panel.request_toggle(&mut conn, Control::Fan, true).is_confirmed());
    assert!(conn.polling().is_running());

    let polled = conn.poll_tick().expect("tick").expect("polling is running");
    assert_eq!(polled.flag("COOL"), Some(false));
}

#[test]
fn test_apply_observed_sends_nothing() {
    let device = SimulatedDevice::new("A1").with_switch(Control::Shutter, true);
    let (_ports, mut conn) = setup(&device);
    let mut panel = ControlPanel::new();

    let snapshot = conn.query_status().expect("status");
    let changed = panel.apply_observed(&snapshot);

    assert_eq!(changed, vec![Control::Shutter]);
    assert_eq!(device.received_commands(), vec!["FS"]);
}
