#![allow(dead_code)]

use lamplink_core::protocol::{Connection, ConnectionConfig, QueryTiming};
use lamplink_core::sim::SimulatedPorts;
use lamplink_core::switch::SwitchTiming;
use std::sync::Arc;

/// Install a test subscriber once; `RUST_LOG=debug cargo test` shows protocol traffic
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Configuration with timings short enough for tests
pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        timeout_ms: 500,
        query: QueryTiming {
            budget_ms: 200,
            attempt_timeout_ms: 20,
        },
        switch: SwitchTiming {
            settle_ms: 0,
            grace_ms: 20,
            confirm_attempts: 1,
            confirm_interval_ms: 20,
        },
        ..ConnectionConfig::default()
    }
}

/// Connection over simulated ports, already connected to `port`
pub fn connected(ports: &SimulatedPorts, port: &str) -> Connection {
    let mut conn = Connection::with_provider(fast_config(), Arc::new(ports.clone()));
    conn.connect(port).expect("simulated port opens");
    conn
}
