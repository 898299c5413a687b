//! Shared test utilities for serial-transport tests.
//!
//! This module provides common test infrastructure including:
//! - Simulated buses with devices already attached
//! - Registries wired to a simulated bus
//! - Timing assertions for blocking reads

#![allow(dead_code)]

use serial_transport::port::{MockBus, MockLine};
use serial_transport::{PortRegistry, PortSession, SerialConfiguration, TimeoutDescriptor};
use std::time::{Duration, Instant};

/// Path of the first simulated device in every fixture.
pub const MOCK_PORT: &str = "/dev/ttyMOCK0";

/// Create a bus with one device plugged in at [`MOCK_PORT`].
pub fn bus_with_device() -> (MockBus, MockLine) {
    let bus = MockBus::new();
    let line = bus.plug(MOCK_PORT);
    (bus, line)
}

/// Create a bus with `count` devices at `/dev/ttyMOCK0..`.
pub fn bus_with_devices(count: usize) -> (MockBus, Vec<MockLine>) {
    let bus = MockBus::new();
    let lines = (0..count)
        .map(|i| bus.plug(&format!("/dev/ttyMOCK{}", i)))
        .collect();
    (bus, lines)
}

/// A registry that scans and opens through `bus`.
pub fn registry_for(bus: &MockBus) -> PortRegistry {
    PortRegistry::new(bus.clone(), bus.clone())
}

/// Open [`MOCK_PORT`] on `bus` at 9600 baud with the given timeouts.
pub fn open_session(bus: &MockBus, timeouts: TimeoutDescriptor) -> PortSession {
    PortSession::open_with(bus, MOCK_PORT, SerialConfiguration::new(9600), timeouts)
        .expect("Failed to open mock session")
}

/// Run `f` and return its result together with the elapsed time.
pub fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let value = f();
    (value, start.elapsed())
}

/// Assert that `elapsed` lies within `[low, high]`.
pub fn assert_elapsed_between(elapsed: Duration, low: Duration, high: Duration) {
    assert!(
        elapsed >= low && elapsed <= high,
        "Elapsed {:?} not within [{:?}, {:?}]",
        elapsed,
        low,
        high
    );
}

/// Poll `condition` until it holds or `timeout` expires.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
