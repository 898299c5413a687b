//! Tests requiring actual serial hardware.
//!
//! These tests are skipped if no hardware is available.
//!
//! # Running Hardware Tests
//!
//! ```bash
//! # Set environment variables
//! export TEST_PORT=/dev/ttyUSB0          # or COM3 on Windows
//! export TEST_BAUD=9600                  # optional, default: 9600
//! export TEST_LOOPBACK=1                 # if port has TX-RX loopback
//!
//! # Run tests
//! cargo test --features hardware-tests -- --ignored
//! ```
//!
//! # Hardware Requirements
//!
//! - **Real port tests**: Any available serial port
//! - **Loopback tests**: Port with TX and RX connected together

use serial_transport::{
    EventMask, EventWaiter, IoError, OpenError, PortRegistry, PortSession, TimeoutDescriptor,
};
use std::time::{Duration, Instant};

use crate::hardware::utils::{assert_duration_within, PortTestFixture, TestPortConfig};

/// Skip test if hardware is not available.
fn skip_without_hardware() -> Option<TestPortConfig> {
    let config = TestPortConfig::from_env();
    if config.is_none() {
        println!("Skipping hardware test: TEST_PORT not set");
    }
    config
}

fn skip_without_loopback() -> Option<PortTestFixture> {
    let fixture = PortTestFixture::setup()?;
    if !fixture.is_loopback() {
        println!("Skipping: TEST_LOOPBACK not set to 1");
        return None;
    }
    Some(fixture)
}

#[test]
#[ignore] // Run with --ignored flag
fn test_real_port_open_close() {
    let config = match skip_without_hardware() {
        Some(c) => c,
        None => return,
    };

    let session = PortSession::open(&config.port_name, config.line_config(), config.timeouts())
        .unwrap_or_else(|e| panic!("Port open failed: {}", e));

    assert!(session.is_open());
    assert_eq!(session.configuration().baud_rate, config.baud_rate);

    session.close();
    session.close();
    assert!(!session.is_open());
}

#[test]
#[ignore]
fn test_real_port_exclusive_open() {
    let config = match skip_without_hardware() {
        Some(c) => c,
        None => return,
    };
    let registry = PortRegistry::system();

    let first = registry
        .open(&config.port_name, config.line_config(), config.timeouts())
        .expect("First open should succeed");
    let second = registry.open(&config.port_name, config.line_config(), config.timeouts());

    assert!(matches!(second, Err(OpenError::LockContention { .. })));
    first.close();
}

#[test]
#[ignore]
fn test_real_port_nonblocking_read_returns_immediately() {
    let fixture = match PortTestFixture::setup() {
        Some(f) => f,
        None => return,
    };
    fixture.session.flush_buffers().expect("Flush failed");
    fixture
        .session
        .set_timeouts(TimeoutDescriptor::nonblocking())
        .unwrap();

    let start = Instant::now();
    let result = fixture.session.read(64);
    let elapsed = start.elapsed();

    assert!(result.is_ok());
    assert!(elapsed < Duration::from_millis(100));
    fixture.teardown();
}

#[test]
#[ignore]
fn test_real_port_blocking_read_timeout() {
    let fixture = match PortTestFixture::setup() {
        Some(f) => f,
        None => return,
    };
    fixture.session.flush_buffers().expect("Flush failed");
    fixture
        .session
        .set_timeouts(TimeoutDescriptor::blocking(200))
        .unwrap();

    let start = Instant::now();
    let result = fixture.session.read(100);
    let elapsed = start.elapsed();

    match result {
        Ok(data) => println!("Read {} byte(s) before timeout", data.len()),
        Err(IoError::DeviceLost { .. }) => panic!("Device lost during read"),
        Err(e) => panic!("Unexpected error: {}", e),
    }
    assert_duration_within(
        elapsed,
        Duration::from_millis(200),
        Duration::from_millis(150),
        "blocking read should return at its timeout",
    );
    fixture.teardown();
}

#[test]
#[ignore]
fn test_real_port_modem_lines() {
    let fixture = match PortTestFixture::setup() {
        Some(f) => f,
        None => return,
    };

    match fixture.session.line_status() {
        Ok(status) => println!("{}: {:?}", fixture.port_name(), status),
        Err(e) => println!("Line status not supported: {}", e),
    }
    if fixture.session.set_rts().is_ok() {
        assert!(fixture.session.rts().unwrap_or(true));
        fixture.session.clear_rts().unwrap();
    }
    fixture.teardown();
}

#[test]
#[ignore] // Requires loopback adapter
fn test_real_port_loopback() {
    let fixture = match skip_without_loopback() {
        Some(f) => f,
        None => return,
    };
    fixture.session.flush_buffers().expect("Flush failed");

    let test_data = b"Hello, Serial!";
    let written = fixture.session.write(test_data).expect("Write failed");
    assert_eq!(written, test_data.len());

    std::thread::sleep(Duration::from_millis(100));
    fixture
        .session
        .set_timeouts(TimeoutDescriptor::blocking(1000))
        .unwrap();
    let received = fixture.session.read(test_data.len()).expect("Read failed");

    assert_eq!(received, test_data.to_vec());
    fixture.teardown();
}

#[test]
#[ignore] // Requires loopback adapter
fn test_real_port_data_event() {
    let fixture = match skip_without_loopback() {
        Some(f) => f,
        None => return,
    };
    fixture
        .session
        .set_monitored_events(EventMask::DATA_AVAILABLE)
        .unwrap();
    fixture.session.set_listening(true);
    let mut waiter = EventWaiter::new(&fixture.session);

    fixture.session.write(b"x").expect("Write failed");
    let events = waiter.wait_for_event(Some(Instant::now() + Duration::from_secs(2)));

    assert!(events.contains(EventMask::DATA_AVAILABLE));
    fixture.teardown();
}
