//! Environment-driven setup for the hardware suite.
//!
//! `TEST_PORT` names the device, `TEST_BAUD` its rate (9600 when unset) and
//! `TEST_LOOPBACK=1` declares TX wired to RX.

use serial_transport::registry::Transport;
use serial_transport::{
    PortDescriptor, PortRegistry, PortSession, SerialConfiguration, TimeoutDescriptor, WriteMode,
};
use std::time::Duration;

pub struct TestPortConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub loopback_enabled: bool,
}

impl TestPortConfig {
    /// `None` when `TEST_PORT` is unset.
    pub fn from_env() -> Option<Self> {
        let var = |name: &str| std::env::var(name).ok();
        Some(Self {
            port_name: var("TEST_PORT")?,
            baud_rate: var("TEST_BAUD").and_then(|b| b.parse().ok()).unwrap_or(9600),
            loopback_enabled: var("TEST_LOOPBACK").as_deref() == Some("1"),
        })
    }

    pub fn line_config(&self) -> SerialConfiguration {
        SerialConfiguration::new(self.baud_rate)
    }

    /// Semi-blocking reads with a one second timeout, blocking writes.
    pub fn timeouts(&self) -> TimeoutDescriptor {
        TimeoutDescriptor::semi_blocking(1000).with_write(WriteMode::Blocking, 1000)
    }
}

/// Scan through a fresh registry so earlier tests leave no entries behind.
pub fn discover_available_ports() -> Vec<PortDescriptor> {
    PortRegistry::system().enumerate().unwrap_or_default()
}

pub fn discover_usb_ports() -> Vec<PortDescriptor> {
    discover_available_ports()
        .into_iter()
        .filter(|port| port.transport == Transport::Usb)
        .collect()
}

pub fn get_port_info(port_name: &str) -> Option<PortDescriptor> {
    discover_available_ports()
        .into_iter()
        .find(|port| port.path == port_name)
}

pub fn print_available_ports() {
    for port in discover_available_ports() {
        let ids = match (port.vendor_id, port.product_id) {
            (Some(vid), Some(pid)) => format!("{:04x}:{:04x}", vid, pid),
            _ => "-".to_string(),
        };
        println!(
            "  {} [{:?} {} at {}] {}",
            port.path, port.transport, ids, port.location, port.friendly_name
        );
    }
}

/// An open session on `TEST_PORT`.
pub struct PortTestFixture {
    pub session: PortSession,
    config: TestPortConfig,
}

impl PortTestFixture {
    /// `None` when no port is configured or it cannot be opened.
    pub fn setup() -> Option<Self> {
        let config = TestPortConfig::from_env()?;
        match PortSession::open(&config.port_name, config.line_config(), config.timeouts()) {
            Ok(session) => Some(Self { session, config }),
            Err(e) => {
                println!("Cannot open {}: {}", config.port_name, e);
                None
            }
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.config.loopback_enabled
    }

    pub fn port_name(&self) -> &str {
        &self.config.port_name
    }

    pub fn teardown(self) {
        self.session.close();
    }
}

/// Panics unless `actual` is within `tolerance` of `expected`.
pub fn assert_duration_within(
    actual: Duration,
    expected: Duration,
    tolerance: Duration,
    message: &str,
) {
    let range = expected.saturating_sub(tolerance)..=expected + tolerance;
    assert!(
        range.contains(&actual),
        "{}: {:?} outside {:?}",
        message,
        actual,
        range
    );
}
