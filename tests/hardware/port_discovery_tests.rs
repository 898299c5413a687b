//! Enumeration against whatever ports the host has.
//!
//! Ignored by default since a machine without serial devices makes them
//! vacuous.

use serial_transport::registry::Transport;
use serial_transport::PortRegistry;
use std::collections::HashSet;

use crate::hardware::utils::{
    discover_available_ports, discover_usb_ports, get_port_info, print_available_ports,
    TestPortConfig,
};

#[test]
#[ignore] // Requires hardware
fn test_port_discovery() {
    let ports = discover_available_ports();

    if ports.is_empty() {
        println!("No ports found, skipping");
        return;
    }

    print_available_ports();

    let paths: HashSet<_> = ports.iter().map(|p| p.path.clone()).collect();
    assert_eq!(paths.len(), ports.len(), "Paths should be unique");
    assert!(ports.iter().all(|p| p.enumerated));
}

#[test]
#[ignore] // Requires USB hardware
fn test_usb_port_discovery() {
    let usb_ports = discover_usb_ports();

    if usb_ports.is_empty() {
        println!("No USB ports found, skipping");
        return;
    }

    for port in &usb_ports {
        assert_eq!(port.transport, Transport::Usb);
        assert!(port.vendor_id.is_some(), "{} has no VID", port.path);
        println!(
            "  - {} {:04x}:{:04x} at {}",
            port.path,
            port.vendor_id.unwrap_or_default(),
            port.product_id.unwrap_or_default(),
            port.location
        );
    }
}

#[test]
#[ignore] // Requires hardware
fn test_enumeration_is_stable() {
    let registry = PortRegistry::system();

    let first = registry.enumerate().expect("First scan failed");
    let second = registry.enumerate().expect("Second scan failed");

    let identity = |ports: &[serial_transport::PortDescriptor]| {
        let mut ids: Vec<_> = ports
            .iter()
            .map(|p| (p.path.clone(), p.location.clone()))
            .collect();
        ids.sort();
        ids
    };
    assert_eq!(identity(&first), identity(&second));
}

#[test]
#[ignore] // Requires hardware
fn test_configured_port_is_listed() {
    let config = match TestPortConfig::from_env() {
        Some(c) => c,
        None => {
            println!("Skipping: TEST_PORT not set");
            return;
        }
    };

    let info = get_port_info(&config.port_name);

    assert!(
        info.is_some(),
        "TEST_PORT {} was not enumerated",
        config.port_name
    );
}
