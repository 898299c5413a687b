//! Known serial devices and the sessions open on them.
//!
//! The registry keeps one [`PortDescriptor`] per device path across
//! enumeration passes, so callers holding a path see the same entry between
//! scans. Entries with an open session are never pruned; closed entries that
//! a scan no longer reports are dropped.

use crate::error::OpenError;
pub use crate::error::ScanError;
use crate::port::{DeviceOpener, SerialConfiguration, SystemOpener, TimeoutDescriptor};
use crate::session::{PortSession, SessionInner};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

// ============================================================================
// Types
// ============================================================================

/// How a device is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Usb,
    Bluetooth,
    Pci,
    #[default]
    Unknown,
}

/// One device as reported by a scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub path: String,
    /// Bus and port fingerprint, e.g. `"1-2.4"`; `"0-0"` when unknown.
    pub location: String,
    pub transport: Transport,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl ScannedDevice {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            location: UNKNOWN_LOCATION.to_string(),
            transport: Transport::Unknown,
            vendor_id: None,
            product_id: None,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }
}

const UNKNOWN_LOCATION: &str = "0-0";

/// A device known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortDescriptor {
    pub path: String,
    pub friendly_name: String,
    pub description: String,
    pub location: String,
    pub transport: Transport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// Seen by the most recent scan, or held open.
    pub enumerated: bool,
}

/// Human-readable naming for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub friendly_name: String,
    pub description: String,
}

// ============================================================================
// Collaborators
// ============================================================================

/// Lists the devices currently attached.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceScanner: Send + Sync {
    fn scan(&self) -> Result<Vec<ScannedDevice>, ScanError>;
}

/// Produces display names for devices. The output is opaque to the registry.
pub trait DeviceDescriber: Send + Sync {
    fn describe(&self, device: &ScannedDevice) -> DeviceDescription;
}

/// Names devices from their USB strings, falling back to the path.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDescriber;

impl DeviceDescriber for DefaultDescriber {
    fn describe(&self, device: &ScannedDevice) -> DeviceDescription {
        let base_name = Path::new(&device.path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&device.path)
            .to_string();

        let friendly_name = match &device.product {
            Some(product) => format!("{} ({})", product, base_name),
            None => base_name,
        };
        let description = match (&device.manufacturer, &device.product) {
            (Some(vendor), Some(product)) => format!("{} {}", vendor, product),
            (None, Some(product)) => product.clone(),
            (Some(vendor), None) => format!("{} serial device", vendor),
            (None, None) => match device.transport {
                Transport::Usb => "USB serial device".to_string(),
                Transport::Bluetooth => "Bluetooth serial port".to_string(),
                Transport::Pci => "PCI serial port".to_string(),
                Transport::Unknown => "Serial port".to_string(),
            },
        };
        DeviceDescription {
            friendly_name,
            description,
        }
    }
}

/// Enumerates devices through `serialport::available_ports`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemScanner;

impl DeviceScanner for SystemScanner {
    fn scan(&self) -> Result<Vec<ScannedDevice>, ScanError> {
        use serialport::SerialPortType;

        let ports = serialport::available_ports()?;
        let devices = ports
            .into_iter()
            .map(|port| {
                let mut device = ScannedDevice::new(port.port_name);
                match port.port_type {
                    SerialPortType::UsbPort(info) => {
                        device.transport = Transport::Usb;
                        device.vendor_id = Some(info.vid);
                        device.product_id = Some(info.pid);
                        device.serial_number = info.serial_number;
                        device.manufacturer = info.manufacturer;
                        device.product = info.product;
                    }
                    SerialPortType::BluetoothPort => device.transport = Transport::Bluetooth,
                    SerialPortType::PciPort => device.transport = Transport::Pci,
                    SerialPortType::Unknown => {}
                }
                if let Some(location) = location_of(&device.path) {
                    device.location = location;
                }
                device
            })
            .collect();
        Ok(devices)
    }
}

/// `busnum-devpath` of the USB device behind a tty, from sysfs.
#[cfg(target_os = "linux")]
fn location_of(path: &str) -> Option<String> {
    let name = Path::new(path).file_name()?;
    let device = Path::new("/sys/class/tty").join(name).join("device");
    let device = std::fs::canonicalize(device).ok()?;
    device.ancestors().find_map(|dir| {
        let bus = std::fs::read_to_string(dir.join("busnum")).ok()?;
        let devpath = std::fs::read_to_string(dir.join("devpath")).ok()?;
        Some(format!("{}-{}", bus.trim(), devpath.trim()))
    })
}

#[cfg(not(target_os = "linux"))]
fn location_of(_path: &str) -> Option<String> {
    None
}

// ============================================================================
// Registry
// ============================================================================

struct Entry {
    descriptor: PortDescriptor,
    session: Weak<SessionInner>,
}

impl Entry {
    fn new(device: &ScannedDevice, describer: &dyn DeviceDescriber) -> Self {
        let mut entry = Self {
            descriptor: PortDescriptor {
                path: device.path.clone(),
                friendly_name: String::new(),
                description: String::new(),
                location: String::new(),
                transport: Transport::Unknown,
                vendor_id: None,
                product_id: None,
                serial_number: None,
                manufacturer: None,
                enumerated: false,
            },
            session: Weak::new(),
        };
        entry.refresh(device, describer);
        entry
    }

    fn refresh(&mut self, device: &ScannedDevice, describer: &dyn DeviceDescriber) {
        let naming = describer.describe(device);
        let d = &mut self.descriptor;
        d.friendly_name = naming.friendly_name;
        d.description = naming.description;
        d.location = device.location.clone();
        d.transport = device.transport;
        d.vendor_id = device.vendor_id;
        d.product_id = device.product_id;
        d.serial_number = device.serial_number.clone();
        d.manufacturer = device.manufacturer.clone();
    }

    fn is_open(&self) -> bool {
        self.session
            .upgrade()
            .is_some_and(|session| session.is_open())
    }
}

/// Tracks device paths and opens sessions on them.
pub struct PortRegistry {
    scanner: Box<dyn DeviceScanner>,
    describer: Box<dyn DeviceDescriber>,
    opener: Arc<dyn DeviceOpener>,
    entries: Mutex<Vec<Entry>>,
    aliases: HashMap<String, String>,
    excluded: Vec<String>,
}

static GLOBAL: Lazy<PortRegistry> = Lazy::new(PortRegistry::system);

impl PortRegistry {
    pub fn new(
        scanner: impl DeviceScanner + 'static,
        opener: impl DeviceOpener + 'static,
    ) -> Self {
        Self {
            scanner: Box::new(scanner),
            describer: Box::new(DefaultDescriber),
            opener: Arc::new(opener),
            entries: Mutex::new(Vec::new()),
            aliases: HashMap::new(),
            excluded: Vec::new(),
        }
    }

    /// Registry over the platform's scanner and native backend.
    pub fn system() -> Self {
        Self::new(SystemScanner, SystemOpener)
    }

    /// Process-wide registry over the system backend.
    pub fn global() -> &'static PortRegistry {
        &GLOBAL
    }

    pub fn with_describer(mut self, describer: impl DeviceDescriber + 'static) -> Self {
        self.describer = Box::new(describer);
        self
    }

    /// Friendly names that resolve to device paths before any lookup.
    pub fn with_aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.aliases = aliases;
        self
    }

    /// Paths that enumeration ignores.
    pub fn with_excluded(mut self, excluded: Vec<String>) -> Self {
        self.excluded = excluded;
        self
    }

    /// Resolve an alias to its device path.
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Scan for devices and merge the results.
    ///
    /// Existing entries are refreshed in place. Entries neither seen by this
    /// scan nor held open are removed. If the scan itself fails the registry
    /// is left untouched.
    pub fn enumerate(&self) -> Result<Vec<PortDescriptor>, ScanError> {
        let scanned = self.scanner.scan()?;
        let mut entries = self.entries.lock();

        for entry in entries.iter_mut() {
            entry.descriptor.enumerated = entry.is_open();
        }
        for device in scanned
            .iter()
            .filter(|device| !self.excluded.contains(&device.path))
        {
            self.merge(&mut entries, device);
        }
        entries.retain(|entry| {
            if !entry.descriptor.enumerated {
                debug!("Dropping vanished port {}", entry.descriptor.path);
            }
            entry.descriptor.enumerated
        });

        info!("Enumerated {} serial port(s)", entries.len());
        Ok(entries.iter().map(|entry| entry.descriptor.clone()).collect())
    }

    fn merge(&self, entries: &mut Vec<Entry>, device: &ScannedDevice) -> PortDescriptor {
        let describer = self.describer.as_ref();
        let entry = match entries
            .iter()
            .position(|entry| entry.descriptor.path == device.path)
        {
            Some(index) => {
                entries[index].refresh(device, describer);
                &mut entries[index]
            }
            None => {
                debug!("New port {} at {}", device.path, device.location);
                entries.push(Entry::new(device, describer));
                let last = entries.len() - 1;
                &mut entries[last]
            }
        };
        entry.descriptor.enumerated = true;
        entry.descriptor.clone()
    }

    /// Descriptor for `path` (or an alias of it).
    pub fn fetch(&self, path: &str) -> Option<PortDescriptor> {
        let path = self.resolve(path);
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.descriptor.path == path)
            .map(|entry| entry.descriptor.clone())
    }

    /// Insert or refresh one device, marking it as seen.
    pub fn upsert(&self, device: &ScannedDevice) -> PortDescriptor {
        let mut entries = self.entries.lock();
        self.merge(&mut entries, device)
    }

    /// Forget `path`. An open session on it keeps working.
    pub fn remove(&self, path: &str) -> Option<PortDescriptor> {
        let path = self.resolve(path);
        let mut entries = self.entries.lock();
        let index = entries
            .iter()
            .position(|entry| entry.descriptor.path == path)?;
        Some(entries.remove(index).descriptor)
    }

    pub fn descriptors(&self) -> Vec<PortDescriptor> {
        self.entries
            .lock()
            .iter()
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    /// Whether a live session holds `path`.
    pub fn is_open(&self, path: &str) -> bool {
        let path = self.resolve(path);
        self.entries
            .lock()
            .iter()
            .any(|entry| entry.descriptor.path == path && entry.is_open())
    }

    /// Open a session on `path`, registering the path if it is unknown.
    ///
    /// A second open of a path that already has a live session from this
    /// registry fails with [`OpenError::LockContention`]. On any failure the
    /// entry stays registered and unopened.
    pub fn open(
        &self,
        path: &str,
        configuration: SerialConfiguration,
        timeouts: TimeoutDescriptor,
    ) -> Result<PortSession, OpenError> {
        let path = self.resolve(path);
        let mut entries = self.entries.lock();
        let index = match entries
            .iter()
            .position(|entry| entry.descriptor.path == path)
        {
            Some(index) => index,
            None => {
                entries.push(Entry::new(&ScannedDevice::new(path), self.describer.as_ref()));
                entries.len() - 1
            }
        };
        if entries[index].is_open() {
            return Err(OpenError::contention(path));
        }

        let session = PortSession::open_with(self.opener.as_ref(), path, configuration, timeouts)?;
        entries[index].session = session.downgrade();
        entries[index].descriptor.enumerated = true;
        Ok(session)
    }
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRegistry")
            .field("entries", &self.entries.lock().len())
            .field("aliases", &self.aliases)
            .field("excluded", &self.excluded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MockBus;
    use pretty_assertions::assert_eq;

    fn device(path: &str) -> ScannedDevice {
        ScannedDevice::new(path)
    }

    /// Scanner that returns `passes[n]` on the n-th call, repeating the last.
    fn scripted(passes: Vec<Vec<ScannedDevice>>) -> MockDeviceScanner {
        let mut scanner = MockDeviceScanner::new();
        let mut call = 0;
        scanner.expect_scan().returning(move || {
            let pass = passes[call.min(passes.len() - 1)].clone();
            call += 1;
            Ok(pass)
        });
        scanner
    }

    fn paths(descriptors: &[PortDescriptor]) -> Vec<&str> {
        descriptors.iter().map(|d| d.path.as_str()).collect()
    }

    #[test]
    fn test_enumerate_inserts_and_prunes() {
        let scanner = scripted(vec![
            vec![device("/dev/ttyA"), device("/dev/ttyB")],
            vec![device("/dev/ttyB")],
        ]);
        let registry = PortRegistry::new(scanner, MockBus::new());

        let first = registry.enumerate().unwrap();
        let second = registry.enumerate().unwrap();

        assert_eq!(paths(&first), vec!["/dev/ttyA", "/dev/ttyB"]);
        assert_eq!(paths(&second), vec!["/dev/ttyB"]);
        assert!(registry.fetch("/dev/ttyA").is_none());
    }

    #[test]
    fn test_enumerate_refreshes_metadata_in_place() {
        let mut usb = device("/dev/ttyA");
        usb.vendor_id = Some(0x0403);
        usb.product = Some("FT232R".to_string());
        let scanner = scripted(vec![vec![device("/dev/ttyA")], vec![usb]]);
        let registry = PortRegistry::new(scanner, MockBus::new());

        registry.enumerate().unwrap();
        registry.enumerate().unwrap();
        let descriptor = registry.fetch("/dev/ttyA").unwrap();

        assert_eq!(registry.descriptors().len(), 1);
        assert_eq!(descriptor.vendor_id, Some(0x0403));
        assert_eq!(descriptor.friendly_name, "FT232R (ttyA)");
    }

    #[test]
    fn test_open_entry_survives_missed_scan() {
        let bus = MockBus::new();
        bus.plug("MOCK0");
        let scanner = scripted(vec![vec![device("MOCK0")], vec![]]);
        let registry = PortRegistry::new(scanner, bus);

        registry.enumerate().unwrap();
        let session = registry
            .open("MOCK0", SerialConfiguration::default(), TimeoutDescriptor::nonblocking())
            .unwrap();
        let after = registry.enumerate().unwrap();

        assert_eq!(paths(&after), vec!["MOCK0"]);
        assert!(after[0].enumerated);

        session.close();
        assert!(registry.enumerate().unwrap().is_empty());
    }

    #[test]
    fn test_second_open_is_contention() {
        let bus = MockBus::new();
        bus.plug("MOCK0");
        let registry = PortRegistry::new(scripted(vec![vec![]]), bus);
        let config = SerialConfiguration::default();

        let _session = registry
            .open("MOCK0", config, TimeoutDescriptor::nonblocking())
            .unwrap();
        let second = registry.open("MOCK0", config, TimeoutDescriptor::nonblocking());

        assert!(matches!(second, Err(OpenError::LockContention { .. })));
        assert!(registry.is_open("MOCK0"));
    }

    #[test]
    fn test_reopen_after_drop() {
        let bus = MockBus::new();
        bus.plug("MOCK0");
        let registry = PortRegistry::new(scripted(vec![vec![]]), bus);
        let config = SerialConfiguration::default();

        let session = registry
            .open("MOCK0", config, TimeoutDescriptor::nonblocking())
            .unwrap();
        drop(session);

        assert!(!registry.is_open("MOCK0"));
        assert!(registry
            .open("MOCK0", config, TimeoutDescriptor::nonblocking())
            .is_ok());
    }

    #[test]
    fn test_failed_open_leaves_entry_registered() {
        let registry = PortRegistry::new(scripted(vec![vec![]]), MockBus::new());

        let result = registry.open(
            "/dev/ttyGONE",
            SerialConfiguration::default(),
            TimeoutDescriptor::nonblocking(),
        );

        assert!(matches!(result, Err(OpenError::NotFound { .. })));
        let descriptor = registry.fetch("/dev/ttyGONE").unwrap();
        assert!(!descriptor.enumerated);
        assert!(!registry.is_open("/dev/ttyGONE"));
    }

    #[test]
    fn test_aliases_and_exclusions() {
        let bus = MockBus::new();
        bus.plug("MOCK0");
        let scanner = scripted(vec![vec![device("MOCK0"), device("MOCK1")]]);
        let registry = PortRegistry::new(scanner, bus)
            .with_aliases(HashMap::from([("modem".to_string(), "MOCK0".to_string())]))
            .with_excluded(vec!["MOCK1".to_string()]);

        let listed = registry.enumerate().unwrap();
        let session = registry
            .open("modem", SerialConfiguration::default(), TimeoutDescriptor::nonblocking())
            .unwrap();

        assert_eq!(paths(&listed), vec!["MOCK0"]);
        assert_eq!(session.path(), "MOCK0");
        assert!(registry.is_open("modem"));
    }

    #[test]
    fn test_scan_failure_leaves_registry_untouched() {
        let mut scanner = MockDeviceScanner::new();
        let mut call = 0;
        scanner.expect_scan().returning(move || {
            call += 1;
            if call == 1 {
                Ok(vec![ScannedDevice::new("/dev/ttyA")])
            } else {
                Err(ScanError::Io(std::io::Error::other("sysfs unavailable")))
            }
        });
        let registry = PortRegistry::new(scanner, MockBus::new());

        registry.enumerate().unwrap();
        assert!(registry.enumerate().is_err());

        assert_eq!(registry.descriptors().len(), 1);
    }

    #[test]
    fn test_upsert_and_remove() {
        let registry = PortRegistry::new(scripted(vec![vec![]]), MockBus::new());

        let descriptor = registry.upsert(&device("/dev/ttyS0"));
        assert!(descriptor.enumerated);
        assert_eq!(descriptor.description, "Serial port");

        let removed = registry.remove("/dev/ttyS0").unwrap();
        assert_eq!(removed.path, "/dev/ttyS0");
        assert!(registry.descriptors().is_empty());
    }

    #[test]
    fn test_default_describer_uses_usb_strings() {
        let mut usb = device("/dev/ttyUSB0");
        usb.transport = Transport::Usb;
        usb.manufacturer = Some("FTDI".to_string());
        usb.product = Some("FT232R USB UART".to_string());

        let naming = DefaultDescriber.describe(&usb);

        assert_eq!(naming.friendly_name, "FT232R USB UART (ttyUSB0)");
        assert_eq!(naming.description, "FTDI FT232R USB UART");
    }
}
