//! In-memory serial hardware for tests and simulations.
//!
//! A [`MockBus`] holds simulated devices by path. Tests keep a [`MockLine`]
//! handle to play the remote end of a device: inject received bytes, inspect
//! what the host wrote, toggle modem lines, unplug the device or make the next
//! call fail. Sessions reach the same devices through the bus, which is a
//! [`DeviceOpener`] and a [`DeviceScanner`](crate::registry::DeviceScanner).
//!
//! # Example
//! ```
//! use serial_transport::port::MockBus;
//! use serial_transport::{PortSession, SerialConfiguration, TimeoutDescriptor};
//!
//! let bus = MockBus::new();
//! let line = bus.plug("/dev/ttyMOCK0");
//!
//! let session = PortSession::open_with(
//!     &bus,
//!     "/dev/ttyMOCK0",
//!     SerialConfiguration::new(115200),
//!     TimeoutDescriptor::semi_blocking(100),
//! )
//! .unwrap();
//!
//! line.inject(b"Hello");
//! assert_eq!(session.read(16).unwrap(), b"Hello");
//!
//! session.write(b"Response").unwrap();
//! assert_eq!(line.take_written(), b"Response");
//! ```

use super::device::{DeviceOpener, LineStatus, OutputLine, Queue, SerialDevice};
use super::timeout::EventMask;
use super::translate::WireSettings;
use crate::error::OpenError;
use crate::registry::{DeviceScanner, ScanError, ScannedDevice};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State of one simulated device.
#[derive(Debug)]
struct LineState {
    present: bool,
    claimed: bool,
    rx: VecDeque<u8>,
    written: Vec<u8>,
    /// Bytes written but not yet "transmitted" (cleared by drain).
    tx_pending: usize,
    /// Maximum bytes accepted per write call; `Some(0)` blocks writes.
    write_limit: Option<usize>,
    loopback: bool,
    settings: Option<WireSettings>,
    configure_count: usize,
    reject: Option<String>,
    lines_supported: bool,
    rts: bool,
    dtr: bool,
    cts: bool,
    dsr: bool,
    dcd: bool,
    ri: bool,
    break_active: bool,
    line_errors: EventMask,
    drained: Vec<usize>,
    fail_read: Option<io::ErrorKind>,
    fail_write: Option<io::ErrorKind>,
    fail_control: Option<io::ErrorKind>,
    usb: Option<(u16, u16, Option<String>)>,
    location: String,
}

impl LineState {
    fn new(location: String) -> Self {
        Self {
            present: true,
            claimed: false,
            rx: VecDeque::new(),
            written: Vec::new(),
            tx_pending: 0,
            write_limit: None,
            loopback: false,
            settings: None,
            configure_count: 0,
            reject: None,
            lines_supported: true,
            rts: false,
            dtr: false,
            cts: false,
            dsr: false,
            dcd: false,
            ri: false,
            break_active: false,
            line_errors: EventMask::empty(),
            drained: Vec::new(),
            fail_read: None,
            fail_write: None,
            fail_control: None,
            usb: None,
            location,
        }
    }
}

#[derive(Debug)]
struct LineShared {
    path: String,
    state: Mutex<LineState>,
    changed: Condvar,
}

impl LineShared {
    fn gone(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("{} was unplugged", self.path),
        )
    }
}

/// Test-side handle to a simulated device.
#[derive(Debug, Clone)]
pub struct MockLine {
    shared: Arc<LineShared>,
}

impl MockLine {
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// Bytes the device "received" from the remote end.
    pub fn inject(&self, data: &[u8]) {
        let mut state = self.shared.state.lock();
        state.rx.extend(data);
        self.shared.changed.notify_all();
    }

    /// Everything the host wrote so far.
    pub fn written(&self) -> Vec<u8> {
        self.shared.state.lock().written.clone()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.state.lock().written)
    }

    /// Bytes still counted as queued for transmission.
    pub fn tx_pending(&self) -> usize {
        self.shared.state.lock().tx_pending
    }

    /// Byte counts that were outstanding at each drain.
    pub fn drains(&self) -> Vec<usize> {
        self.shared.state.lock().drained.clone()
    }

    pub fn set_write_limit(&self, limit: Option<usize>) {
        let mut state = self.shared.state.lock();
        state.write_limit = limit;
        self.shared.changed.notify_all();
    }

    /// Echo written bytes back into the receive queue.
    pub fn set_loopback(&self, enabled: bool) {
        self.shared.state.lock().loopback = enabled;
    }

    /// Last settings a session programmed.
    pub fn settings(&self) -> Option<WireSettings> {
        self.shared.state.lock().settings
    }

    pub fn configure_count(&self) -> usize {
        self.shared.state.lock().configure_count
    }

    /// Make every following configure call fail with `reason`.
    pub fn reject_configuration(&self, reason: Option<&str>) {
        self.shared.state.lock().reject = reason.map(str::to_string);
    }

    /// Whether modem lines can be driven and sensed.
    pub fn set_lines_supported(&self, supported: bool) {
        self.shared.state.lock().lines_supported = supported;
    }

    pub fn set_cts(&self, level: bool) {
        self.shared.state.lock().cts = level;
    }

    pub fn set_dsr(&self, level: bool) {
        self.shared.state.lock().dsr = level;
    }

    pub fn set_dcd(&self, level: bool) {
        self.shared.state.lock().dcd = level;
    }

    pub fn set_ri(&self, level: bool) {
        self.shared.state.lock().ri = level;
    }

    pub fn rts(&self) -> bool {
        self.shared.state.lock().rts
    }

    pub fn dtr(&self) -> bool {
        self.shared.state.lock().dtr
    }

    pub fn break_active(&self) -> bool {
        self.shared.state.lock().break_active
    }

    /// Report receive errors on the next event poll.
    pub fn raise_line_errors(&self, errors: EventMask) {
        let mut state = self.shared.state.lock();
        state.line_errors |= errors & EventMask::LINE_ERRORS;
        self.shared.changed.notify_all();
    }

    pub fn fail_next_read(&self, kind: io::ErrorKind) {
        self.shared.state.lock().fail_read = Some(kind);
    }

    pub fn fail_next_write(&self, kind: io::ErrorKind) {
        self.shared.state.lock().fail_write = Some(kind);
    }

    pub fn fail_next_control(&self, kind: io::ErrorKind) {
        self.shared.state.lock().fail_control = Some(kind);
    }

    pub fn set_usb_ids(&self, vendor_id: u16, product_id: u16, serial: Option<&str>) {
        self.shared.state.lock().usb = Some((vendor_id, product_id, serial.map(str::to_string)));
    }

    pub fn set_location(&self, location: &str) {
        self.shared.state.lock().location = location.to_string();
    }

    /// Simulate removal. Open sessions see a disconnect on their next call.
    pub fn unplug(&self) {
        let mut state = self.shared.state.lock();
        state.present = false;
        self.shared.changed.notify_all();
    }

    pub fn is_present(&self) -> bool {
        self.shared.state.lock().present
    }

    /// Whether a session currently holds the device.
    pub fn is_claimed(&self) -> bool {
        self.shared.state.lock().claimed
    }
}

/// A collection of simulated devices.
#[derive(Debug, Clone, Default)]
pub struct MockBus {
    lines: Arc<Mutex<BTreeMap<String, MockLine>>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device at `path`, or re-attach a previously unplugged one.
    pub fn plug(&self, path: &str) -> MockLine {
        let mut lines = self.lines.lock();
        if let Some(line) = lines.get(path) {
            let mut state = line.shared.state.lock();
            if !state.present {
                *state = LineState::new(state.location.clone());
            }
            drop(state);
            return line.clone();
        }
        let line = MockLine {
            shared: Arc::new(LineShared {
                path: path.to_string(),
                state: Mutex::new(LineState::new(format!("1-{}", lines.len() + 1))),
                changed: Condvar::new(),
            }),
        };
        lines.insert(path.to_string(), line.clone());
        line
    }

    pub fn line(&self, path: &str) -> Option<MockLine> {
        self.lines.lock().get(path).cloned()
    }

    /// Unplug and forget the device at `path`.
    pub fn remove(&self, path: &str) {
        if let Some(line) = self.lines.lock().remove(path) {
            line.unplug();
        }
    }
}

impl DeviceOpener for MockBus {
    fn open(&self, path: &str) -> Result<Arc<dyn SerialDevice>, OpenError> {
        let line = self.line(path).ok_or_else(|| OpenError::not_found(path))?;
        let mut state = line.shared.state.lock();
        if !state.present {
            return Err(OpenError::not_found(path));
        }
        if state.claimed {
            return Err(OpenError::contention(path));
        }
        state.claimed = true;
        drop(state);
        Ok(Arc::new(MockDevice {
            shared: line.shared.clone(),
            released: AtomicBool::new(false),
        }))
    }
}

impl DeviceScanner for MockBus {
    fn scan(&self) -> Result<Vec<ScannedDevice>, ScanError> {
        let lines = self.lines.lock();
        let devices = lines
            .values()
            .filter_map(|line| {
                let state = line.shared.state.lock();
                if !state.present {
                    return None;
                }
                let mut device = ScannedDevice::new(line.path());
                device.location = state.location.clone();
                if let Some((vid, pid, serial)) = &state.usb {
                    device.vendor_id = Some(*vid);
                    device.product_id = Some(*pid);
                    device.serial_number = serial.clone();
                    device.product = Some("Mock USB Serial".to_string());
                }
                Some(device)
            })
            .collect();
        Ok(devices)
    }
}

/// Host-side view of a simulated device, handed to sessions.
#[derive(Debug)]
pub struct MockDevice {
    shared: Arc<LineShared>,
    released: AtomicBool,
}

impl MockDevice {
    fn wait_until<F>(&self, timeout: Duration, mut ready: F) -> io::Result<bool>
    where
        F: FnMut(&LineState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if !state.present {
                return Err(self.shared.gone());
            }
            if ready(&*state) {
                return Ok(true);
            }
            if self.released.load(Ordering::Acquire) {
                return Ok(false);
            }
            if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                return Ok(ready(&*state));
            }
        }
    }

    fn control(&self, state: &mut LineState, operation: &str) -> io::Result<()> {
        if let Some(kind) = state.fail_control.take() {
            return Err(io::Error::new(kind, format!("injected {} failure", operation)));
        }
        if !state.present {
            return Err(self.shared.gone());
        }
        if !state.lines_supported {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} is not available", operation),
            ));
        }
        Ok(())
    }
}

impl SerialDevice for MockDevice {
    fn configure(&self, settings: &WireSettings) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if !state.present {
            return Err(self.shared.gone());
        }
        if let Some(reason) = &state.reject {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, reason.clone()));
        }
        state.settings = Some(*settings);
        state.configure_count += 1;
        Ok(())
    }

    fn read_available(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        if let Some(kind) = state.fail_read.take() {
            return Err(io::Error::new(kind, "injected read failure"));
        }
        if !state.present {
            return Err(self.shared.gone());
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        self.wait_until(timeout, |state| !state.rx.is_empty())
    }

    fn write_available(&self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        if let Some(kind) = state.fail_write.take() {
            return Err(io::Error::new(kind, "injected write failure"));
        }
        if !state.present {
            return Err(self.shared.gone());
        }
        let n = state.write_limit.map_or(data.len(), |limit| limit.min(data.len()));
        state.written.extend_from_slice(&data[..n]);
        state.tx_pending += n;
        if state.loopback {
            state.rx.extend(&data[..n]);
            self.shared.changed.notify_all();
        }
        Ok(n)
    }

    fn wait_writable(&self, timeout: Duration) -> io::Result<bool> {
        self.wait_until(timeout, |state| state.write_limit != Some(0))
    }

    fn drain(&self) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if !state.present {
            return Err(self.shared.gone());
        }
        let pending = state.tx_pending;
        state.drained.push(pending);
        state.tx_pending = 0;
        Ok(())
    }

    fn discard(&self, queue: Queue) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        self.control(&mut state, "discard")?;
        if matches!(queue, Queue::Input | Queue::Both) {
            state.rx.clear();
        }
        if matches!(queue, Queue::Output | Queue::Both) {
            state.tx_pending = 0;
        }
        Ok(())
    }

    fn bytes_to_read(&self) -> io::Result<usize> {
        let state = self.shared.state.lock();
        if !state.present {
            return Err(self.shared.gone());
        }
        Ok(state.rx.len())
    }

    fn bytes_to_write(&self) -> io::Result<usize> {
        let state = self.shared.state.lock();
        if !state.present {
            return Err(self.shared.gone());
        }
        Ok(state.tx_pending)
    }

    fn set_line(&self, line: OutputLine, level: bool) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        self.control(&mut state, "set_line")?;
        match line {
            OutputLine::Rts => state.rts = level,
            OutputLine::Dtr => state.dtr = level,
        }
        Ok(())
    }

    fn line_status(&self) -> io::Result<LineStatus> {
        let mut state = self.shared.state.lock();
        self.control(&mut state, "line_status")?;
        Ok(LineStatus {
            cts: state.cts,
            dsr: state.dsr,
            dcd: state.dcd,
            ri: state.ri,
            rts: state.rts,
            dtr: state.dtr,
        })
    }

    fn set_break(&self, active: bool) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        self.control(&mut state, "set_break")?;
        state.break_active = active;
        Ok(())
    }

    fn take_line_errors(&self) -> io::Result<EventMask> {
        let mut state = self.shared.state.lock();
        Ok(std::mem::take(&mut state.line_errors))
    }

    fn interrupt(&self) {
        self.shared.changed.notify_all();
    }

    fn shutdown(&self) -> io::Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.shared.state.lock();
        state.claimed = false;
        state.rx.clear();
        self.shared.changed.notify_all();
        Ok(())
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_claims_device() {
        let bus = MockBus::new();
        let line = bus.plug("MOCK0");

        let device = bus.open("MOCK0").unwrap();

        assert!(line.is_claimed());
        assert!(matches!(bus.open("MOCK0"), Err(OpenError::LockContention { .. })));
        drop(device);
        assert!(!line.is_claimed());
    }

    #[test]
    fn test_open_missing_device() {
        let bus = MockBus::new();
        assert!(matches!(bus.open("MOCK9"), Err(OpenError::NotFound { .. })));
    }

    #[test]
    fn test_inject_and_read() {
        let bus = MockBus::new();
        let line = bus.plug("MOCK0");
        let device = bus.open("MOCK0").unwrap();
        line.inject(b"Hello, World!");

        let mut buffer = [0u8; 5];
        let n = device.read_available(&mut buffer).unwrap();

        assert_eq!(n, 5);
        assert_eq!(&buffer[..n], b"Hello");
        assert_eq!(device.bytes_to_read().unwrap(), 8);
    }

    #[test]
    fn test_write_logging_and_drain() {
        let bus = MockBus::new();
        let line = bus.plug("MOCK0");
        let device = bus.open("MOCK0").unwrap();

        device.write_available(b"Test1").unwrap();
        device.write_available(b"Test2").unwrap();
        assert_eq!(device.bytes_to_write().unwrap(), 10);
        device.drain().unwrap();

        assert_eq!(line.written(), b"Test1Test2");
        assert_eq!(line.drains(), vec![10]);
        assert_eq!(line.tx_pending(), 0);
    }

    #[test]
    fn test_wait_readable_times_out() {
        let bus = MockBus::new();
        bus.plug("MOCK0");
        let device = bus.open("MOCK0").unwrap();

        let ready = device.wait_readable(Duration::from_millis(20)).unwrap();

        assert!(!ready);
    }

    #[test]
    fn test_unplug_fails_io() {
        let bus = MockBus::new();
        let line = bus.plug("MOCK0");
        let device = bus.open("MOCK0").unwrap();

        line.unplug();

        let mut buffer = [0u8; 4];
        let err = device.read_available(&mut buffer).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(device.wait_readable(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_replug_resets_state() {
        let bus = MockBus::new();
        let line = bus.plug("MOCK0");
        line.inject(b"stale");
        line.unplug();

        let line = bus.plug("MOCK0");

        assert!(line.is_present());
        let device = bus.open("MOCK0").unwrap();
        assert_eq!(device.bytes_to_read().unwrap(), 0);
    }

    #[test]
    fn test_scan_lists_present_devices() {
        let bus = MockBus::new();
        bus.plug("MOCK0");
        let gone = bus.plug("MOCK1");
        gone.unplug();

        let devices = bus.scan().unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].path, "MOCK0");
    }
}
