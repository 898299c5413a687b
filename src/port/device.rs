//! Backend abstraction over a native serial handle.
//!
//! A [`SerialDevice`] exposes non-blocking primitives only. Blocking reads and
//! writes are built on top of them by the session, waiting in bounded ticks so
//! a concurrent close is always noticed.

use super::timeout::EventMask;
use super::translate::WireSettings;
use crate::error::OpenError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Output lines a session can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLine {
    Rts,
    Dtr,
}

/// Which queue to discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Input,
    Output,
    Both,
}

/// Snapshot of the modem lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineStatus {
    pub cts: bool,
    pub dsr: bool,
    pub dcd: bool,
    pub ri: bool,
    pub rts: bool,
    pub dtr: bool,
}

impl LineStatus {
    /// Input lines that differ from `previous`, as events.
    pub fn changes_since(&self, previous: &LineStatus) -> EventMask {
        let mut events = EventMask::empty();
        if self.cts != previous.cts {
            events |= EventMask::CTS;
        }
        if self.dsr != previous.dsr {
            events |= EventMask::DSR;
        }
        if self.dcd != previous.dcd {
            events |= EventMask::CARRIER_DETECT;
        }
        if self.ri != previous.ri {
            events |= EventMask::RING_INDICATOR;
        }
        events
    }
}

/// Non-blocking operations on one open device.
///
/// Implementations retry interrupted system calls internally. Any other error
/// is returned as-is; the session decides whether it is fatal.
pub trait SerialDevice: Send + Sync + fmt::Debug {
    /// Program line settings. Either all settings apply or the call fails.
    fn configure(&self, settings: &WireSettings) -> io::Result<()>;

    /// Copy whatever is already received into `buf`. Returns 0 when nothing
    /// is pending.
    fn read_available(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Wait up to `timeout` for received data. `Ok(false)` on timeout or
    /// interruption.
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool>;

    /// Queue as much of `data` as fits without waiting.
    fn write_available(&self, data: &[u8]) -> io::Result<usize>;

    /// Wait up to `timeout` for room in the transmit queue.
    fn wait_writable(&self, timeout: Duration) -> io::Result<bool>;

    /// Block until the transmit queue is empty.
    fn drain(&self) -> io::Result<()>;

    fn discard(&self, queue: Queue) -> io::Result<()>;

    fn bytes_to_read(&self) -> io::Result<usize>;

    fn bytes_to_write(&self) -> io::Result<usize>;

    fn set_line(&self, line: OutputLine, level: bool) -> io::Result<()>;

    fn line_status(&self) -> io::Result<LineStatus>;

    fn set_break(&self, active: bool) -> io::Result<()>;

    /// Receive-side errors seen since the last call.
    fn take_line_errors(&self) -> io::Result<EventMask> {
        Ok(EventMask::empty())
    }

    /// Wake any thread parked in `wait_readable` or `wait_writable`.
    fn interrupt(&self) {}

    /// Release exclusivity and flush pending output. The handle itself is
    /// released when the device is dropped.
    fn shutdown(&self) -> io::Result<()>;
}

/// Acquires exclusive handles on device paths.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, path: &str) -> Result<Arc<dyn SerialDevice>, OpenError>;
}

/// The native backend for the current platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemOpener;

impl DeviceOpener for SystemOpener {
    #[cfg(unix)]
    fn open(&self, path: &str) -> Result<Arc<dyn SerialDevice>, OpenError> {
        let device = super::posix::PosixDevice::open(path)?;
        Ok(Arc::new(device))
    }

    #[cfg(not(unix))]
    fn open(&self, path: &str) -> Result<Arc<dyn SerialDevice>, OpenError> {
        let device = super::portable::PortableDevice::open(path)?;
        Ok(Arc::new(device))
    }
}
