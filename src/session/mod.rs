//! Open sessions on a serial device.
//!
//! A [`PortSession`] owns one device handle from open to close. It applies the
//! line configuration, turns the timeout policy into blocking reads and writes
//! on top of the backend's non-blocking primitives, and keeps the last error.
//!
//! Reads and writes run on separate locks, so one thread may read while
//! another writes. Configuration changes and close serialize on a transition
//! lock that is never held across blocking I/O. Blocking waits are split into
//! ticks of at most [`IO_TICK`], so a close from another thread is noticed
//! within one tick.
//!
//! A read or write that fails with anything other than an interruption is
//! fatal: the session closes itself and reports [`IoError::DeviceLost`].
//! Control-line failures are reported but never close the session.

mod events;
mod modem;

pub use events::{EventWaiter, DEFAULT_EVENT_TICK};

use crate::error::{ControlError, ErrorSite, ErrorState, IoError, OpenError};
use crate::port::{
    translate, BlockingBehavior, DeviceOpener, EventMask, Queue, ReadBehavior, ReadMode,
    SerialConfiguration, SerialDevice, SystemOpener, TimeoutDescriptor, TimeoutPolicy,
    WriteAccept, WriteMode,
};
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest single wait inside a blocking read or write.
pub const IO_TICK: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct SessionState {
    configuration: SerialConfiguration,
    timeouts: TimeoutDescriptor,
    behavior: BlockingBehavior,
    error: ErrorState,
}

pub(crate) struct SessionInner {
    path: String,
    device: RwLock<Option<Arc<dyn SerialDevice>>>,
    open: AtomicBool,
    faulted: AtomicBool,
    listening: AtomicBool,
    /// Events produced by this side (DATA_WRITTEN) not yet reported.
    pending: AtomicU32,
    state: Mutex<SessionState>,
    transition: Mutex<()>,
    /// Reusable read buffer; holding it serializes readers.
    read_buffer: Mutex<Vec<u8>>,
    write_lock: Mutex<()>,
}

impl SessionInner {
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(device) = self.device.get_mut().take() {
            if let Err(e) = device.shutdown() {
                debug!("{}: release on drop failed: {}", self.path, e);
            }
        }
    }
}

/// Why a read or write loop stopped early.
enum Failure {
    Device { transferred: usize, source: io::Error },
    Closed { transferred: usize },
}

/// An open serial device.
///
/// Cloning a session yields another handle to the same device; the device is
/// released by [`close`](Self::close) or when the last handle is dropped.
#[derive(Clone)]
pub struct PortSession {
    inner: Arc<SessionInner>,
}

impl PortSession {
    /// Open `path` with the platform's native backend.
    ///
    /// # Example
    /// ```no_run
    /// use serial_transport::{PortSession, SerialConfiguration, TimeoutDescriptor};
    ///
    /// let session = PortSession::open(
    ///     "/dev/ttyUSB0",
    ///     SerialConfiguration::new(115200),
    ///     TimeoutDescriptor::blocking(500),
    /// )?;
    /// session.write(b"AT\r\n")?;
    /// let reply = session.read(64)?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn open(
        path: &str,
        configuration: SerialConfiguration,
        timeouts: TimeoutDescriptor,
    ) -> Result<Self, OpenError> {
        Self::open_with(&SystemOpener, path, configuration, timeouts)
    }

    /// Open `path` through a specific backend.
    ///
    /// The handle is acquired and locked, the configuration applied and the
    /// timeouts installed; if any step fails the handle is released again.
    pub fn open_with(
        opener: &dyn DeviceOpener,
        path: &str,
        configuration: SerialConfiguration,
        timeouts: TimeoutDescriptor,
    ) -> Result<Self, OpenError> {
        configuration
            .validate()
            .map_err(|e| OpenError::rejected(path, e.to_string()))?;

        let device = opener.open(path)?;
        if let Err(e) = device.configure(&translate(&configuration)) {
            if let Err(release) = device.shutdown() {
                debug!("{}: release after failed configure: {}", path, release);
            }
            warn!("{}: configuration rejected: {}", path, e);
            return Err(match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::BrokenPipe => OpenError::not_found(path),
                _ => OpenError::rejected(path, e.to_string()),
            });
        }

        info!(
            "Opened {} at {} baud ({:?} reads)",
            path, configuration.baud_rate, timeouts.read_mode
        );
        Ok(Self {
            inner: Arc::new(SessionInner {
                path: path.to_string(),
                device: RwLock::new(Some(device)),
                open: AtomicBool::new(true),
                faulted: AtomicBool::new(false),
                listening: AtomicBool::new(false),
                pending: AtomicU32::new(0),
                state: Mutex::new(SessionState {
                    configuration,
                    behavior: TimeoutPolicy::resolve(&timeouts),
                    timeouts,
                    error: ErrorState::CLEAR,
                }),
                transition: Mutex::new(()),
                read_buffer: Mutex::new(Vec::new()),
                write_lock: Mutex::new(()),
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Whether the session was closed by a fatal device error.
    pub fn is_faulted(&self) -> bool {
        self.inner.faulted.load(Ordering::Acquire)
    }

    pub fn configuration(&self) -> SerialConfiguration {
        self.inner.state.lock().configuration
    }

    pub fn timeouts(&self) -> TimeoutDescriptor {
        self.inner.state.lock().timeouts
    }

    /// Last recorded failure.
    pub fn last_error(&self) -> ErrorState {
        self.inner.state.lock().error
    }

    // ========== Configuration ==========

    /// Replace the line configuration as a whole.
    ///
    /// On failure the previous configuration stays in effect and the session
    /// remains open.
    pub fn configure(&self, configuration: SerialConfiguration) -> Result<(), IoError> {
        configuration
            .validate()
            .map_err(|e| IoError::Rejected(e.to_string()))?;

        let _transition = self.inner.transition.lock();
        let device = self.device()?;
        device.configure(&translate(&configuration)).map_err(|e| {
            self.record(ErrorSite::Configure, &e);
            warn!("{}: configuration rejected: {}", self.inner.path, e);
            IoError::Rejected(e.to_string())
        })?;

        self.inner.state.lock().configuration = configuration;
        info!(
            "{}: reconfigured to {} baud",
            self.inner.path, configuration.baud_rate
        );
        Ok(())
    }

    /// Install new timeouts. Takes effect for the next read or write call.
    pub fn set_timeouts(&self, timeouts: TimeoutDescriptor) -> Result<(), IoError> {
        let _transition = self.inner.transition.lock();
        if !self.is_open() {
            return Err(self.closed_error());
        }
        let mut state = self.inner.state.lock();
        state.behavior = TimeoutPolicy::resolve(&timeouts);
        state.timeouts = timeouts;
        debug!("{}: timeouts now {:?}", self.inner.path, timeouts);
        Ok(())
    }

    /// Change only the monitored event mask.
    pub fn set_monitored_events(&self, events: EventMask) -> Result<(), IoError> {
        let timeouts = self.timeouts().with_events(events);
        self.set_timeouts(timeouts)
    }

    // ========== Reading ==========

    /// Read up to `max` bytes according to the current timeout mode.
    ///
    /// The bytes go through the session's reusable buffer, which grows to
    /// the largest request seen and is never shrunk.
    pub fn read(&self, max: usize) -> Result<Vec<u8>, IoError> {
        let mut buffer = self.inner.read_buffer.lock();
        if buffer.len() < max {
            buffer.resize(max, 0);
        }
        let device = self.device()?;
        let behavior = self.inner.state.lock().behavior.read;

        match self.fill(device.as_ref(), &mut buffer[..max], behavior) {
            Ok(n) => Ok(buffer[..n].to_vec()),
            Err(Failure::Closed { transferred }) if transferred > 0 => {
                Ok(buffer[..transferred].to_vec())
            }
            Err(Failure::Closed { .. }) => Err(self.closed_error()),
            Err(Failure::Device {
                transferred,
                source,
            }) => {
                let partial = buffer[..transferred].to_vec();
                let err = self.fail(ErrorSite::Read, source, transferred);
                Err(match err {
                    IoError::DeviceLost {
                        transferred,
                        source,
                        ..
                    } => IoError::DeviceLost {
                        transferred,
                        partial,
                        source,
                    },
                    other => other,
                })
            }
        }
    }

    /// Read into `buf` according to the current timeout mode.
    ///
    /// Returns the number of bytes read; fewer than requested when a timeout
    /// elapsed.
    pub fn read_bytes(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        let _reader = self.inner.read_buffer.lock();
        let device = self.device()?;
        let behavior = self.inner.state.lock().behavior.read;

        match self.fill(device.as_ref(), buf, behavior) {
            Ok(n) => Ok(n),
            Err(Failure::Closed { transferred }) if transferred > 0 => Ok(transferred),
            Err(Failure::Closed { .. }) => Err(self.closed_error()),
            Err(Failure::Device {
                transferred,
                source,
            }) => Err(self.fail(ErrorSite::Read, source, transferred)),
        }
    }

    fn fill(
        &self,
        device: &dyn SerialDevice,
        buf: &mut [u8],
        behavior: ReadBehavior,
    ) -> Result<usize, Failure> {
        if buf.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let mut deadline = match behavior {
            ReadBehavior::AtLeastOne { timeout } | ReadBehavior::Fill { timeout } => {
                timeout.map(|t| started + t)
            }
            ReadBehavior::Immediate | ReadBehavior::Scanner { .. } => None,
        };
        let mut filled = 0;

        loop {
            // An interrupted transfer or wait is retried, never a lost device.
            let n = match device.read_available(&mut buf[filled..]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(Failure::Device {
                        transferred: filled,
                        source,
                    })
                }
            };
            filled += n;
            if filled == buf.len() {
                return Ok(filled);
            }

            match behavior {
                ReadBehavior::Immediate => return Ok(filled),
                ReadBehavior::AtLeastOne { .. } if filled > 0 => return Ok(filled),
                ReadBehavior::Scanner { inter_byte } if n > 0 => {
                    deadline = Some(Instant::now() + inter_byte);
                }
                _ => {}
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(filled);
                    }
                    (deadline - now).min(IO_TICK)
                }
                None => IO_TICK,
            };
            match device.wait_readable(wait) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => {
                    return Err(Failure::Device {
                        transferred: filled,
                        source,
                    })
                }
            }
            if !self.is_open() {
                return Err(Failure::Closed {
                    transferred: filled,
                });
            }
        }
    }

    // ========== Writing ==========

    /// Write `data` according to the current write mode.
    ///
    /// Returns how many bytes were accepted. In blocking write mode the call
    /// then waits until those bytes have left the transmitter.
    pub fn write(&self, data: &[u8]) -> Result<usize, IoError> {
        let _writer = self.inner.write_lock.lock();
        let device = self.device()?;
        let behavior = self.inner.state.lock().behavior.write;

        let written = match self.push(device.as_ref(), data, behavior.accept) {
            Ok(n) => n,
            Err(Failure::Closed { transferred }) if transferred > 0 => return Ok(transferred),
            Err(Failure::Closed { .. }) => return Err(self.closed_error()),
            Err(Failure::Device {
                transferred,
                source,
            }) => return Err(self.fail(ErrorSite::Write, source, transferred)),
        };

        if written > 0 {
            if behavior.drain_after {
                device
                    .drain()
                    .map_err(|e| self.fail(ErrorSite::Drain, e, written))?;
            }
            self.inner
                .pending
                .fetch_or(EventMask::DATA_WRITTEN.bits(), Ordering::AcqRel);
        }
        Ok(written)
    }

    fn push(
        &self,
        device: &dyn SerialDevice,
        data: &[u8],
        accept: WriteAccept,
    ) -> Result<usize, Failure> {
        if data.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let deadline = match accept {
            WriteAccept::AtLeastOne { timeout } | WriteAccept::All { timeout } => {
                timeout.map(|t| started + t)
            }
            WriteAccept::Immediate => None,
        };
        let mut written = 0;

        loop {
            written += match device.write_available(&data[written..]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(Failure::Device {
                        transferred: written,
                        source,
                    })
                }
            };
            if written == data.len() {
                return Ok(written);
            }
            match accept {
                WriteAccept::Immediate => return Ok(written),
                WriteAccept::AtLeastOne { .. } if written > 0 => return Ok(written),
                _ => {}
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(written);
                    }
                    (deadline - now).min(IO_TICK)
                }
                None => IO_TICK,
            };
            match device.wait_writable(wait) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => {
                    return Err(Failure::Device {
                        transferred: written,
                        source,
                    })
                }
            }
            if !self.is_open() {
                return Err(Failure::Closed {
                    transferred: written,
                });
            }
        }
    }

    /// Wait until everything queued has been transmitted.
    pub fn drain(&self) -> Result<(), IoError> {
        let _writer = self.inner.write_lock.lock();
        let device = self.device()?;
        device
            .drain()
            .map_err(|e| self.fail(ErrorSite::Drain, e, 0))
    }

    // ========== Buffers ==========

    /// Bytes waiting in the receive queue, or -1 if the session is closed or
    /// the query failed.
    pub fn bytes_available(&self) -> i32 {
        self.query(|device| device.bytes_to_read())
    }

    /// Bytes still queued for transmission, or -1 if the session is closed or
    /// the query failed.
    pub fn bytes_awaiting_write(&self) -> i32 {
        self.query(|device| device.bytes_to_write())
    }

    fn query<F>(&self, op: F) -> i32
    where
        F: FnOnce(&dyn SerialDevice) -> io::Result<usize>,
    {
        let Ok(device) = self.device() else {
            return -1;
        };
        match op(device.as_ref()) {
            Ok(n) => i32::try_from(n).unwrap_or(i32::MAX),
            Err(e) => {
                self.record(ErrorSite::Query, &e);
                -1
            }
        }
    }

    /// Discard everything pending in both directions.
    pub fn flush_buffers(&self) -> Result<(), ControlError> {
        let device = self.control_device()?;
        device.discard(Queue::Both).map_err(|e| {
            self.record(ErrorSite::Flush, &e);
            ControlError::from_io("flush_buffers", e)
        })
    }

    // ========== Lifecycle ==========

    /// Close the session. Blocked readers and writers return within one
    /// tick. Closing an already closed session does nothing.
    pub fn close(&self) {
        let _transition = self.inner.transition.lock();
        if self.release() {
            info!("Closed {}", self.inner.path);
        }
    }

    /// Take the device out of the session and release it. Returns whether
    /// this call did the release.
    fn release(&self) -> bool {
        self.inner.listening.store(false, Ordering::Release);
        self.inner.open.store(false, Ordering::Release);
        let Some(device) = self.inner.device.write().take() else {
            return false;
        };
        device.interrupt();
        if let Err(e) = device.shutdown() {
            self.record(ErrorSite::Close, &e);
            debug!("{}: release failed: {}", self.inner.path, e);
        }
        true
    }

    /// Record a fatal error and close.
    pub(crate) fn fail(&self, site: ErrorSite, source: io::Error, transferred: usize) -> IoError {
        self.record(site, &source);
        self.inner.faulted.store(true, Ordering::Release);
        warn!(
            "{}: fatal {} error after {} byte(s), closing: {}",
            self.inner.path, site, transferred, source
        );
        self.release();
        IoError::lost(transferred, source)
    }

    pub(crate) fn record(&self, site: ErrorSite, err: &io::Error) {
        self.inner.state.lock().error = ErrorState::record(site, err);
    }

    pub(crate) fn device(&self) -> Result<Arc<dyn SerialDevice>, IoError> {
        match self.inner.device.read().as_ref() {
            Some(device) => Ok(Arc::clone(device)),
            None => Err(self.closed_error()),
        }
    }

    pub(crate) fn control_device(&self) -> Result<Arc<dyn SerialDevice>, ControlError> {
        self.device().map_err(|e| match e {
            IoError::DeviceLost { source, .. } => ControlError::DeviceLost { source },
            _ => ControlError::Closed,
        })
    }

    fn closed_error(&self) -> IoError {
        if !self.is_faulted() {
            return IoError::Closed;
        }
        let code = self.last_error().code;
        let source = if code > 0 {
            io::Error::from_raw_os_error(code)
        } else {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} was lost", self.inner.path),
            )
        };
        IoError::lost(0, source)
    }

    // ========== Event plumbing ==========

    /// Set or clear the flag event waits run under. Clearing it makes a
    /// pending [`EventWaiter::wait_for_event`] return within one tick.
    pub fn set_listening(&self, listening: bool) {
        self.inner.listening.store(listening, Ordering::Release);
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::Acquire)
    }

    /// Set the listening flag if it was clear. Returns whether it was set.
    pub(crate) fn claim_listening(&self) -> bool {
        self.inner
            .listening
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn take_pending_events(&self) -> EventMask {
        EventMask::from_bits_truncate(self.inner.pending.swap(0, Ordering::AcqRel))
    }

    /// Events an event wait reports: the monitored mask, or everything when
    /// nothing is monitored. Disconnects are always reported.
    pub(crate) fn event_interest(&self) -> EventMask {
        let monitored = self.timeouts().events;
        if monitored.is_empty() {
            return EventMask::all();
        }
        let mut interest = monitored | EventMask::PORT_DISCONNECTED;
        if monitored.contains(EventMask::DATA_RECEIVED) {
            interest |= EventMask::DATA_AVAILABLE;
        }
        interest
    }
}

impl std::fmt::Debug for PortSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortSession")
            .field("path", &self.inner.path)
            .field("open", &self.is_open())
            .field("faulted", &self.is_faulted())
            .finish()
    }
}

fn empty_result_kind(read_mode: ReadMode) -> io::ErrorKind {
    match read_mode {
        ReadMode::NonBlocking => io::ErrorKind::WouldBlock,
        _ => io::ErrorKind::TimedOut,
    }
}

impl io::Read for &PortSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.read_bytes(buf)? {
            0 => Err(empty_result_kind(self.timeouts().read_mode).into()),
            n => Ok(n),
        }
    }
}

impl io::Read for PortSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }
}

impl io::Write for &PortSession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match PortSession::write(self, buf)? {
            0 => Err(match self.timeouts().write_mode {
                WriteMode::NonBlocking => io::ErrorKind::WouldBlock,
                _ => io::ErrorKind::TimedOut,
            }
            .into()),
            n => Ok(n),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.drain()?)
    }
}

impl io::Write for PortSession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut &*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{MockBus, MockLine};
    use pretty_assertions::assert_eq;

    fn open(timeouts: TimeoutDescriptor) -> (MockBus, MockLine, PortSession) {
        let bus = MockBus::new();
        let line = bus.plug("MOCK0");
        let session =
            PortSession::open_with(&bus, "MOCK0", SerialConfiguration::new(9600), timeouts)
                .unwrap();
        (bus, line, session)
    }

    #[test]
    fn test_open_applies_configuration() {
        let (_bus, line, session) = open(TimeoutDescriptor::nonblocking());

        let settings = line.settings().expect("configured");

        assert_eq!(settings.baud_rate, 9600);
        assert!(session.is_open());
        assert!(line.is_claimed());
    }

    #[test]
    fn test_open_rolls_back_on_rejection() {
        let bus = MockBus::new();
        let line = bus.plug("MOCK0");
        line.reject_configuration(Some("unsupported rate"));

        let result = PortSession::open_with(
            &bus,
            "MOCK0",
            SerialConfiguration::new(9600),
            TimeoutDescriptor::nonblocking(),
        );

        assert!(matches!(result, Err(OpenError::ConfigurationRejected { .. })));
        assert!(!line.is_claimed());
    }

    #[test]
    fn test_open_rejects_invalid_configuration() {
        let bus = MockBus::new();
        bus.plug("MOCK0");

        let result = PortSession::open_with(
            &bus,
            "MOCK0",
            SerialConfiguration::new(0),
            TimeoutDescriptor::nonblocking(),
        );

        assert!(matches!(result, Err(OpenError::ConfigurationRejected { .. })));
    }

    #[test]
    fn test_nonblocking_read_returns_immediately() {
        let (_bus, _line, session) = open(TimeoutDescriptor::nonblocking());

        let started = Instant::now();
        let data = session.read(32).unwrap();

        assert!(data.is_empty());
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_semi_blocking_returns_first_bytes() {
        let (_bus, line, session) = open(TimeoutDescriptor::semi_blocking(0));
        line.inject(b"abc");

        let data = session.read(64).unwrap();

        assert_eq!(data, b"abc");
    }

    #[test]
    fn test_semi_blocking_times_out_empty() {
        let (_bus, _line, session) = open(TimeoutDescriptor::semi_blocking(50));

        let started = Instant::now();
        let data = session.read(8).unwrap();

        assert!(data.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_blocking_read_fills_buffer() {
        let (_bus, line, session) = open(TimeoutDescriptor::blocking(0));
        line.inject(b"0123456789");

        let mut buf = [0u8; 4];
        let n = session.read_bytes(&mut buf).unwrap();

        assert_eq!(n, 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(session.bytes_available(), 6);
    }

    #[test]
    fn test_read_buffer_grows_but_never_shrinks() {
        let (_bus, line, session) = open(TimeoutDescriptor::nonblocking());
        line.inject(&[7u8; 10]);

        session.read(256).unwrap();
        session.read(4).unwrap();

        assert_eq!(session.inner.read_buffer.lock().len(), 256);
    }

    #[test]
    fn test_fatal_read_closes_session() {
        let (_bus, line, session) = open(TimeoutDescriptor::nonblocking());
        line.fail_next_read(io::ErrorKind::BrokenPipe);

        let err = session.read(8).unwrap_err();

        assert!(matches!(err, IoError::DeviceLost { transferred: 0, .. }));
        assert!(!session.is_open());
        assert!(session.is_faulted());
        assert_eq!(session.last_error().site, ErrorSite::Read);
        assert!(matches!(session.read(8), Err(IoError::DeviceLost { .. })));
        assert!(!line.is_claimed());
    }

    #[test]
    fn test_fatal_read_keeps_partial_bytes() {
        let (_bus, line, session) = open(TimeoutDescriptor::blocking(0));
        line.inject(b"xy");
        let reader = session.clone();
        let handle = std::thread::spawn(move || reader.read(10));

        std::thread::sleep(Duration::from_millis(50));
        line.unplug();
        let err = handle.join().unwrap().unwrap_err();

        match err {
            IoError::DeviceLost {
                transferred,
                partial,
                ..
            } => {
                assert_eq!(transferred, 2);
                assert_eq!(partial, b"xy");
            }
            other => panic!("expected DeviceLost, got {:?}", other),
        }
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_bus, line, session) = open(TimeoutDescriptor::nonblocking());

        session.close();
        session.close();

        assert!(!session.is_open());
        assert!(!session.is_faulted());
        assert!(!line.is_claimed());
        assert!(matches!(session.read(1), Err(IoError::Closed)));
        assert_eq!(session.bytes_available(), -1);
        assert_eq!(session.bytes_awaiting_write(), -1);
    }

    #[test]
    fn test_close_unblocks_reader() {
        let (_bus, _line, session) = open(TimeoutDescriptor::blocking(0));
        let reader = session.clone();
        let handle = std::thread::spawn(move || reader.read(4));

        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        session.close();
        let result = handle.join().unwrap();

        assert!(matches!(result, Err(IoError::Closed)));
        assert!(started.elapsed() < IO_TICK * 3);
    }

    #[test]
    fn test_blocking_write_drains_only_written_bytes() {
        let timeouts =
            TimeoutDescriptor::nonblocking().with_write(WriteMode::Blocking, 50);
        let (_bus, line, session) = open(timeouts);
        line.set_write_limit(Some(3));

        let n = session.write(b"abcdef").unwrap();

        assert_eq!(n, 6);
        assert_eq!(line.drains(), vec![6]);
    }

    #[test]
    fn test_blocking_write_times_out_partial() {
        let timeouts =
            TimeoutDescriptor::nonblocking().with_write(WriteMode::Blocking, 30);
        let (_bus, line, session) = open(timeouts);
        line.set_write_limit(Some(0));

        let n = session.write(b"abc").unwrap();

        assert_eq!(n, 0);
        assert!(line.drains().is_empty());
    }

    #[test]
    fn test_nonblocking_write_does_not_drain() {
        let (_bus, line, session) = open(TimeoutDescriptor::nonblocking());

        session.write(b"hello").unwrap();

        assert_eq!(line.written(), b"hello");
        assert!(line.drains().is_empty());
        assert_eq!(session.bytes_awaiting_write(), 5);
    }

    #[test]
    fn test_fatal_write_closes_session() {
        let (_bus, line, session) = open(TimeoutDescriptor::nonblocking());
        line.fail_next_write(io::ErrorKind::Other);

        let err = session.write(b"x").unwrap_err();

        assert!(matches!(err, IoError::DeviceLost { .. }));
        assert!(!session.is_open());
        assert_eq!(session.last_error().site, ErrorSite::Write);
    }

    #[test]
    fn test_reconfigure_failure_keeps_previous_settings() {
        let (_bus, line, session) = open(TimeoutDescriptor::nonblocking());
        line.reject_configuration(Some("nope"));

        let err = session.configure(SerialConfiguration::new(57600)).unwrap_err();

        assert!(matches!(err, IoError::Rejected(_)));
        assert!(session.is_open());
        assert_eq!(session.configuration().baud_rate, 9600);
        assert_eq!(session.last_error().site, ErrorSite::Configure);
    }

    #[test]
    fn test_reconfigure_replaces_snapshot() {
        let (_bus, line, session) = open(TimeoutDescriptor::nonblocking());

        session.configure(SerialConfiguration::new(115200)).unwrap();

        assert_eq!(session.configuration().baud_rate, 115200);
        assert_eq!(line.configure_count(), 2);
        assert_eq!(line.settings().unwrap().baud_rate, 115200);
    }

    #[test]
    fn test_flush_buffers_discards_input() {
        let (_bus, line, session) = open(TimeoutDescriptor::nonblocking());
        line.inject(b"junk");

        session.flush_buffers().unwrap();

        assert_eq!(session.bytes_available(), 0);
    }

    #[test]
    fn test_io_read_maps_empty_to_would_block() {
        let (_bus, _line, session) = open(TimeoutDescriptor::nonblocking());

        let mut buf = [0u8; 4];
        let err = io::Read::read(&mut &session, &mut buf).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_drop_releases_device() {
        let (_bus, line, session) = open(TimeoutDescriptor::nonblocking());

        drop(session);

        assert!(!line.is_claimed());
    }
}
