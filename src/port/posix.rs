//! termios/ioctl backend for POSIX systems.
//!
//! The descriptor stays in `O_NONBLOCK` with `VMIN = VTIME = 0` for its whole
//! life; all waiting happens in `poll` with bounded timeouts.

use super::device::{LineStatus, OutputLine, Queue, SerialDevice};
#[cfg(target_os = "linux")]
use super::timeout::EventMask;
use super::translate::{BaudSelection, FlowBits, FrameBits, WireSettings};
use crate::error::OpenError;
#[cfg(target_os = "linux")]
use parking_lot::Mutex;
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(target_os = "linux")]
mod linux {
    //! Linux-only ioctl layouts from `<linux/serial.h>`.

    pub const TIOCGSERIAL: libc::c_ulong = 0x541E;
    pub const TIOCSSERIAL: libc::c_ulong = 0x541F;
    pub const TIOCGRS485: libc::c_ulong = 0x542E;
    pub const TIOCSRS485: libc::c_ulong = 0x542F;
    pub const TIOCGICOUNT: libc::c_ulong = 0x545D;

    pub const ASYNC_SPD_MASK: libc::c_int = 0x1030;
    pub const ASYNC_SPD_CUST: libc::c_int = 0x0030;
    pub const ASYNC_LOW_LATENCY: libc::c_int = 0x2000;

    pub const SER_RS485_ENABLED: u32 = 1 << 0;
    pub const SER_RS485_RTS_ON_SEND: u32 = 1 << 1;
    pub const SER_RS485_RTS_AFTER_SEND: u32 = 1 << 2;
    pub const SER_RS485_RX_DURING_TX: u32 = 1 << 4;
    pub const SER_RS485_TERMINATE_BUS: u32 = 1 << 5;

    #[repr(C)]
    #[derive(Default)]
    pub struct SerialStruct {
        pub kind: libc::c_int,
        pub line: libc::c_int,
        pub port: libc::c_uint,
        pub irq: libc::c_int,
        pub flags: libc::c_int,
        pub xmit_fifo_size: libc::c_int,
        pub custom_divisor: libc::c_int,
        pub baud_base: libc::c_int,
        pub close_delay: libc::c_ushort,
        pub io_type: libc::c_char,
        pub reserved_char: [libc::c_char; 1],
        pub hub6: libc::c_int,
        pub closing_wait: libc::c_ushort,
        pub closing_wait2: libc::c_ushort,
        pub iomem_base: usize,
        pub iomem_reg_shift: libc::c_ushort,
        pub port_high: libc::c_uint,
        pub iomap_base: libc::c_ulong,
    }

    #[repr(C)]
    #[derive(Default)]
    pub struct SerialRs485 {
        pub flags: u32,
        pub delay_rts_before_send: u32,
        pub delay_rts_after_send: u32,
        pub padding: [u32; 5],
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct IcounterStruct {
        pub cts: libc::c_int,
        pub dsr: libc::c_int,
        pub rng: libc::c_int,
        pub dcd: libc::c_int,
        pub rx: libc::c_int,
        pub tx: libc::c_int,
        pub frame: libc::c_int,
        pub overrun: libc::c_int,
        pub parity: libc::c_int,
        pub brk: libc::c_int,
        pub buf_overrun: libc::c_int,
        pub reserved: [libc::c_int; 9],
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
const IOSSIOSPEED: libc::c_ulong = 0x8008_5402;

/// Sleep between output queue checks in `drain`.
const DRAIN_TICK: Duration = Duration::from_millis(10);

/// Run a libc call until it stops failing with `EINTR`.
fn retry<F>(mut call: F) -> io::Result<libc::c_int>
where
    F: FnMut() -> libc::c_int,
{
    loop {
        let rc = call();
        if rc != -1 {
            return Ok(rc);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

fn poll_millis(timeout: Duration) -> libc::c_int {
    let ms = timeout.as_millis();
    if ms == 0 && !timeout.is_zero() {
        1
    } else {
        ms.min(libc::c_int::MAX as u128) as libc::c_int
    }
}

/// An exclusively locked tty.
#[derive(Debug)]
pub struct PosixDevice {
    fd: RawFd,
    path: String,
    released: AtomicBool,
    rs485_active: AtomicBool,
    #[cfg(target_os = "linux")]
    counters: Mutex<Option<linux::IcounterStruct>>,
}

impl PosixDevice {
    /// Open `path` non-blocking, take an advisory exclusive lock and put the
    /// line into raw mode. Any failure releases the descriptor.
    pub fn open(path: &str) -> Result<Self, OpenError> {
        let c_path = CString::new(path).map_err(|_| OpenError::not_found(path))?;
        let flags = libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC;
        let fd = retry(|| unsafe { libc::open(c_path.as_ptr(), flags) }).map_err(|e| {
            match e.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::ENXIO) | Some(libc::ENODEV) => {
                    OpenError::not_found(path)
                }
                Some(libc::EBUSY) => OpenError::contention(path),
                _ => OpenError::from_io(path, e),
            }
        })?;

        // From here on, Drop closes the descriptor.
        let device = Self {
            fd,
            path: path.to_string(),
            released: AtomicBool::new(false),
            rs485_active: AtomicBool::new(false),
            #[cfg(target_os = "linux")]
            counters: Mutex::new(None),
        };

        retry(|| unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) }).map_err(|e| {
            if would_block(&e) {
                OpenError::contention(path)
            } else {
                OpenError::from_io(path, e)
            }
        })?;

        device
            .make_raw()
            .map_err(|e| OpenError::from_io(path, e))?;

        debug!("Opened {} (fd {})", path, fd);
        Ok(device)
    }

    fn make_raw(&self) -> io::Result<()> {
        let mut tio = self.termios()?;
        unsafe { libc::cfmakeraw(&mut tio) };
        tio.c_cflag |= libc::CLOCAL | libc::CREAD;
        tio.c_cc[libc::VMIN] = 0;
        tio.c_cc[libc::VTIME] = 0;
        self.set_termios(&tio)
    }

    fn termios(&self) -> io::Result<libc::termios> {
        let mut tio: libc::termios = unsafe { std::mem::zeroed() };
        retry(|| unsafe { libc::tcgetattr(self.fd, &mut tio) })?;
        Ok(tio)
    }

    fn set_termios(&self, tio: &libc::termios) -> io::Result<()> {
        retry(|| unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, tio) })?;
        Ok(())
    }

    fn ioctl_int(&self, request: libc::c_ulong) -> io::Result<libc::c_int> {
        let mut value: libc::c_int = 0;
        retry(|| unsafe { libc::ioctl(self.fd, request as _, &mut value) })?;
        Ok(value)
    }

    fn apply_frame(tio: &mut libc::termios, frame: FrameBits) -> io::Result<()> {
        tio.c_cflag &= !(libc::CSIZE | libc::CSTOPB | libc::PARENB | libc::PARODD);
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            tio.c_cflag &= !libc::CMSPAR;
        }
        tio.c_iflag &= !(libc::INPCK | libc::IGNPAR | libc::PARMRK | libc::ISTRIP);

        tio.c_cflag |= match frame.bits() & FrameBits::CSIZE.bits() {
            0x00 => libc::CS5,
            0x01 => libc::CS6,
            0x02 => libc::CS7,
            _ => libc::CS8,
        };
        if frame.contains(FrameBits::CSTOPB) {
            tio.c_cflag |= libc::CSTOPB;
        }
        if frame.contains(FrameBits::STOP_ONE_HALF) {
            debug!("1.5 stop bits are not expressible in termios; using one");
        }
        if frame.contains(FrameBits::PARENB) {
            tio.c_cflag |= libc::PARENB;
            tio.c_iflag |= libc::INPCK | libc::IGNPAR;
        }
        if frame.contains(FrameBits::PARODD) {
            tio.c_cflag |= libc::PARODD;
        }
        if frame.contains(FrameBits::CMSPAR) {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            {
                tio.c_cflag |= libc::CMSPAR;
            }
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "mark/space parity is not supported on this platform",
                ));
            }
        }
        if frame.data_bits().bits() < 8 {
            tio.c_iflag |= libc::ISTRIP;
        }
        Ok(())
    }

    fn apply_flow(tio: &mut libc::termios, settings: &WireSettings) {
        tio.c_cflag &= !libc::CRTSCTS;
        tio.c_iflag &= !(libc::IXON | libc::IXOFF | libc::IXANY);

        if settings.flow.rts_cts() {
            tio.c_cflag |= libc::CRTSCTS;
        }
        if settings.flow.dsr_dtr() {
            warn!("DSR/DTR flow control has no termios equivalent; ignoring");
        }
        if settings.flow.contains(FlowBits::IN_X) {
            tio.c_iflag |= libc::IXOFF;
        }
        if settings.flow.contains(FlowBits::OUT_X) {
            tio.c_iflag |= libc::IXON;
        }
        tio.c_cc[libc::VSTART] = settings.xon_char as libc::cc_t;
        tio.c_cc[libc::VSTOP] = settings.xoff_char as libc::cc_t;
    }

    #[cfg(target_os = "linux")]
    fn set_custom_speed(&self, rate: u32) -> io::Result<()> {
        let mut tio2: libc::termios2 = unsafe { std::mem::zeroed() };
        let arbitrary = retry(|| unsafe { libc::ioctl(self.fd, libc::TCGETS2 as _, &mut tio2) })
            .and_then(|_| {
                tio2.c_cflag &= !libc::CBAUD;
                tio2.c_cflag |= libc::BOTHER;
                tio2.c_ispeed = rate;
                tio2.c_ospeed = rate;
                retry(|| unsafe { libc::ioctl(self.fd, libc::TCSETS2 as _, &tio2) })
            });

        match arbitrary {
            Ok(_) => {
                self.set_low_latency(true);
                Ok(())
            }
            Err(e) => {
                debug!("{}: arbitrary speed ioctl failed ({}), trying divisor", self.path, e);
                self.set_divisor_speed(rate)
            }
        }
    }

    /// Legacy custom speed: B38400 plus a UART clock divisor.
    #[cfg(target_os = "linux")]
    fn set_divisor_speed(&self, rate: u32) -> io::Result<()> {
        let mut serial = linux::SerialStruct::default();
        retry(|| unsafe { libc::ioctl(self.fd, linux::TIOCGSERIAL as _, &mut serial) })?;
        if serial.baud_base <= 0 {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("baud rate {} is not supported by {}", rate, self.path),
            ));
        }
        let divisor = super::translate::custom_divisor(rate, serial.baud_base as u32);
        serial.flags &= !linux::ASYNC_SPD_MASK;
        serial.flags |= linux::ASYNC_SPD_CUST | linux::ASYNC_LOW_LATENCY;
        serial.custom_divisor = divisor.get() as libc::c_int;
        retry(|| unsafe { libc::ioctl(self.fd, linux::TIOCSSERIAL as _, &serial) })?;

        let mut tio = self.termios()?;
        unsafe {
            libc::cfsetispeed(&mut tio, libc::B38400);
            libc::cfsetospeed(&mut tio, libc::B38400);
        }
        self.set_termios(&tio)
    }

    #[cfg(target_os = "linux")]
    fn set_low_latency(&self, enabled: bool) {
        let mut serial = linux::SerialStruct::default();
        if retry(|| unsafe { libc::ioctl(self.fd, linux::TIOCGSERIAL as _, &mut serial) }).is_err()
        {
            return;
        }
        if enabled {
            serial.flags |= linux::ASYNC_LOW_LATENCY;
        } else {
            serial.flags &= !(linux::ASYNC_LOW_LATENCY | linux::ASYNC_SPD_MASK);
            serial.custom_divisor = 0;
        }
        let _ = retry(|| unsafe { libc::ioctl(self.fd, linux::TIOCSSERIAL as _, &serial) });
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn set_custom_speed(&self, rate: u32) -> io::Result<()> {
        let speed = rate as libc::speed_t;
        retry(|| unsafe { libc::ioctl(self.fd, IOSSIOSPEED as _, &speed) })?;
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
    fn set_custom_speed(&self, rate: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("non-standard baud rate {} is not supported here", rate),
        ))
    }

    #[cfg(target_os = "linux")]
    fn apply_rs485(&self, settings: &WireSettings) -> io::Result<()> {
        let desc = settings.rs485;
        if !desc.enabled && !self.rs485_active.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut rs485 = linux::SerialRs485::default();
        retry(|| unsafe { libc::ioctl(self.fd, linux::TIOCGRS485 as _, &mut rs485) })?;

        let mut flags = rs485.flags
            & !(linux::SER_RS485_ENABLED
                | linux::SER_RS485_RTS_ON_SEND
                | linux::SER_RS485_RTS_AFTER_SEND
                | linux::SER_RS485_RX_DURING_TX
                | linux::SER_RS485_TERMINATE_BUS);
        if desc.enabled {
            flags |= linux::SER_RS485_ENABLED;
            if desc.rts_on_send {
                flags |= linux::SER_RS485_RTS_ON_SEND;
            }
            if desc.rts_after_send {
                flags |= linux::SER_RS485_RTS_AFTER_SEND;
            }
            if desc.rx_during_tx {
                flags |= linux::SER_RS485_RX_DURING_TX;
            }
            if desc.terminate_bus {
                flags |= linux::SER_RS485_TERMINATE_BUS;
            }
        }
        rs485.flags = flags;
        rs485.delay_rts_before_send = desc.delay_before_send_ms;
        rs485.delay_rts_after_send = desc.delay_after_send_ms;
        retry(|| unsafe { libc::ioctl(self.fd, linux::TIOCSRS485 as _, &rs485) })?;

        self.rs485_active.store(desc.enabled, Ordering::Release);
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_rs485(&self, settings: &WireSettings) -> io::Result<()> {
        if settings.rs485.enabled {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "RS-485 mode is only available on Linux",
            ));
        }
        Ok(())
    }

    fn poll(&self, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, poll_millis(timeout)) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(err)
            };
        }
        if rc == 0 {
            return Ok(false);
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("{} disconnected", self.path),
            ));
        }
        Ok(pfd.revents & events != 0)
    }
}

impl SerialDevice for PosixDevice {
    fn configure(&self, settings: &WireSettings) -> io::Result<()> {
        let mut tio = self.termios()?;
        Self::apply_frame(&mut tio, settings.frame)?;
        Self::apply_flow(&mut tio, settings);
        tio.c_cc[libc::VMIN] = 0;
        tio.c_cc[libc::VTIME] = 0;

        let custom = match settings.baud {
            BaudSelection::Standard(code) => {
                unsafe {
                    libc::cfsetispeed(&mut tio, code.raw());
                    libc::cfsetospeed(&mut tio, code.raw());
                }
                None
            }
            BaudSelection::Custom(rate) => Some(rate),
        };
        self.set_termios(&tio)?;

        match custom {
            Some(rate) => self.set_custom_speed(rate)?,
            #[cfg(target_os = "linux")]
            None => self.set_low_latency(false),
            #[cfg(not(target_os = "linux"))]
            None => {}
        }

        self.apply_rs485(settings)?;
        debug!("{}: applied {:?}", self.path, settings);
        Ok(())
    }

    fn read_available(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n == 0 {
                // Zero means either idle or hung up; only a hung-up tty
                // fails the ioctl.
                self.ioctl_int(libc::FIONREAD as libc::c_ulong)?;
                return Ok(0);
            }
            if n > 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(0),
                _ => return Err(err),
            }
        }
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        self.poll(libc::POLLIN, timeout)
    }

    fn write_available(&self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        loop {
            let n = unsafe { libc::write(self.fd, data.as_ptr().cast(), data.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(0),
                _ => return Err(err),
            }
        }
    }

    fn wait_writable(&self, timeout: Duration) -> io::Result<bool> {
        self.poll(libc::POLLOUT, timeout)
    }

    fn drain(&self) -> io::Result<()> {
        // tcdrain(3) cannot be woken, so wait out the kernel queue in ticks
        // and stop once the device is released.
        loop {
            if self.released.load(Ordering::Acquire) {
                return Ok(());
            }
            match self.bytes_to_write() {
                Ok(0) => break,
                Ok(_) => std::thread::sleep(DRAIN_TICK),
                Err(e) => {
                    debug!("{}: output queue size unavailable: {}", self.path, e);
                    break;
                }
            }
        }
        // Only the UART FIFO remains; shutdown's flush also ends this wait.
        retry(|| unsafe { libc::tcdrain(self.fd) })?;
        Ok(())
    }

    fn discard(&self, queue: Queue) -> io::Result<()> {
        let selector = match queue {
            Queue::Input => libc::TCIFLUSH,
            Queue::Output => libc::TCOFLUSH,
            Queue::Both => libc::TCIOFLUSH,
        };
        retry(|| unsafe { libc::tcflush(self.fd, selector) })?;
        Ok(())
    }

    fn bytes_to_read(&self) -> io::Result<usize> {
        Ok(self.ioctl_int(libc::FIONREAD as libc::c_ulong)?.max(0) as usize)
    }

    fn bytes_to_write(&self) -> io::Result<usize> {
        Ok(self.ioctl_int(libc::TIOCOUTQ as libc::c_ulong)?.max(0) as usize)
    }

    fn set_line(&self, line: OutputLine, level: bool) -> io::Result<()> {
        let bits: libc::c_int = match line {
            OutputLine::Rts => libc::TIOCM_RTS,
            OutputLine::Dtr => libc::TIOCM_DTR,
        };
        let request = if level { libc::TIOCMBIS } else { libc::TIOCMBIC };
        retry(|| unsafe { libc::ioctl(self.fd, request as _, &bits) })?;
        Ok(())
    }

    fn line_status(&self) -> io::Result<LineStatus> {
        let bits = self.ioctl_int(libc::TIOCMGET as libc::c_ulong)?;
        Ok(LineStatus {
            cts: bits & libc::TIOCM_CTS != 0,
            dsr: bits & libc::TIOCM_DSR != 0,
            dcd: bits & libc::TIOCM_CAR != 0,
            ri: bits & libc::TIOCM_RNG != 0,
            rts: bits & libc::TIOCM_RTS != 0,
            dtr: bits & libc::TIOCM_DTR != 0,
        })
    }

    fn set_break(&self, active: bool) -> io::Result<()> {
        let request = if active { libc::TIOCSBRK } else { libc::TIOCCBRK };
        retry(|| unsafe { libc::ioctl(self.fd, request as _) })?;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn take_line_errors(&self) -> io::Result<EventMask> {
        let mut now = linux::IcounterStruct::default();
        retry(|| unsafe { libc::ioctl(self.fd, linux::TIOCGICOUNT as _, &mut now) })?;

        let mut last = self.counters.lock();
        let mut events = EventMask::empty();
        if let Some(prev) = last.as_ref() {
            if now.brk != prev.brk {
                events |= EventMask::BREAK_INTERRUPT;
            }
            if now.frame != prev.frame {
                events |= EventMask::FRAMING_ERROR;
            }
            if now.overrun != prev.overrun {
                events |= EventMask::OVERRUN_ERROR;
            }
            if now.buf_overrun != prev.buf_overrun {
                events |= EventMask::SOFTWARE_OVERRUN;
            }
            if now.parity != prev.parity {
                events |= EventMask::PARITY_ERROR;
            }
        }
        *last = Some(now);
        Ok(events)
    }

    fn shutdown(&self) -> io::Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Discarding output also wakes a writer parked in drain.
        let _ = retry(|| unsafe { libc::tcflush(self.fd, libc::TCIOFLUSH) });
        retry(|| unsafe { libc::flock(self.fd, libc::LOCK_UN) })?;
        debug!("Released {}", self.path);
        Ok(())
    }
}

impl Drop for PosixDevice {
    fn drop(&mut self) {
        let _ = self.shutdown();
        // close(2) is not retried: the descriptor is gone even on EINTR.
        if unsafe { libc::close(self.fd) } != 0 {
            warn!(
                "Closing {} failed: {}",
                self.path,
                io::Error::last_os_error()
            );
        }
    }
}
