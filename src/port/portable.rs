//! Backend built on the `serialport` crate.
//!
//! This is the native backend where no termios backend exists (Windows) and
//! an alternative everywhere else. The crate exposes a single flow-control
//! switch and no stick parity, so some settings are rejected here.

use super::device::{LineStatus, OutputLine, Queue, SerialDevice};
use super::translate::{BaudSelection, FlowBits, FrameBits, WireSettings};
use super::settings::{DataBits, DEFAULT_XOFF, DEFAULT_XON};
use crate::error::OpenError;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Granularity of the emulated waits.
const POLL_STEP: Duration = Duration::from_millis(5);

/// Timeout given to the crate so its own reads and writes never park.
const CALL_TIMEOUT: Duration = Duration::from_millis(1);

fn unsupported(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{} is not supported by this backend", what),
    )
}

/// A port opened through `serialport::new`.
///
/// The reader and the writer are two clones of one handle so both
/// directions can run at the same time.
pub struct PortableDevice {
    path: String,
    reader: Mutex<Box<dyn serialport::SerialPort>>,
    writer: Mutex<Box<dyn serialport::SerialPort>>,
    /// Output line levels; not all platforms can read them back.
    outputs: Mutex<(bool, bool)>,
    released: AtomicBool,
}

impl PortableDevice {
    pub fn open(path: &str) -> Result<Self, OpenError> {
        let reader = serialport::new(path, 9600)
            .timeout(CALL_TIMEOUT)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => OpenError::not_found(path),
                serialport::ErrorKind::Io(io::ErrorKind::NotFound) => OpenError::not_found(path),
                #[cfg(windows)]
                serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                    OpenError::contention(path)
                }
                serialport::ErrorKind::InvalidInput => OpenError::rejected(path, e.to_string()),
                _ => OpenError::from_io(path, io::Error::from(e)),
            })?;
        let writer = reader
            .try_clone()
            .map_err(|e| OpenError::from_io(path, io::Error::from(e)))?;

        debug!("Opened {} through serialport", path);
        Ok(Self {
            path: path.to_string(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            outputs: Mutex::new((false, false)),
            released: AtomicBool::new(false),
        })
    }

    fn check_supported(settings: &WireSettings) -> io::Result<()> {
        if settings.frame.contains(FrameBits::CMSPAR) {
            return Err(unsupported("mark/space parity"));
        }
        if settings.frame.contains(FrameBits::STOP_ONE_HALF) {
            return Err(unsupported("1.5 stop bits"));
        }
        if settings.flow.dsr_dtr() {
            return Err(unsupported("DSR/DTR flow control"));
        }
        let software = settings.flow.intersects(FlowBits::IN_X | FlowBits::OUT_X);
        if software && settings.flow.rts_cts() {
            return Err(unsupported("combined hardware and software flow control"));
        }
        if software && (settings.xon_char != DEFAULT_XON || settings.xoff_char != DEFAULT_XOFF) {
            return Err(unsupported("custom XON/XOFF characters"));
        }
        if settings.rs485.enabled {
            return Err(unsupported("RS-485 mode"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PortableDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortableDevice")
            .field("path", &self.path)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

impl SerialDevice for PortableDevice {
    fn configure(&self, settings: &WireSettings) -> io::Result<()> {
        Self::check_supported(settings)?;

        let data_bits = match settings.frame.data_bits() {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        };
        let parity = if !settings.frame.contains(FrameBits::PARENB) {
            serialport::Parity::None
        } else if settings.frame.contains(FrameBits::PARODD) {
            serialport::Parity::Odd
        } else {
            serialport::Parity::Even
        };
        let stop_bits = if settings.frame.contains(FrameBits::CSTOPB) {
            serialport::StopBits::Two
        } else {
            serialport::StopBits::One
        };
        let flow = if settings.flow.rts_cts() {
            serialport::FlowControl::Hardware
        } else if settings.flow.intersects(FlowBits::IN_X | FlowBits::OUT_X) {
            serialport::FlowControl::Software
        } else {
            serialport::FlowControl::None
        };
        if let BaudSelection::Custom(rate) = settings.baud {
            debug!("{}: requesting non-standard rate {}", self.path, rate);
        }

        let mut port = self.reader.lock();
        port.set_baud_rate(settings.baud_rate)?;
        port.set_data_bits(data_bits)?;
        port.set_parity(parity)?;
        port.set_stop_bits(stop_bits)?;
        port.set_flow_control(flow)?;
        Ok(())
    }

    fn read_available(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut port = self.reader.lock();
        let pending = port.bytes_to_read()? as usize;
        if pending == 0 || buf.is_empty() {
            return Ok(0);
        }
        let len = pending.min(buf.len());
        loop {
            match port.read(&mut buf[..len]) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(0),
                Err(e) => return Err(e),
            }
        }
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.reader.lock().bytes_to_read()? > 0 {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline || self.released.load(Ordering::Acquire) {
                return Ok(false);
            }
            std::thread::sleep(POLL_STEP.min(deadline - now));
        }
    }

    fn write_available(&self, data: &[u8]) -> io::Result<usize> {
        let mut port = self.writer.lock();
        loop {
            match port.write(data) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(0),
                Err(e) => return Err(e),
            }
        }
    }

    fn wait_writable(&self, timeout: Duration) -> io::Result<bool> {
        std::thread::sleep(POLL_STEP.min(timeout));
        Ok(true)
    }

    fn drain(&self) -> io::Result<()> {
        self.writer.lock().flush()
    }

    fn discard(&self, queue: Queue) -> io::Result<()> {
        let selector = match queue {
            Queue::Input => serialport::ClearBuffer::Input,
            Queue::Output => serialport::ClearBuffer::Output,
            Queue::Both => serialport::ClearBuffer::All,
        };
        self.reader.lock().clear(selector)?;
        Ok(())
    }

    fn bytes_to_read(&self) -> io::Result<usize> {
        Ok(self.reader.lock().bytes_to_read()? as usize)
    }

    fn bytes_to_write(&self) -> io::Result<usize> {
        Ok(self.writer.lock().bytes_to_write()? as usize)
    }

    fn set_line(&self, line: OutputLine, level: bool) -> io::Result<()> {
        let mut port = self.writer.lock();
        let mut outputs = self.outputs.lock();
        match line {
            OutputLine::Rts => {
                port.write_request_to_send(level)?;
                outputs.0 = level;
            }
            OutputLine::Dtr => {
                port.write_data_terminal_ready(level)?;
                outputs.1 = level;
            }
        }
        Ok(())
    }

    fn line_status(&self) -> io::Result<LineStatus> {
        let mut port = self.writer.lock();
        let (rts, dtr) = *self.outputs.lock();
        Ok(LineStatus {
            cts: port.read_clear_to_send()?,
            dsr: port.read_data_set_ready()?,
            dcd: port.read_carrier_detect()?,
            ri: port.read_ring_indicator()?,
            rts,
            dtr,
        })
    }

    fn set_break(&self, active: bool) -> io::Result<()> {
        let port = self.writer.lock();
        if active {
            port.set_break()?;
        } else {
            port.clear_break()?;
        }
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.reader.lock().clear(serialport::ClearBuffer::Input)?;
        debug!("Released {}", self.path);
        Ok(())
    }
}
