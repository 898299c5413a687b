//! Error types shared by sessions, the registry and modem control.
//!
//! Each layer gets its own enum so callers can tell an open failure from a
//! lost device or a control line the platform cannot drive. Every failure is
//! also recorded as an [`ErrorState`] on the session it happened on.

use std::fmt;
use std::io;
use thiserror::Error;

/// Errors raised while opening a session.
#[derive(Debug, Error)]
pub enum OpenError {
    /// The device path does not exist.
    #[error("Serial port not found: {path}")]
    NotFound { path: String },

    /// Another session (in this process or another) holds the device.
    #[error("Serial port {path} is already in use")]
    LockContention { path: String },

    /// The device or driver refused the requested settings.
    #[error("Serial port {path} rejected the configuration: {reason}")]
    ConfigurationRejected { path: String, reason: String },

    /// Any other OS failure while acquiring the handle.
    #[error("Failed to open serial port {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl OpenError {
    /// Create a NotFound error from a port path.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create a LockContention error from a port path.
    pub fn contention(path: impl Into<String>) -> Self {
        Self::LockContention { path: path.into() }
    }

    /// Create a ConfigurationRejected error.
    pub fn rejected(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigurationRejected {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Classify a raw OS error raised while opening `path`.
    pub fn from_io(path: impl Into<String>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path },
            io::ErrorKind::WouldBlock => Self::LockContention { path },
            _ => Self::Io { path, source },
        }
    }
}

/// Errors raised by reads, writes and reconfiguration of an open session.
#[derive(Debug, Error)]
pub enum IoError {
    /// A fatal OS error closed the session.
    ///
    /// `transferred` counts the bytes already moved before the failure. For
    /// [`PortSession::read`](crate::PortSession::read) those bytes are kept in
    /// `partial`; for buffer-based calls they are already in the caller's
    /// buffer.
    #[error("Serial device lost after {transferred} byte(s): {source}")]
    DeviceLost {
        transferred: usize,
        partial: Vec<u8>,
        #[source]
        source: io::Error,
    },

    /// The session was closed by its owner.
    #[error("Port is closed")]
    Closed,

    /// The device refused a new configuration. The session stays open with
    /// its previous settings.
    #[error("Configuration rejected: {0}")]
    Rejected(String),
}

impl IoError {
    /// Bytes transferred before the failure.
    pub fn transferred(&self) -> usize {
        match self {
            Self::DeviceLost { transferred, .. } => *transferred,
            _ => 0,
        }
    }

    pub(crate) fn lost(transferred: usize, source: io::Error) -> Self {
        Self::DeviceLost {
            transferred,
            partial: Vec::new(),
            source,
        }
    }
}

impl From<IoError> for io::Error {
    fn from(err: IoError) -> Self {
        match err {
            IoError::DeviceLost { source, .. } => source,
            IoError::Closed => io::Error::new(io::ErrorKind::NotConnected, "port is closed"),
            IoError::Rejected(reason) => io::Error::new(io::ErrorKind::InvalidInput, reason),
        }
    }
}

/// Errors raised by modem-line and buffer control. These never close the
/// session.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The backend cannot drive or sense this line.
    #[error("Operation not supported by this device: {operation}")]
    Unsupported { operation: &'static str },

    /// The device stopped answering control requests.
    #[error("Control request failed: {source}")]
    DeviceLost {
        #[source]
        source: io::Error,
    },

    /// The session is not open.
    #[error("Port is closed")]
    Closed,
}

impl ControlError {
    pub(crate) fn from_io(operation: &'static str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::Unsupported {
            Self::Unsupported { operation }
        } else {
            Self::DeviceLost { source }
        }
    }
}

/// Errors raised while listing attached devices.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Port enumeration failed: {0}")]
    Enumeration(#[from] serialport::Error),

    #[error("Port enumeration failed: {0}")]
    Io(#[from] io::Error),
}

/// Where the most recent failure on a session happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorSite {
    #[default]
    None,
    Open,
    Configure,
    Read,
    Write,
    Drain,
    Flush,
    Wait,
    Control,
    Query,
    Close,
}

impl fmt::Display for ErrorSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Open => "open",
            Self::Configure => "configure",
            Self::Read => "read",
            Self::Write => "write",
            Self::Drain => "drain",
            Self::Flush => "flush",
            Self::Wait => "wait",
            Self::Control => "control",
            Self::Query => "query",
            Self::Close => "close",
        };
        f.write_str(name)
    }
}

/// Last OS error code and the operation that produced it.
///
/// `code` is the raw OS error number, or `-1` when the failure did not carry
/// one (a disconnect reported as end of stream, for instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorState {
    pub code: i32,
    pub site: ErrorSite,
}

impl ErrorState {
    pub const CLEAR: ErrorState = ErrorState {
        code: 0,
        site: ErrorSite::None,
    };

    pub(crate) fn record(site: ErrorSite, err: &io::Error) -> Self {
        Self {
            code: err.raw_os_error().unwrap_or(-1),
            site,
        }
    }

    /// Whether no failure has been recorded.
    pub fn is_clear(&self) -> bool {
        self.site == ErrorSite::None
    }
}

impl Default for ErrorState {
    fn default() -> Self {
        Self::CLEAR
    }
}

impl fmt::Display for ErrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (os error {})", self.site, self.code)
    }
}
