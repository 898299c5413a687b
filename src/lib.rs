//! Serial Transport Library
//!
//! Cross-platform serial port access: discovery of attached devices,
//! exclusive sessions, timeout-governed reads and writes, event waiting and
//! modem line control.
//!
//! # Modules
//!
//! - `config`: Configuration management with TOML support
//! - `error`: Error types for opening, I/O and control
//! - `port`: Line settings, their wire translation, timeout policy and device backends
//! - `registry`: Device enumeration and session bookkeeping
//! - `session`: Open sessions, event waiting and modem control
//! - `listener`: Background event delivery with message framing
//! - `logging`: Tracing subscriber setup
//! - `async_session`: Tokio adapter (when `async` feature is enabled)
//!
//! # Example
//!
//! ```no_run
//! use serial_transport::{PortRegistry, SerialConfiguration, TimeoutDescriptor};
//!
//! let registry = PortRegistry::system();
//! for port in registry.enumerate()? {
//!     println!("{} - {}", port.path, port.description);
//! }
//!
//! let session = registry.open(
//!     "/dev/ttyUSB0",
//!     SerialConfiguration::new(115200),
//!     TimeoutDescriptor::semi_blocking(1000),
//! )?;
//! session.write(b"AT\r\n")?;
//! let reply = session.read(256)?;
//! println!("{}", String::from_utf8_lossy(&reply));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod listener;
pub mod logging;
pub mod port;
pub mod registry;
pub mod session;

#[cfg(feature = "async")]
pub mod async_session;

// Re-export commonly used types for convenience
pub use error::{ControlError, ErrorSite, ErrorState, IoError, OpenError, ScanError};
pub use listener::{DataListener, FnListener, Framing, ListenerError, ListenerHandle, SerialEvent};
pub use port::{
    DataBits, EventMask, FlowControl, LineStatus, Parity, ReadMode, Rs485Settings,
    SerialConfiguration, StopBits, TimeoutDescriptor, TimeoutMode, WriteMode,
};
pub use registry::{PortDescriptor, PortRegistry, ScannedDevice};
pub use session::{EventWaiter, PortSession};

#[cfg(feature = "async")]
pub use async_session::AsyncPortSession;

// Re-export config types
pub use config::{Config, ConfigError, ConfigLoader, ConfigResult};
