//! Defaults for line settings, timeouts, event ticks, port aliases and
//! logging, read from a TOML file.
//!
//! # Where the file is looked for
//!
//! 1. `SERIAL_TRANSPORT_CONFIG` environment variable (explicit path)
//! 2. `./serial-transport.toml` (current directory)
//! 3. `serial-transport.toml` in the platform config directory
//!    (`~/.config/serial-transport/` on Linux, `%APPDATA%` on Windows)
//! 4. Built-in defaults (no file required)
//!
//! # Environment Overrides
//!
//! `SERIAL_TRANSPORT_<SECTION>_<KEY>` variables take precedence over the file.
//!
//! Examples:
//! - `SERIAL_TRANSPORT_SERIAL_DEFAULT_BAUD=115200`
//! - `SERIAL_TRANSPORT_TIMEOUTS_READ_MODE=blocking`
//! - `SERIAL_TRANSPORT_EVENTS_TICK_MS=250`
//!
//! The legacy `TEST_BAUD` variable is also honored.
//!
//! # Example
//!
//! ```rust,no_run
//! use serial_transport::config::ConfigLoader;
//!
//! let loader = ConfigLoader::load()?;
//! let config = loader.config();
//!
//! println!("Default baud: {}", config.serial.default_baud);
//! let line = config.serial.configuration();
//! let timeouts = config.timeouts.descriptor();
//! # let _ = (line, timeouts);
//! # Ok::<(), serial_transport::config::ConfigError>(())
//! ```

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    get_default_config_dir, get_default_config_path, resolve_config_path, ConfigLoader,
};
pub use schema::{
    Config, EventsConfig, FlowFlag, LogFormat, LoggingConfig, RegistryConfig, SerialConfig,
    TimeoutConfig,
};
