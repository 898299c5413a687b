//! Layout of `serial-transport.toml`.
//!
//! Every section has defaults, so an empty file is a valid configuration.

use crate::port::{
    DataBits, FlowControl, Parity, ReadMode, Rs485Settings, SerialConfiguration, StopBits,
    TimeoutDescriptor, WriteMode, DEFAULT_XOFF, DEFAULT_XON,
};
use crate::session::DEFAULT_EVENT_TICK;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Line settings used when a command does not give its own
    pub serial: SerialConfig,
    /// Default timeout modes
    pub timeouts: TimeoutConfig,
    /// Event waiting
    pub events: EventsConfig,
    /// Device discovery
    pub registry: RegistryConfig,
    /// Tracing output of the `serialctl` binary
    pub logging: LoggingConfig,
}

/// Serial line configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Default baud rate for new sessions
    pub default_baud: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Enabled flow-control signals, e.g. `["rts", "cts"]`
    pub flow_control: Vec<FlowFlag>,
    pub xon_char: u8,
    pub xoff_char: u8,
    pub rs485: Rs485Settings,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            default_baud: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: Vec::new(),
            xon_char: DEFAULT_XON,
            xoff_char: DEFAULT_XOFF,
            rs485: Rs485Settings::default(),
        }
    }
}

impl SerialConfig {
    /// The configured line settings at the default baud rate.
    pub fn configuration(&self) -> SerialConfiguration {
        self.configuration_at(self.default_baud)
    }

    /// The configured line settings at `baud_rate`.
    pub fn configuration_at(&self, baud_rate: u32) -> SerialConfiguration {
        let flow = self
            .flow_control
            .iter()
            .fold(FlowControl::empty(), |mask, flag| mask | flag.mask());
        SerialConfiguration::new(baud_rate)
            .with_frame(self.data_bits, self.parity, self.stop_bits)
            .with_flow_control(flow)
            .with_flow_characters(self.xon_char, self.xoff_char)
            .with_rs485(self.rs485)
    }
}

/// One flow-control signal as written in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowFlag {
    Rts,
    Cts,
    Dsr,
    Dtr,
    XonxoffIn,
    XonxoffOut,
}

impl FlowFlag {
    pub fn mask(self) -> FlowControl {
        match self {
            Self::Rts => FlowControl::RTS,
            Self::Cts => FlowControl::CTS,
            Self::Dsr => FlowControl::DSR,
            Self::Dtr => FlowControl::DTR,
            Self::XonxoffIn => FlowControl::XONXOFF_IN,
            Self::XonxoffOut => FlowControl::XONXOFF_OUT,
        }
    }
}

/// Timeout configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub read_mode: ReadMode,
    /// Read timeout in milliseconds (0 waits indefinitely)
    pub read_timeout_ms: u32,
    pub write_mode: WriteMode,
    /// Write timeout in milliseconds (0 waits indefinitely)
    pub write_timeout_ms: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_mode: ReadMode::SemiBlocking,
            read_timeout_ms: 1000,
            write_mode: WriteMode::Blocking,
            write_timeout_ms: 0,
        }
    }
}

impl TimeoutConfig {
    pub fn descriptor(&self) -> TimeoutDescriptor {
        TimeoutDescriptor {
            read_mode: self.read_mode,
            write_mode: self.write_mode,
            read_timeout_ms: self.read_timeout_ms,
            write_timeout_ms: self.write_timeout_ms,
            ..TimeoutDescriptor::default()
        }
    }
}

/// Event waiting configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Bound on one event wait in milliseconds (1..=1000)
    pub tick_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_EVENT_TICK.as_millis() as u64,
        }
    }
}

impl EventsConfig {
    /// Get the event tick as Duration
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Device discovery configuration section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Friendly names for device paths
    pub aliases: HashMap<String, String>,
    /// Paths never listed by enumeration
    pub exclude: Vec<String>,
}

impl RegistryConfig {
    /// Map an alias to its device path; other names pass through
    pub fn resolve_port(&self, name: &str) -> String {
        self.aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive such as `"info"` or `"serial_transport=debug"`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Multi-line, human oriented
    Pretty,
    /// Compact format
    #[default]
    Compact,
}
