//! Line settings applied to a session.
//!
//! A [`SerialConfiguration`] is an immutable snapshot: applying one replaces
//! whatever was configured before as a whole.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default XON character (DC1).
pub const DEFAULT_XON: u8 = 0x11;
/// Default XOFF character (DC3).
pub const DEFAULT_XOFF: u8 = 0x13;

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl DataBits {
    pub const ALL: [DataBits; 4] = [Self::Five, Self::Six, Self::Seven, Self::Eight];

    pub fn bits(self) -> u8 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }
}

impl TryFrom<u8> for DataBits {
    type Error = InvalidSetting;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            5 => Ok(Self::Five),
            6 => Ok(Self::Six),
            7 => Ok(Self::Seven),
            8 => Ok(Self::Eight),
            other => Err(InvalidSetting::DataBits(other)),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> Self {
        bits.bits()
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopBits {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    Two,
}

impl StopBits {
    pub const ALL: [StopBits; 3] = [Self::One, Self::OnePointFive, Self::Two];
}

/// Parity checking modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    pub const ALL: [Parity; 5] = [Self::None, Self::Odd, Self::Even, Self::Mark, Self::Space];
}

bitflags! {
    /// Flow control lines and software handshaking, combinable freely.
    ///
    /// An empty mask disables flow control.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FlowControl: u32 {
        const RTS = 0x0000_0001;
        const CTS = 0x0000_0010;
        const DSR = 0x0000_0100;
        const DTR = 0x0000_1000;
        const XONXOFF_IN = 0x0001_0000;
        const XONXOFF_OUT = 0x0010_0000;
    }
}

impl FlowControl {
    /// RTS/CTS hardware handshaking in both directions.
    pub const HARDWARE: FlowControl = FlowControl::RTS.union(FlowControl::CTS);
    /// XON/XOFF in both directions.
    pub const SOFTWARE: FlowControl = FlowControl::XONXOFF_IN.union(FlowControl::XONXOFF_OUT);
}

/// RS-485 half-duplex driver control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Rs485Settings {
    pub enabled: bool,
    /// Drive RTS high while transmitting (low when false).
    pub rts_active_high: bool,
    /// Enable the bus termination resistor where the driver supports it.
    pub termination: bool,
    /// Keep the receiver enabled while transmitting.
    pub rx_during_tx: bool,
    pub delay_before_send_us: u32,
    pub delay_after_send_us: u32,
}

impl Rs485Settings {
    /// RS-485 mode with RTS asserted while sending and no delays.
    pub fn active_high() -> Self {
        Self {
            enabled: true,
            rts_active_high: true,
            ..Self::default()
        }
    }
}

/// Settings rejected before they ever reach a device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidSetting {
    #[error("baud rate must be greater than zero")]
    ZeroBaudRate,

    #[error("unsupported number of data bits: {0}")]
    DataBits(u8),

    #[error("XON and XOFF characters must differ (both are {0:#04x})")]
    DuplicateFlowCharacters(u8),
}

/// Complete line configuration for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConfiguration {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
    pub rs485: Rs485Settings,
    pub xon_char: u8,
    pub xoff_char: u8,
}

impl Default for SerialConfiguration {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::empty(),
            rs485: Rs485Settings::default(),
            xon_char: DEFAULT_XON,
            xoff_char: DEFAULT_XOFF,
        }
    }
}

impl SerialConfiguration {
    /// 8N1 at the given rate, no flow control.
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Self::default()
        }
    }

    pub fn with_frame(mut self, data_bits: DataBits, parity: Parity, stop_bits: StopBits) -> Self {
        self.data_bits = data_bits;
        self.parity = parity;
        self.stop_bits = stop_bits;
        self
    }

    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    pub fn with_rs485(mut self, rs485: Rs485Settings) -> Self {
        self.rs485 = rs485;
        self
    }

    pub fn with_flow_characters(mut self, xon: u8, xoff: u8) -> Self {
        self.xon_char = xon;
        self.xoff_char = xoff;
        self
    }

    /// Reject settings no device could accept.
    pub fn validate(&self) -> Result<(), InvalidSetting> {
        if self.baud_rate == 0 {
            return Err(InvalidSetting::ZeroBaudRate);
        }
        let software = self.flow_control.intersects(FlowControl::SOFTWARE);
        if software && self.xon_char == self.xoff_char {
            return Err(InvalidSetting::DuplicateFlowCharacters(self.xon_char));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration() {
        let config = SerialConfiguration::default();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.parity, Parity::None);
        assert!(config.flow_control.is_empty());
        assert!(!config.rs485.enabled);
        assert_eq!(config.xon_char, 0x11);
        assert_eq!(config.xoff_char, 0x13);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flow_control_bit_values() {
        assert_eq!(FlowControl::RTS.bits(), 0x1);
        assert_eq!(FlowControl::CTS.bits(), 0x10);
        assert_eq!(FlowControl::DSR.bits(), 0x100);
        assert_eq!(FlowControl::DTR.bits(), 0x1000);
        assert_eq!(FlowControl::XONXOFF_IN.bits(), 0x10000);
        assert_eq!(FlowControl::XONXOFF_OUT.bits(), 0x100000);
        assert_eq!(FlowControl::HARDWARE.bits(), 0x11);
    }

    #[test]
    fn test_validate_rejects_zero_baud() {
        let config = SerialConfiguration::new(0);
        assert_eq!(config.validate(), Err(InvalidSetting::ZeroBaudRate));
    }

    #[test]
    fn test_validate_rejects_identical_flow_chars() {
        let config = SerialConfiguration::new(9600)
            .with_flow_control(FlowControl::XONXOFF_IN)
            .with_flow_characters(0x11, 0x11);
        assert_eq!(
            config.validate(),
            Err(InvalidSetting::DuplicateFlowCharacters(0x11))
        );
    }

    #[test]
    fn test_validate_ignores_flow_chars_without_software_flow() {
        let config = SerialConfiguration::new(9600)
            .with_flow_control(FlowControl::HARDWARE)
            .with_flow_characters(0x00, 0x00);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_data_bits_from_number() {
        assert_eq!(DataBits::try_from(7), Ok(DataBits::Seven));
        assert_eq!(DataBits::try_from(9), Err(InvalidSetting::DataBits(9)));
    }

    #[test]
    fn test_stop_bits_serde_names() {
        let json = serde_json::to_string(&StopBits::OnePointFive).unwrap();
        assert_eq!(json, "\"1.5\"");

        let parsed: Parity = serde_json::from_str("\"space\"").unwrap();
        assert_eq!(parsed, Parity::Space);
    }
}
