//! Translation of [`SerialConfiguration`] into wire-level control values.
//!
//! Everything here is pure: the backends take a [`WireSettings`] and push it
//! into termios, a DCB or the mock bus without interpreting the user-facing
//! types again.

use super::settings::{DataBits, FlowControl, Parity, Rs485Settings, SerialConfiguration, StopBits};
use bitflags::bitflags;

#[cfg(unix)]
type NativeSpeed = libc::speed_t;
#[cfg(not(unix))]
type NativeSpeed = u32;

/// Platform speed constant for a named baud rate.
///
/// On POSIX targets this is the termios `Bxxx` value; elsewhere it is the
/// `CBR_xxx` rate, which equals the rate itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaudCode(NativeSpeed);

impl BaudCode {
    pub fn raw(self) -> NativeSpeed {
        self.0
    }
}

/// Look up the platform's named code for `rate`.
#[cfg(unix)]
pub fn standard_baud_code(rate: u32) -> Option<BaudCode> {
    let code = match rate {
        50 => libc::B50,
        75 => libc::B75,
        110 => libc::B110,
        134 => libc::B134,
        150 => libc::B150,
        200 => libc::B200,
        300 => libc::B300,
        600 => libc::B600,
        1200 => libc::B1200,
        1800 => libc::B1800,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        460800 => libc::B460800,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        500000 => libc::B500000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        576000 => libc::B576000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        921600 => libc::B921600,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        1000000 => libc::B1000000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        1152000 => libc::B1152000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        1500000 => libc::B1500000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        2000000 => libc::B2000000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        2500000 => libc::B2500000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        3000000 => libc::B3000000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        3500000 => libc::B3500000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        4000000 => libc::B4000000,
        _ => return None,
    };
    Some(BaudCode(code))
}

/// Look up the platform's named code for `rate`.
#[cfg(not(unix))]
pub fn standard_baud_code(rate: u32) -> Option<BaudCode> {
    const NAMED: [u32; 14] = [
        110, 300, 600, 1200, 2400, 4800, 9600, 14400, 19200, 38400, 57600, 115200, 128000, 256000,
    ];
    NAMED.contains(&rate).then_some(BaudCode(rate))
}

/// Clock divisor for a synthesized baud rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Divisor(u32);

impl Divisor {
    pub fn get(self) -> u32 {
        self.0
    }
}

/// `round(base_clock / rate)`, never below 1.
pub fn custom_divisor(rate: u32, base_clock: u32) -> Divisor {
    let rate = u64::from(rate.max(1));
    let base = u64::from(base_clock);
    let rounded = (base + rate / 2) / rate;
    Divisor(rounded.clamp(1, u64::from(u32::MAX)) as u32)
}

/// How a session reaches its requested rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudSelection {
    /// A named platform rate.
    Standard(BaudCode),
    /// A rate the backend must synthesize (divisor or arbitrary-speed ioctl).
    Custom(u32),
}

impl BaudSelection {
    /// Custom rates run the UART in low-latency mode.
    pub fn low_latency(&self) -> bool {
        matches!(self, Self::Custom(_))
    }
}

/// Standard code first, synthesis otherwise.
pub fn select_baud(rate: u32) -> BaudSelection {
    match standard_baud_code(rate) {
        Some(code) => BaudSelection::Standard(code),
        None => BaudSelection::Custom(rate),
    }
}

bitflags! {
    /// Character framing in termios `c_cflag` layout.
    ///
    /// `STOP_ONE_HALF` has no termios counterpart; backends that cannot
    /// produce 1.5 stop bits fall back to one.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameBits: u32 {
        const CS6 = 0x01;
        const CS7 = 0x02;
        const CS8 = 0x03;
        const CSIZE = 0x03;
        const CSTOPB = 0x04;
        const STOP_ONE_HALF = 0x08;
        const PARENB = 0x10;
        const PARODD = 0x20;
        const CMSPAR = 0x40;
    }
}

impl FrameBits {
    pub fn data_bits(self) -> DataBits {
        match self.bits() & Self::CSIZE.bits() {
            0x00 => DataBits::Five,
            0x01 => DataBits::Six,
            0x02 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }

    pub fn stop_bits(self) -> StopBits {
        if self.contains(Self::STOP_ONE_HALF) {
            StopBits::OnePointFive
        } else if self.contains(Self::CSTOPB) {
            StopBits::Two
        } else {
            StopBits::One
        }
    }

    pub fn parity(self) -> Parity {
        if !self.contains(Self::PARENB) {
            return Parity::None;
        }
        match (self.contains(Self::CMSPAR), self.contains(Self::PARODD)) {
            (false, true) => Parity::Odd,
            (false, false) => Parity::Even,
            (true, true) => Parity::Mark,
            (true, false) => Parity::Space,
        }
    }
}

pub fn encode_frame(data_bits: DataBits, stop_bits: StopBits, parity: Parity) -> FrameBits {
    let mut bits = match data_bits {
        DataBits::Five => FrameBits::empty(),
        DataBits::Six => FrameBits::CS6,
        DataBits::Seven => FrameBits::CS7,
        DataBits::Eight => FrameBits::CS8,
    };
    match stop_bits {
        StopBits::One => {}
        StopBits::OnePointFive => bits |= FrameBits::STOP_ONE_HALF,
        StopBits::Two => bits |= FrameBits::CSTOPB,
    }
    bits |= match parity {
        Parity::None => FrameBits::empty(),
        Parity::Odd => FrameBits::PARENB | FrameBits::PARODD,
        Parity::Even => FrameBits::PARENB,
        Parity::Mark => FrameBits::PARENB | FrameBits::CMSPAR | FrameBits::PARODD,
        Parity::Space => FrameBits::PARENB | FrameBits::CMSPAR,
    };
    bits
}

pub fn decode_frame(bits: FrameBits) -> (DataBits, StopBits, Parity) {
    (bits.data_bits(), bits.stop_bits(), bits.parity())
}

bitflags! {
    /// Flow control in DCB field layout. Hardware and software handshakes
    /// are independent bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FlowBits: u32 {
        const OUT_CTS = 0x01;
        const RTS_HANDSHAKE = 0x02;
        const OUT_DSR = 0x04;
        const DTR_HANDSHAKE = 0x08;
        const IN_X = 0x10;
        const OUT_X = 0x20;
    }
}

impl FlowBits {
    /// termios has a single CRTSCTS switch for both directions.
    pub fn rts_cts(self) -> bool {
        self.intersects(Self::OUT_CTS | Self::RTS_HANDSHAKE)
    }

    pub fn dsr_dtr(self) -> bool {
        self.intersects(Self::OUT_DSR | Self::DTR_HANDSHAKE)
    }
}

const FLOW_MAP: [(FlowControl, FlowBits); 6] = [
    (FlowControl::RTS, FlowBits::RTS_HANDSHAKE),
    (FlowControl::CTS, FlowBits::OUT_CTS),
    (FlowControl::DSR, FlowBits::OUT_DSR),
    (FlowControl::DTR, FlowBits::DTR_HANDSHAKE),
    (FlowControl::XONXOFF_IN, FlowBits::IN_X),
    (FlowControl::XONXOFF_OUT, FlowBits::OUT_X),
];

pub fn encode_flow_control(mask: FlowControl) -> FlowBits {
    FLOW_MAP
        .iter()
        .filter(|(flag, _)| mask.contains(*flag))
        .fold(FlowBits::empty(), |acc, (_, bit)| acc | *bit)
}

pub fn decode_flow_control(bits: FlowBits) -> FlowControl {
    FLOW_MAP
        .iter()
        .filter(|(_, bit)| bits.contains(*bit))
        .fold(FlowControl::empty(), |acc, (flag, _)| acc | *flag)
}

/// Driver-facing RS-485 control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rs485Descriptor {
    pub enabled: bool,
    pub rts_on_send: bool,
    pub rts_after_send: bool,
    pub terminate_bus: bool,
    pub rx_during_tx: bool,
    pub delay_before_send_ms: u32,
    pub delay_after_send_ms: u32,
}

/// Microsecond delays become whole milliseconds, truncating.
pub fn encode_rs485(params: &Rs485Settings) -> Rs485Descriptor {
    Rs485Descriptor {
        enabled: params.enabled,
        rts_on_send: params.rts_active_high,
        rts_after_send: !params.rts_active_high,
        terminate_bus: params.termination,
        rx_during_tx: params.rx_during_tx,
        delay_before_send_ms: params.delay_before_send_us / 1000,
        delay_after_send_ms: params.delay_after_send_us / 1000,
    }
}

/// Everything a backend needs to program the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireSettings {
    pub baud_rate: u32,
    pub baud: BaudSelection,
    pub frame: FrameBits,
    pub flow: FlowBits,
    pub rs485: Rs485Descriptor,
    pub xon_char: u8,
    pub xoff_char: u8,
}

impl WireSettings {
    /// Reconstruct the user-facing configuration these settings came from.
    pub fn to_configuration(&self, rs485: Rs485Settings) -> SerialConfiguration {
        let (data_bits, stop_bits, parity) = decode_frame(self.frame);
        SerialConfiguration {
            baud_rate: self.baud_rate,
            data_bits,
            stop_bits,
            parity,
            flow_control: decode_flow_control(self.flow),
            rs485,
            xon_char: self.xon_char,
            xoff_char: self.xoff_char,
        }
    }
}

pub fn translate(config: &SerialConfiguration) -> WireSettings {
    WireSettings {
        baud_rate: config.baud_rate,
        baud: select_baud(config.baud_rate),
        frame: encode_frame(config.data_bits, config.stop_bits, config.parity),
        flow: encode_flow_control(config.flow_control),
        rs485: encode_rs485(&config.rs485),
        xon_char: config.xon_char,
        xoff_char: config.xoff_char,
    }
}
