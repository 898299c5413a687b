//! Port abstraction layer for serial communication.
//!
//! Line settings, their translation to wire-level values, the timeout policy,
//! and the [`SerialDevice`] backends (termios, the `serialport` crate, and an
//! in-memory bus for tests).

pub mod device;
pub mod mock;
pub mod portable;
pub mod settings;
pub mod timeout;
pub mod translate;

#[cfg(unix)]
pub mod posix;

pub use device::{DeviceOpener, LineStatus, OutputLine, Queue, SerialDevice, SystemOpener};
pub use mock::{MockBus, MockLine};
pub use portable::PortableDevice;
pub use settings::*;
pub use timeout::*;
pub use translate::{
    custom_divisor, decode_flow_control, decode_frame, encode_flow_control, encode_frame,
    encode_rs485, select_baud, standard_baud_code, translate, BaudCode, BaudSelection, Divisor,
    FlowBits, FrameBits, Rs485Descriptor, WireSettings,
};

#[cfg(unix)]
pub use posix::PosixDevice;

/// Opens devices through the `serialport` crate on every platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortableOpener;

impl DeviceOpener for PortableOpener {
    fn open(
        &self,
        path: &str,
    ) -> Result<std::sync::Arc<dyn SerialDevice>, crate::error::OpenError> {
        Ok(std::sync::Arc::new(PortableDevice::open(path)?))
    }
}
