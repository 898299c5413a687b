//! Modem-line control and status for an open session.
//!
//! Failures here are recorded in the session's error state and returned, but
//! the session stays open.

use super::PortSession;
use crate::error::{ControlError, ErrorSite};
use crate::port::{LineStatus, OutputLine};
use std::time::Duration;
use tracing::debug;

impl PortSession {
    pub fn set_rts(&self) -> Result<(), ControlError> {
        self.drive("set_rts", OutputLine::Rts, true)
    }

    pub fn clear_rts(&self) -> Result<(), ControlError> {
        self.drive("clear_rts", OutputLine::Rts, false)
    }

    pub fn set_dtr(&self) -> Result<(), ControlError> {
        self.drive("set_dtr", OutputLine::Dtr, true)
    }

    pub fn clear_dtr(&self) -> Result<(), ControlError> {
        self.drive("clear_dtr", OutputLine::Dtr, false)
    }

    /// Hold the transmit line in the break condition until [`clear_break`](Self::clear_break).
    pub fn set_break(&self) -> Result<(), ControlError> {
        self.break_condition("set_break", true)
    }

    pub fn clear_break(&self) -> Result<(), ControlError> {
        self.break_condition("clear_break", false)
    }

    /// Assert break for `duration`, then release it.
    pub fn send_break(&self, duration: Duration) -> Result<(), ControlError> {
        self.set_break()?;
        std::thread::sleep(duration);
        self.clear_break()
    }

    pub fn cts(&self) -> Result<bool, ControlError> {
        Ok(self.line_status()?.cts)
    }

    pub fn dsr(&self) -> Result<bool, ControlError> {
        Ok(self.line_status()?.dsr)
    }

    /// Data carrier detect.
    pub fn dcd(&self) -> Result<bool, ControlError> {
        Ok(self.line_status()?.dcd)
    }

    /// Ring indicator.
    pub fn ri(&self) -> Result<bool, ControlError> {
        Ok(self.line_status()?.ri)
    }

    pub fn rts(&self) -> Result<bool, ControlError> {
        Ok(self.line_status()?.rts)
    }

    pub fn dtr(&self) -> Result<bool, ControlError> {
        Ok(self.line_status()?.dtr)
    }

    /// All modem lines in one query.
    pub fn line_status(&self) -> Result<LineStatus, ControlError> {
        let device = self.control_device()?;
        device
            .line_status()
            .map_err(|e| self.control_failed("line_status", e))
    }

    fn drive(&self, operation: &'static str, line: OutputLine, level: bool) -> Result<(), ControlError> {
        let device = self.control_device()?;
        device
            .set_line(line, level)
            .map_err(|e| self.control_failed(operation, e))?;
        debug!("{}: {:?} -> {}", self.path(), line, level);
        Ok(())
    }

    fn break_condition(&self, operation: &'static str, active: bool) -> Result<(), ControlError> {
        let device = self.control_device()?;
        device
            .set_break(active)
            .map_err(|e| self.control_failed(operation, e))
    }

    fn control_failed(&self, operation: &'static str, err: std::io::Error) -> ControlError {
        self.record(ErrorSite::Control, &err);
        debug!("{}: {} failed: {}", self.path(), operation, err);
        ControlError::from_io(operation, err)
    }
}
