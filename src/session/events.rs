//! Waiting for serial events on an open session.

use super::PortSession;
use crate::error::{ErrorSite, IoError};
use crate::port::{EventMask, LineStatus, SerialDevice};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Default bound on a single wait; also how often modem lines are sampled.
pub const DEFAULT_EVENT_TICK: Duration = Duration::from_millis(500);

const MAX_EVENT_TICK: Duration = Duration::from_secs(1);

/// Blocks until one of the session's monitored events fires.
///
/// Waits run only while the session's listening flag is set. Modem-line
/// changes are detected by comparing samples taken once per tick, so a line
/// that toggles and returns within one tick is missed.
#[derive(Debug)]
pub struct EventWaiter {
    session: PortSession,
    tick: Duration,
    lines: Option<LineStatus>,
}

impl EventWaiter {
    pub fn new(session: &PortSession) -> Self {
        Self {
            session: session.clone(),
            tick: DEFAULT_EVENT_TICK,
            lines: None,
        }
    }

    /// Use a different wait tick, capped at one second.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.clamp(Duration::from_millis(1), MAX_EVENT_TICK);
        self
    }

    pub fn session(&self) -> &PortSession {
        &self.session
    }

    /// Wait until `deadline` (or forever) for an event.
    ///
    /// Returns the events that fired, restricted to the monitored mask.
    /// An empty mask means the wait timed out or listening was switched off.
    /// A device that vanishes is reported as `PORT_DISCONNECTED`.
    pub fn wait_for_event(&mut self, deadline: Option<Instant>) -> EventMask {
        let interest = self.session.event_interest();
        loop {
            if !self.session.is_listening() {
                return EventMask::TIMED_OUT;
            }
            let device = match self.session.device() {
                Ok(device) => device,
                Err(IoError::DeviceLost { .. }) => return EventMask::PORT_DISCONNECTED,
                Err(_) => return EventMask::TIMED_OUT,
            };

            let mut events = self.session.take_pending_events();
            events |= self.sample_lines(device.as_ref());
            match device.take_line_errors() {
                Ok(errors) => events |= errors,
                Err(e) => trace!("{}: line error query failed: {}", self.session.path(), e),
            }
            let events = events & interest;
            if !events.is_empty() {
                debug!("{}: events {:?}", self.session.path(), events);
                return events;
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return EventMask::TIMED_OUT;
                    }
                    (deadline - now).min(self.tick)
                }
                None => self.tick,
            };
            match device.wait_readable(wait) {
                Ok(true) if interest.contains(EventMask::DATA_AVAILABLE) => {
                    return EventMask::DATA_AVAILABLE;
                }
                // Unread data keeps the device readable; sleep instead of spinning.
                Ok(true) => std::thread::sleep(wait),
                Ok(false) => {}
                Err(e) => {
                    self.session.fail(ErrorSite::Wait, e, 0);
                    return EventMask::PORT_DISCONNECTED;
                }
            }
        }
    }

    fn sample_lines(&mut self, device: &dyn SerialDevice) -> EventMask {
        let Ok(now) = device.line_status() else {
            return EventMask::empty();
        };
        let changes = self
            .lines
            .map(|previous| now.changes_since(&previous))
            .unwrap_or_default();
        self.lines = Some(now);
        changes
    }
}
