//! Background event delivery for a session.
//!
//! A listener runs an [`EventWaiter`] on its own thread and hands every event
//! to a [`DataListener`]. When the listener asks for `DATA_RECEIVED`, incoming
//! bytes are read on that thread and delivered as raw chunks, fixed-size
//! packets or delimiter-framed messages.
//!
//! # Example
//! ```
//! use serial_transport::listener::{FnListener, Framing};
//! use serial_transport::port::MockBus;
//! use serial_transport::{EventMask, PortSession, SerialConfiguration, TimeoutDescriptor};
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! let bus = MockBus::new();
//! let line = bus.plug("MOCK0");
//! let session = PortSession::open_with(
//!     &bus,
//!     "MOCK0",
//!     SerialConfiguration::new(9600),
//!     TimeoutDescriptor::nonblocking(),
//! )
//! .unwrap();
//!
//! let (tx, rx) = mpsc::channel();
//! let listener = FnListener::new(EventMask::DATA_RECEIVED, move |event| {
//!     let _ = tx.send(event.data);
//! })
//! .with_framing(Framing::delimited_at_end(b"\r\n"));
//! let handle = session.add_data_listener(listener).unwrap();
//!
//! line.inject(b"OK\r\nERR");
//! assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"OK\r\n");
//! handle.stop();
//! ```

use crate::error::IoError;
use crate::port::{EventMask, TimeoutDescriptor};
use crate::session::{EventWaiter, PortSession, DEFAULT_EVENT_TICK};
use memchr::memmem;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

// ============================================================================
// Events and framing
// ============================================================================

/// One delivery to a [`DataListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialEvent {
    /// The events that fired. `DATA_RECEIVED` for data deliveries.
    pub kind: EventMask,
    /// Received bytes; empty for everything but `DATA_RECEIVED`.
    pub data: Vec<u8>,
}

impl SerialEvent {
    fn received(data: Vec<u8>) -> Self {
        Self {
            kind: EventMask::DATA_RECEIVED,
            data,
        }
    }

    fn signal(kind: EventMask) -> Self {
        Self {
            kind,
            data: Vec::new(),
        }
    }
}

/// How received bytes are cut into `DATA_RECEIVED` deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Framing {
    /// Whatever each read returned.
    #[default]
    Raw,
    /// Exactly this many bytes per delivery.
    Packet(usize),
    /// Messages separated by `delimiter`, which is kept in the message.
    /// With `at_end` the delimiter closes a message; otherwise it opens one
    /// and bytes before the first delimiter are dropped.
    Delimited { delimiter: Vec<u8>, at_end: bool },
}

impl Framing {
    pub fn delimited_at_end(delimiter: &[u8]) -> Self {
        Self::Delimited {
            delimiter: delimiter.to_vec(),
            at_end: true,
        }
    }

    pub fn delimited_at_start(delimiter: &[u8]) -> Self {
        Self::Delimited {
            delimiter: delimiter.to_vec(),
            at_end: false,
        }
    }
}

/// Accumulates received bytes and yields complete frames.
#[derive(Debug)]
struct Framer {
    framing: Framing,
    pending: Vec<u8>,
}

impl Framer {
    fn new(framing: Framing) -> Self {
        Self {
            framing,
            pending: Vec::new(),
        }
    }

    fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        match &self.framing {
            Framing::Raw => {
                if !data.is_empty() {
                    frames.push(data.to_vec());
                }
            }
            Framing::Packet(0) => {}
            Framing::Packet(size) => {
                self.pending.extend_from_slice(data);
                while self.pending.len() >= *size {
                    frames.push(self.pending.drain(..*size).collect());
                }
            }
            Framing::Delimited { delimiter, .. } if delimiter.is_empty() => {
                if !data.is_empty() {
                    frames.push(data.to_vec());
                }
            }
            Framing::Delimited {
                delimiter,
                at_end: true,
            } => {
                self.pending.extend_from_slice(data);
                let finder = memmem::Finder::new(delimiter);
                while let Some(index) = finder.find(&self.pending) {
                    let end = index + delimiter.len();
                    frames.push(self.pending.drain(..end).collect());
                }
            }
            Framing::Delimited {
                delimiter,
                at_end: false,
            } => {
                self.pending.extend_from_slice(data);
                let finder = memmem::Finder::new(delimiter);
                match finder.find(&self.pending) {
                    Some(0) => {}
                    Some(index) => {
                        self.pending.drain(..index);
                    }
                    None => {
                        // Keep a possible partial delimiter at the tail.
                        let keep = delimiter.len() - 1;
                        let cut = self.pending.len().saturating_sub(keep);
                        self.pending.drain(..cut);
                        return frames;
                    }
                }
                while let Some(next) = finder.find(&self.pending[delimiter.len()..]) {
                    let end = delimiter.len() + next;
                    frames.push(self.pending.drain(..end).collect());
                }
            }
        }
        frames
    }
}

// ============================================================================
// Listener API
// ============================================================================

/// Receives events from a session's listener thread.
pub trait DataListener: Send + 'static {
    /// Events to deliver. Include `DATA_RECEIVED` to receive bytes.
    fn listening_events(&self) -> EventMask;

    fn framing(&self) -> Framing {
        Framing::Raw
    }

    fn on_event(&mut self, event: SerialEvent);
}

/// A [`DataListener`] built from a closure.
pub struct FnListener<F> {
    events: EventMask,
    framing: Framing,
    callback: F,
}

impl<F> FnListener<F>
where
    F: FnMut(SerialEvent) + Send + 'static,
{
    pub fn new(events: EventMask, callback: F) -> Self {
        Self {
            events,
            framing: Framing::Raw,
            callback,
        }
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }
}

impl<F> DataListener for FnListener<F>
where
    F: FnMut(SerialEvent) + Send + 'static,
{
    fn listening_events(&self) -> EventMask {
        self.events
    }

    fn framing(&self) -> Framing {
        self.framing.clone()
    }

    fn on_event(&mut self, event: SerialEvent) {
        (self.callback)(event)
    }
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("A listener is already running on this port")]
    AlreadyListening,

    #[error("Port is closed")]
    Closed,

    #[error("Failed to start listener thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A running listener. Stopping (or dropping) it clears the listening flag,
/// joins the thread and restores the timeouts in effect before it started.
#[derive(Debug)]
pub struct ListenerHandle {
    session: PortSession,
    previous: TimeoutDescriptor,
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// Whether the listener thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.session.set_listening(false);
        if thread.join().is_err() {
            warn!("{}: listener thread panicked", self.session.path());
        }
        if self.session.is_open() {
            if let Err(e) = self.session.set_timeouts(self.previous) {
                debug!("{}: could not restore timeouts: {}", self.session.path(), e);
            }
        }
        info!("{}: listener stopped", self.session.path());
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PortSession {
    /// Start delivering events to `listener` on a dedicated thread.
    ///
    /// Only one listener may run per session.
    pub fn add_data_listener<L: DataListener>(
        &self,
        listener: L,
    ) -> Result<ListenerHandle, ListenerError> {
        self.add_data_listener_with_tick(listener, DEFAULT_EVENT_TICK)
    }

    /// Like [`add_data_listener`](Self::add_data_listener) with a custom
    /// event wait tick, which bounds how long stopping takes.
    pub fn add_data_listener_with_tick<L: DataListener>(
        &self,
        listener: L,
        tick: Duration,
    ) -> Result<ListenerHandle, ListenerError> {
        if !self.is_open() {
            return Err(ListenerError::Closed);
        }
        if !self.claim_listening() {
            return Err(ListenerError::AlreadyListening);
        }

        let previous = self.timeouts();
        if self
            .set_monitored_events(listener.listening_events())
            .is_err()
        {
            self.set_listening(false);
            return Err(ListenerError::Closed);
        }

        let session = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("serial-listener-{}", self.path()))
            .spawn(move || run(session, listener, tick));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.set_listening(false);
                // Best effort: the session may have closed meanwhile.
                let _ = self.set_timeouts(previous);
                return Err(ListenerError::Spawn(e));
            }
        };

        info!("{}: listener started", self.path());
        Ok(ListenerHandle {
            session: self.clone(),
            previous,
            thread: Some(thread),
        })
    }
}

fn run<L: DataListener>(session: PortSession, mut listener: L, tick: Duration) {
    let wanted = listener.listening_events();
    let mut framer = Framer::new(listener.framing());
    let mut waiter = EventWaiter::new(&session).with_tick(tick);

    while session.is_listening() {
        let mut events = waiter.wait_for_event(None);
        if events.is_empty() {
            continue;
        }

        if events.contains(EventMask::DATA_AVAILABLE) && wanted.contains(EventMask::DATA_RECEIVED)
        {
            events.remove(EventMask::DATA_AVAILABLE | EventMask::DATA_RECEIVED);
            while session.is_listening() {
                let available = session.bytes_available();
                if available <= 0 {
                    break;
                }
                match session.read(available as usize) {
                    Ok(data) => {
                        for frame in framer.push(&data) {
                            listener.on_event(SerialEvent::received(frame));
                        }
                    }
                    Err(IoError::DeviceLost { partial, .. }) => {
                        for frame in framer.push(&partial) {
                            listener.on_event(SerialEvent::received(frame));
                        }
                        events |= EventMask::PORT_DISCONNECTED;
                        break;
                    }
                    Err(_) => break,
                }
            }
        }

        let disconnected = events.contains(EventMask::PORT_DISCONNECTED);
        let deliver = events & wanted;
        if !deliver.is_empty() {
            listener.on_event(SerialEvent::signal(deliver));
        }
        if disconnected {
            break;
        }
    }
    debug!("{}: listener thread exiting", session.path());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{MockBus, MockLine, SerialConfiguration};
    use pretty_assertions::assert_eq;
    use std::sync::mpsc::{self, Receiver};
    use std::time::Instant;

    const TICK: Duration = Duration::from_millis(20);
    const WAIT: Duration = Duration::from_secs(2);

    fn open() -> (MockBus, MockLine, PortSession) {
        let bus = MockBus::new();
        let line = bus.plug("MOCK0");
        let session = PortSession::open_with(
            &bus,
            "MOCK0",
            SerialConfiguration::new(9600),
            TimeoutDescriptor::blocking(250),
        )
        .unwrap();
        (bus, line, session)
    }

    fn channel_listener(
        events: EventMask,
        framing: Framing,
    ) -> (impl DataListener, Receiver<SerialEvent>) {
        let (tx, rx) = mpsc::channel();
        let listener = FnListener::new(events, move |event| {
            let _ = tx.send(event);
        })
        .with_framing(framing);
        (listener, rx)
    }

    // ========================================================================
    // Framing
    // ========================================================================

    #[test]
    fn test_packet_framing_splits_and_buffers() {
        let mut framer = Framer::new(Framing::Packet(3));

        assert_eq!(framer.push(b"ab"), Vec::<Vec<u8>>::new());
        assert_eq!(framer.push(b"cdefg"), vec![b"abc".to_vec(), b"def".to_vec()]);
        assert_eq!(framer.push(b"hi"), vec![b"ghi".to_vec()]);
    }

    #[test]
    fn test_delimited_at_end_keeps_delimiter() {
        let mut framer = Framer::new(Framing::delimited_at_end(b"\r\n"));

        assert_eq!(framer.push(b"one\r"), Vec::<Vec<u8>>::new());
        assert_eq!(
            framer.push(b"\ntwo\r\nthr"),
            vec![b"one\r\n".to_vec(), b"two\r\n".to_vec()]
        );
        assert_eq!(framer.push(b"ee\r\n"), vec![b"three\r\n".to_vec()]);
    }

    #[test]
    fn test_delimited_at_start_drops_leading_noise() {
        let mut framer = Framer::new(Framing::delimited_at_start(b"$"));

        assert_eq!(framer.push(b"noise$GP"), Vec::<Vec<u8>>::new());
        assert_eq!(framer.push(b"GGA$GPR"), vec![b"$GPGGA".to_vec()]);
        assert_eq!(framer.push(b"MC$"), vec![b"$GPRMC".to_vec()]);
    }

    #[test]
    fn test_delimited_at_start_keeps_partial_delimiter() {
        let mut framer = Framer::new(Framing::delimited_at_start(b"<<"));

        assert!(framer.push(b"xx<").is_empty());
        assert!(framer.push(b"<a").is_empty());
        assert_eq!(framer.push(b"<<"), vec![b"<<a".to_vec()]);
    }

    #[test]
    fn test_raw_framing_passes_chunks() {
        let mut framer = Framer::new(Framing::Raw);

        assert_eq!(framer.push(b"xyz"), vec![b"xyz".to_vec()]);
        assert!(framer.push(b"").is_empty());
    }

    // ========================================================================
    // Listener thread
    // ========================================================================

    #[test]
    fn test_delivers_received_data() {
        let (_bus, line, session) = open();
        let (listener, rx) = channel_listener(EventMask::DATA_RECEIVED, Framing::Raw);
        let handle = session.add_data_listener_with_tick(listener, TICK).unwrap();

        line.inject(b"hello");
        let event = rx.recv_timeout(WAIT).unwrap();

        assert_eq!(event.kind, EventMask::DATA_RECEIVED);
        assert_eq!(event.data, b"hello");
        handle.stop();
    }

    #[test]
    fn test_second_listener_rejected() {
        let (_bus, _line, session) = open();
        let (first, _rx1) = channel_listener(EventMask::DATA_RECEIVED, Framing::Raw);
        let (second, _rx2) = channel_listener(EventMask::CTS, Framing::Raw);

        let _handle = session.add_data_listener_with_tick(first, TICK).unwrap();
        let result = session.add_data_listener_with_tick(second, TICK);

        assert!(matches!(result, Err(ListenerError::AlreadyListening)));
    }

    #[test]
    fn test_stop_restores_timeouts() {
        let (_bus, _line, session) = open();
        let before = session.timeouts();
        let (listener, _rx) = channel_listener(EventMask::DATA_RECEIVED, Framing::Raw);

        let handle = session.add_data_listener_with_tick(listener, TICK).unwrap();
        assert_eq!(session.timeouts().events, EventMask::DATA_RECEIVED);
        let started = Instant::now();
        handle.stop();

        assert_eq!(session.timeouts(), before);
        assert!(!session.is_listening());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_modem_events_delivered() {
        let (_bus, line, session) = open();
        let (listener, rx) = channel_listener(EventMask::CTS, Framing::Raw);
        let _handle = session.add_data_listener_with_tick(listener, TICK).unwrap();

        thread::sleep(TICK * 3);
        line.set_cts(true);
        let event = rx.recv_timeout(WAIT).unwrap();

        assert_eq!(event.kind, EventMask::CTS);
        assert!(event.data.is_empty());
    }

    #[test]
    fn test_disconnect_ends_listener() {
        let (_bus, line, session) = open();
        let (listener, rx) = channel_listener(
            EventMask::DATA_RECEIVED | EventMask::PORT_DISCONNECTED,
            Framing::Raw,
        );
        let handle = session.add_data_listener_with_tick(listener, TICK).unwrap();

        line.unplug();
        let event = rx.recv_timeout(WAIT).unwrap();

        assert!(event.kind.contains(EventMask::PORT_DISCONNECTED));
        assert!(!session.is_open());
        let deadline = Instant::now() + WAIT;
        while handle.is_running() && Instant::now() < deadline {
            thread::sleep(TICK);
        }
        assert!(!handle.is_running());
    }

    #[test]
    fn test_closed_session_cannot_listen() {
        let (_bus, _line, session) = open();
        session.close();
        let (listener, _rx) = channel_listener(EventMask::DATA_RECEIVED, Framing::Raw);

        let result = session.add_data_listener(listener);

        assert!(matches!(result, Err(ListenerError::Closed)));
    }
}
