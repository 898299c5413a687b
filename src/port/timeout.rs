//! Timeout modes and the policy that turns them into blocking behavior.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::time::Duration;

bitflags! {
    /// Timeout mode bitmask. Read and write bits are independent; an empty
    /// mask is fully non-blocking.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TimeoutMode: u32 {
        const READ_SEMI_BLOCKING = 0x0000_0001;
        const READ_BLOCKING = 0x0000_0010;
        const WRITE_BLOCKING = 0x0000_0100;
        const READ_SCANNER = 0x0000_1000;
        const WRITE_SEMI_BLOCKING = 0x0001_0000;
    }
}

impl TimeoutMode {
    pub const NONBLOCKING: TimeoutMode = TimeoutMode::empty();
}

bitflags! {
    /// Serial events a session can report. An empty mask means the wait
    /// timed out.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventMask: u32 {
        const DATA_AVAILABLE = 0x0000_0001;
        const DATA_RECEIVED = 0x0000_0010;
        const DATA_WRITTEN = 0x0000_0100;
        const BREAK_INTERRUPT = 0x0001_0000;
        const CARRIER_DETECT = 0x0002_0000;
        const CTS = 0x0004_0000;
        const DSR = 0x0008_0000;
        const RING_INDICATOR = 0x0010_0000;
        const FRAMING_ERROR = 0x0020_0000;
        const OVERRUN_ERROR = 0x0040_0000;
        const SOFTWARE_OVERRUN = 0x0080_0000;
        const PARITY_ERROR = 0x0100_0000;
        const PORT_DISCONNECTED = 0x1000_0000;
    }
}

impl EventMask {
    pub const TIMED_OUT: EventMask = EventMask::empty();

    /// Modem status line transitions.
    pub const LINE_CHANGES: EventMask = EventMask::CARRIER_DETECT
        .union(EventMask::CTS)
        .union(EventMask::DSR)
        .union(EventMask::RING_INDICATOR);

    /// Receive-side line errors.
    pub const LINE_ERRORS: EventMask = EventMask::BREAK_INTERRUPT
        .union(EventMask::FRAMING_ERROR)
        .union(EventMask::OVERRUN_ERROR)
        .union(EventMask::SOFTWARE_OVERRUN)
        .union(EventMask::PARITY_ERROR);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadMode {
    #[default]
    NonBlocking,
    SemiBlocking,
    Blocking,
    Scanner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    #[default]
    NonBlocking,
    SemiBlocking,
    Blocking,
}

/// Requested timeout configuration of a session.
///
/// A timeout of zero means "wait indefinitely" for the blocking modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeoutDescriptor {
    pub read_mode: ReadMode,
    pub write_mode: WriteMode,
    pub read_timeout_ms: u32,
    pub write_timeout_ms: u32,
    pub events: EventMask,
}

impl TimeoutDescriptor {
    pub fn nonblocking() -> Self {
        Self::default()
    }

    pub fn blocking(read_timeout_ms: u32) -> Self {
        Self {
            read_mode: ReadMode::Blocking,
            read_timeout_ms,
            ..Self::default()
        }
    }

    pub fn semi_blocking(read_timeout_ms: u32) -> Self {
        Self {
            read_mode: ReadMode::SemiBlocking,
            read_timeout_ms,
            ..Self::default()
        }
    }

    pub fn scanner() -> Self {
        Self {
            read_mode: ReadMode::Scanner,
            ..Self::default()
        }
    }

    pub fn with_write(mut self, write_mode: WriteMode, write_timeout_ms: u32) -> Self {
        self.write_mode = write_mode;
        self.write_timeout_ms = write_timeout_ms;
        self
    }

    pub fn with_events(mut self, events: EventMask) -> Self {
        self.events = events;
        self
    }

    /// Build from the external bitmask. When several read bits are set,
    /// semi-blocking wins over blocking, which wins over scanner.
    pub fn from_mode(mode: TimeoutMode, read_timeout_ms: u32, write_timeout_ms: u32) -> Self {
        let read_mode = if mode.contains(TimeoutMode::READ_SEMI_BLOCKING) {
            ReadMode::SemiBlocking
        } else if mode.contains(TimeoutMode::READ_BLOCKING) {
            ReadMode::Blocking
        } else if mode.contains(TimeoutMode::READ_SCANNER) {
            ReadMode::Scanner
        } else {
            ReadMode::NonBlocking
        };
        let write_mode = if mode.contains(TimeoutMode::WRITE_BLOCKING) {
            WriteMode::Blocking
        } else if mode.contains(TimeoutMode::WRITE_SEMI_BLOCKING) {
            WriteMode::SemiBlocking
        } else {
            WriteMode::NonBlocking
        };
        Self {
            read_mode,
            write_mode,
            read_timeout_ms,
            write_timeout_ms,
            events: EventMask::empty(),
        }
    }

    pub fn mode(&self) -> TimeoutMode {
        let read = match self.read_mode {
            ReadMode::NonBlocking => TimeoutMode::NONBLOCKING,
            ReadMode::SemiBlocking => TimeoutMode::READ_SEMI_BLOCKING,
            ReadMode::Blocking => TimeoutMode::READ_BLOCKING,
            ReadMode::Scanner => TimeoutMode::READ_SCANNER,
        };
        let write = match self.write_mode {
            WriteMode::NonBlocking => TimeoutMode::NONBLOCKING,
            WriteMode::SemiBlocking => TimeoutMode::WRITE_SEMI_BLOCKING,
            WriteMode::Blocking => TimeoutMode::WRITE_BLOCKING,
        };
        read | write
    }
}

/// Fixed inter-byte gap that ends a scanner-mode read.
pub const SCANNER_INTER_BYTE: Duration = Duration::from_millis(100);

/// Read timeout forced while DATA_RECEIVED events are monitored.
pub const EVENT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// When a read call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadBehavior {
    /// Return whatever is buffered right now.
    Immediate,
    /// Return as soon as at least one byte arrived, or when the timeout
    /// (if any) elapses.
    AtLeastOne { timeout: Option<Duration> },
    /// Return when the buffer is full, or when the timeout (if any) elapses
    /// counting from the start of the call.
    Fill { timeout: Option<Duration> },
    /// Wait for a first byte indefinitely, then keep reading until the line
    /// is quiet for `inter_byte`.
    Scanner { inter_byte: Duration },
}

/// How much of a write must be accepted before the call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAccept {
    /// Hand over what fits in the transmit queue without waiting.
    Immediate,
    /// Wait until at least one byte was accepted.
    AtLeastOne { timeout: Option<Duration> },
    /// Wait until every byte was accepted.
    All { timeout: Option<Duration> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBehavior {
    pub accept: WriteAccept,
    /// Wait for the bytes this call wrote to leave the transmitter.
    pub drain_after: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingBehavior {
    pub read: ReadBehavior,
    pub write: WriteBehavior,
}

/// Pure mapping from a [`TimeoutDescriptor`] to blocking behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutPolicy;

impl TimeoutPolicy {
    pub fn resolve(descriptor: &TimeoutDescriptor) -> BlockingBehavior {
        BlockingBehavior {
            read: Self::read_behavior(descriptor),
            write: Self::write_behavior(descriptor),
        }
    }

    fn read_behavior(descriptor: &TimeoutDescriptor) -> ReadBehavior {
        // Event monitoring shares the read timing with ordinary reads.
        if descriptor.events.contains(EventMask::DATA_RECEIVED) {
            return ReadBehavior::AtLeastOne {
                timeout: Some(EVENT_READ_TIMEOUT),
            };
        }
        let timeout = optional_ms(descriptor.read_timeout_ms);
        match descriptor.read_mode {
            ReadMode::NonBlocking => ReadBehavior::Immediate,
            ReadMode::SemiBlocking => ReadBehavior::AtLeastOne { timeout },
            ReadMode::Blocking => ReadBehavior::Fill { timeout },
            ReadMode::Scanner => ReadBehavior::Scanner {
                inter_byte: SCANNER_INTER_BYTE,
            },
        }
    }

    fn write_behavior(descriptor: &TimeoutDescriptor) -> WriteBehavior {
        let timeout = optional_ms(descriptor.write_timeout_ms);
        match descriptor.write_mode {
            WriteMode::NonBlocking => WriteBehavior {
                accept: WriteAccept::Immediate,
                drain_after: false,
            },
            WriteMode::SemiBlocking => WriteBehavior {
                accept: WriteAccept::AtLeastOne { timeout },
                drain_after: false,
            },
            WriteMode::Blocking => WriteBehavior {
                accept: WriteAccept::All { timeout },
                drain_after: true,
            },
        }
    }
}

fn optional_ms(ms: u32) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(u64::from(ms)))
}
