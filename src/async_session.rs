//! Tokio adapter for [`PortSession`].
//!
//! Every call runs the blocking session operation on Tokio's blocking thread
//! pool, so the async runtime is never parked on serial I/O.

use crate::error::{ControlError, IoError, OpenError};
use crate::port::{EventMask, SerialConfiguration, TimeoutDescriptor};
use crate::session::{EventWaiter, PortSession};
use async_trait::async_trait;
use std::time::Instant;
use thiserror::Error;

/// Errors from the async adapter.
#[derive(Debug, Error)]
pub enum AsyncError {
    #[error(transparent)]
    Open(#[from] OpenError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Control(#[from] ControlError),

    /// The blocking task panicked or was cancelled.
    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Async operations on a serial session.
#[async_trait]
pub trait AsyncSerialSession: Send + Sync {
    /// Read up to `max` bytes under the session's timeout mode.
    async fn read(&self, max: usize) -> Result<Vec<u8>, AsyncError>;

    /// Write `data` under the session's write mode.
    async fn write(&self, data: &[u8]) -> Result<usize, AsyncError>;

    /// Wait for a monitored event until `deadline`.
    async fn wait_for_event(&self, deadline: Option<Instant>) -> Result<EventMask, AsyncError>;

    async fn flush_buffers(&self) -> Result<(), AsyncError>;

    fn path(&self) -> &str;
}

/// A [`PortSession`] usable from async code.
#[derive(Debug, Clone)]
pub struct AsyncPortSession {
    session: PortSession,
    path: String,
}

impl AsyncPortSession {
    /// Open `path` with the native backend on the blocking pool.
    pub async fn open(
        path: &str,
        configuration: SerialConfiguration,
        timeouts: TimeoutDescriptor,
    ) -> Result<Self, AsyncError> {
        let owned = path.to_string();
        let session = tokio::task::spawn_blocking(move || {
            PortSession::open(&owned, configuration, timeouts)
        })
        .await??;
        Ok(Self::from(session))
    }

    /// The wrapped blocking session.
    pub fn session(&self) -> &PortSession {
        &self.session
    }

    pub fn close(&self) {
        self.session.close();
    }
}

impl From<PortSession> for AsyncPortSession {
    fn from(session: PortSession) -> Self {
        Self {
            path: session.path().to_string(),
            session,
        }
    }
}

#[async_trait]
impl AsyncSerialSession for AsyncPortSession {
    async fn read(&self, max: usize) -> Result<Vec<u8>, AsyncError> {
        let session = self.session.clone();
        Ok(tokio::task::spawn_blocking(move || session.read(max)).await??)
    }

    async fn write(&self, data: &[u8]) -> Result<usize, AsyncError> {
        let session = self.session.clone();
        let data = data.to_vec();
        Ok(tokio::task::spawn_blocking(move || session.write(&data)).await??)
    }

    async fn wait_for_event(&self, deadline: Option<Instant>) -> Result<EventMask, AsyncError> {
        let session = self.session.clone();
        Ok(tokio::task::spawn_blocking(move || {
            session.set_listening(true);
            EventWaiter::new(&session).wait_for_event(deadline)
        })
        .await?)
    }

    async fn flush_buffers(&self) -> Result<(), AsyncError> {
        let session = self.session.clone();
        Ok(tokio::task::spawn_blocking(move || session.flush_buffers()).await??)
    }

    fn path(&self) -> &str {
        &self.path
    }
}
