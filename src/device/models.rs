use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::serial::transfer::scheduler::{self, SchedulerExit, SchedulerHandle};
use crate::serial::transfer::types::ReadRequest;
use crate::serial::{
    BaudRate, CancelToken, PortIdentifier, Result, SerialError, SerialTransport, TransferConfig, TransferMetrics,
};

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CloseReason {
    Requested,
    TransportFailure(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionState {
    Open,
    Closed(CloseReason),
}

impl SessionState {
    pub fn is_open(&self) -> bool {
        matches!(self, SessionState::Open)
    }

    /// Closed because the transport broke rather than by request.
    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Closed(CloseReason::TransportFailure(_)))
    }
}

/// Serializable snapshot of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub port: PortIdentifier,
    pub baud_rate: BaudRate,
    pub state: SessionState,
    pub opened_at: DateTime<Utc>,
    pub metrics: TransferMetrics,
}

/// A live, exclusively owned connection to one serial device.
///
/// Cloning is cheap and every clone refers to the same session. Transfers issued through
/// any clone are queued on the session's single worker in submission order.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionShared>,
}

struct SessionShared {
    id: Uuid,
    port: PortIdentifier,
    baud_rate: BaudRate,
    opened_at: DateTime<Utc>,
    state: Arc<watch::Sender<SessionState>>,
    shutdown: CancelToken,
    /// Flips to `true` once the worker has dropped the transport.
    released: watch::Receiver<bool>,
    scheduler: SchedulerHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Hand `transport` to a new worker. `on_failure` runs with the failure message once the
    /// worker has dropped the transport after an I/O failure.
    pub(crate) fn start<F>(
        port: PortIdentifier,
        baud_rate: BaudRate,
        transport: Box<dyn SerialTransport>,
        config: TransferConfig,
        on_failure: F,
    ) -> Self
    where
        F: FnOnce(Uuid, &PortIdentifier, &str) + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (state_tx, _state_rx) = watch::channel(SessionState::Open);
        let state = Arc::new(state_tx);
        let shutdown = CancelToken::new();
        let (released_tx, released) = watch::channel(false);

        let exit_port = port.clone();
        let (scheduler, worker) = scheduler::spawn(
            port.clone(),
            transport,
            config,
            state.clone(),
            shutdown.clone(),
            move |exit| {
                released_tx.send_replace(true);
                if let SchedulerExit::Failed(message) = exit {
                    on_failure(id, &exit_port, &message);
                }
            },
        );

        Self {
            inner: Arc::new(SessionShared {
                id,
                port,
                baud_rate,
                opened_at: Utc::now(),
                state,
                shutdown,
                released,
                scheduler,
                worker: Mutex::new(Some(worker)),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn port(&self) -> &PortIdentifier {
        &self.inner.port
    }

    pub fn baud_rate(&self) -> BaudRate {
        self.inner.baud_rate
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.inner.opened_at
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.borrow().is_open()
    }

    /// Whether the worker has let go of the transport.
    pub(crate) fn is_released(&self) -> bool {
        *self.inner.released.borrow()
    }

    pub fn metrics(&self) -> TransferMetrics {
        self.inner.scheduler.metrics()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id(),
            port: self.port().clone(),
            baud_rate: self.baud_rate(),
            state: self.state(),
            opened_at: self.opened_at(),
            metrics: self.metrics(),
        }
    }

    /// Resolves once the session is closed, whether by request or by a transport failure.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.inner.state.subscribe();
        let reason = match rx.wait_for(|state| !state.is_open()).await {
            Ok(state) => match &*state {
                SessionState::Closed(reason) => reason.clone(),
                SessionState::Open => CloseReason::Requested,
            },
            Err(_) => CloseReason::Requested,
        };
        reason
    }

    /// Send all of `data`, returning the number of bytes written.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        self.inner.scheduler.write(data.to_vec(), None).await
    }

    /// Like [`write`](Self::write), but gives up with `Cancelled` once `cancel` fires. Bytes
    /// that reached the wire before that are counted in [`metrics`](Self::metrics).
    pub async fn write_with_cancel(&self, data: &[u8], cancel: &CancelToken) -> Result<usize> {
        self.ensure_open()?;
        self.inner.scheduler.write(data.to_vec(), Some(cancel.clone())).await
    }

    /// Read up to `max_bytes`, waiting at most `timeout` (counted from this call) for data.
    pub async fn read(&self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let request = ReadRequest::new(max_bytes, timeout, None);
        self.inner.scheduler.read(request, None).await
    }

    pub async fn read_with_cancel(&self, max_bytes: usize, timeout: Duration, cancel: &CancelToken) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let request = ReadRequest::new(max_bytes, timeout, None);
        self.inner.scheduler.read(request, Some(cancel.clone())).await
    }

    /// Read through the next `delimiter` byte (inclusive), or up to `max_bytes` if none arrives.
    /// Bytes after the delimiter stay buffered for the next read.
    pub async fn read_until(&self, delimiter: u8, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let request = ReadRequest::new(max_bytes, timeout, Some(delimiter));
        self.inner.scheduler.read(request, None).await
    }

    /// Mark the session closed, stop its worker and wait for the transport to be released.
    /// Every caller waits for the release, not only the one that did the closing.
    /// Returns whether this call did the closing.
    pub(crate) async fn shutdown(&self) -> bool {
        let closed_here = self.inner.state.send_if_modified(|state| {
            if state.is_open() {
                *state = SessionState::Closed(CloseReason::Requested);
                true
            } else {
                false
            }
        });
        self.inner.shutdown.cancel();

        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                log::error!("Transfer worker for {} ended abnormally: {}", self.port(), e);
            }
        }

        // A sender dropped without flipping means the worker task is gone, and the transport with it
        let mut released = self.inner.released.clone();
        let _ = released.wait_for(|released| *released).await;

        closed_here
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SerialError::SessionClosed(self.port().clone()))
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("port", &self.inner.port)
            .field("baud_rate", &self.inner.baud_rate)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}
