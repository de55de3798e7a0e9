//! Per-session transfer worker.
//!
//! Every open session gets one task that owns the transport outright. Callers talk to it
//! through a bounded queue, so writes and reads run one at a time in submission order and
//! never interleave on the wire. Sessions never share a worker.
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::types::{CancelToken, ReadRequest, TransferConfig, TransferMetrics, TransferRequest};
use crate::device::models::{CloseReason, SessionState};
use crate::serial::{PortIdentifier, Result, SerialError, SerialTransport};

/// Why a scheduler stopped.
#[derive(Debug)]
pub(crate) enum SchedulerExit {
    /// The session was closed by its owner.
    Closed,
    /// The transport broke; the session closed itself.
    Failed(String),
}

/// Caller side of a session's scheduler.
#[derive(Clone)]
pub(crate) struct SchedulerHandle {
    port: PortIdentifier,
    cmd_tx: mpsc::Sender<TransferRequest>,
    metrics_rx: watch::Receiver<TransferMetrics>,
}

impl SchedulerHandle {
    pub async fn write(&self, data: Vec<u8>, cancel: Option<CancelToken>) -> Result<usize> {
        let (responder, rx) = oneshot::channel();
        let request = TransferRequest::Write {
            data,
            cancel: cancel.clone(),
            responder,
        };
        self.submit(request, rx, cancel.as_ref()).await
    }

    pub async fn read(&self, request: ReadRequest, cancel: Option<CancelToken>) -> Result<Vec<u8>> {
        let (responder, rx) = oneshot::channel();
        let request = TransferRequest::Read {
            request,
            cancel: cancel.clone(),
            responder,
        };
        self.submit(request, rx, cancel.as_ref()).await
    }

    pub fn metrics(&self) -> TransferMetrics {
        self.metrics_rx.borrow().clone()
    }

    async fn submit<T>(
        &self,
        request: TransferRequest,
        rx: oneshot::Receiver<Result<T>>,
        cancel: Option<&CancelToken>,
    ) -> Result<T> {
        let exchange = async {
            self.cmd_tx.send(request).await.map_err(|_| self.closed())?;
            rx.await.map_err(|_| self.closed())?
        };

        match cancel {
            // A request still waiting in the queue is skipped by the worker once we stop listening
            Some(token) => tokio::select! {
                biased;
                result = exchange => result,
                _ = token.cancelled() => Err(SerialError::Cancelled),
            },
            None => exchange.await,
        }
    }

    fn closed(&self) -> SerialError {
        SerialError::SessionClosed(self.port.clone())
    }
}

/// Start the worker for a freshly opened transport.
///
/// `on_exit` runs on the worker task after the transport has been dropped.
pub(crate) fn spawn<F>(
    port: PortIdentifier,
    transport: Box<dyn SerialTransport>,
    config: TransferConfig,
    state: Arc<watch::Sender<SessionState>>,
    shutdown: CancelToken,
    on_exit: F,
) -> (SchedulerHandle, JoinHandle<()>)
where
    F: FnOnce(SchedulerExit) + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(config.queue_capacity.max(1));
    let (metrics_tx, metrics_rx) = watch::channel(TransferMetrics::default());

    let scheduler = TransferScheduler {
        port: port.clone(),
        cmd_rx,
        state,
        shutdown,
        scratch: vec![0; config.read_chunk_size.max(1)],
        received: Vec::new(),
        config,
        metrics: TransferMetrics::default(),
        metrics_tx,
    };

    let task = tokio::spawn(async move {
        let exit = scheduler.run(transport).await;
        on_exit(exit);
    });

    (SchedulerHandle { port, cmd_tx, metrics_rx }, task)
}

struct TransferScheduler {
    port: PortIdentifier,
    cmd_rx: mpsc::Receiver<TransferRequest>,
    state: Arc<watch::Sender<SessionState>>,
    shutdown: CancelToken,
    config: TransferConfig,
    scratch: Vec<u8>,
    /// Bytes taken off the transport but not yet handed to a reader.
    received: Vec<u8>,
    metrics: TransferMetrics,
    metrics_tx: watch::Sender<TransferMetrics>,
}

enum Fill {
    Data,
    Idle,
    Eof,
}

enum Completion {
    Write(oneshot::Sender<Result<usize>>, Result<usize>),
    Read(oneshot::Sender<Result<Vec<u8>>>, Result<Vec<u8>>),
}

impl Completion {
    fn error(&self) -> Option<&SerialError> {
        match self {
            Completion::Write(_, Err(e)) | Completion::Read(_, Err(e)) => Some(e),
            _ => None,
        }
    }

    fn deliver(self) {
        match self {
            Completion::Write(responder, result) => {
                let _ = responder.send(result);
            }
            Completion::Read(responder, result) => {
                let _ = responder.send(result);
            }
        }
    }
}

impl TransferScheduler {
    async fn run(mut self, mut transport: Box<dyn SerialTransport>) -> SchedulerExit {
        log::debug!("Transfer scheduler for {} started", self.port);

        loop {
            let request = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                request = self.cmd_rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            if request.is_abandoned() {
                log::debug!("Skipping transfer on {} abandoned by its caller", self.port);
                continue;
            }

            let completion = match request {
                TransferRequest::Write { data, cancel, responder } => {
                    let result = self.write_all(&mut transport, &data, cancel.as_ref()).await;
                    if result.is_ok() {
                        self.metrics.writes_completed += 1;
                    }
                    Completion::Write(responder, result)
                }
                TransferRequest::Read { request, cancel, responder } => {
                    let result = self.read(&mut transport, &request, cancel.as_ref()).await;
                    if let Ok(data) = &result {
                        self.metrics.bytes_read += data.len() as u64;
                        self.metrics.reads_completed += 1;
                        if data.len() < request.max_bytes {
                            self.metrics.partial_reads += 1;
                        }
                    }
                    Completion::Read(responder, result)
                }
            };

            let failure = completion.error().and_then(|error| {
                self.record_error(error);
                error.is_transport_failure().then(|| error.to_string())
            });
            self.metrics_tx.send_replace(self.metrics.clone());

            if let Some(message) = failure {
                log::warn!("Transport failure on {}, closing session: {}", self.port, message);
                // Release the device before anyone learns the session is gone
                drop(transport);
                self.state
                    .send_replace(SessionState::Closed(CloseReason::TransportFailure(message.clone())));
                self.reject_pending();
                completion.deliver();
                return SchedulerExit::Failed(message);
            }

            completion.deliver();
        }

        drop(transport);
        self.reject_pending();
        log::debug!("Transfer scheduler for {} stopped", self.port);
        SchedulerExit::Closed
    }

    /// Send the whole payload, continuing after short writes.
    ///
    /// Every byte the transport accepts is counted in `bytes_written` as it goes out, so a
    /// write cut short by cancellation or a closing session still shows what reached the wire.
    async fn write_all(
        &mut self,
        transport: &mut Box<dyn SerialTransport>,
        data: &[u8],
        cancel: Option<&CancelToken>,
    ) -> Result<usize> {
        let mut written = 0;

        while written < data.len() {
            let step = tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => Err(SerialError::Cancelled),
                _ = self.shutdown.cancelled() => Err(SerialError::SessionClosed(self.port.clone())),
                step = transport.write(&data[written..]) => Ok(step),
            };

            match step {
                Err(interrupted) => {
                    log::debug!("Write on {} stopped after {} of {} bytes", self.port, written, data.len());
                    return Err(interrupted);
                }
                Ok(Ok(0)) => {
                    return Err(SerialError::Write {
                        written,
                        source: io::Error::new(io::ErrorKind::WriteZero, "transport accepted no bytes"),
                    });
                }
                Ok(Ok(accepted)) => {
                    let remaining = data.len() - written;
                    if accepted < remaining {
                        self.metrics.short_writes += 1;
                        log::trace!("Short write on {}: {} of {} bytes", self.port, accepted, remaining);
                    }
                    written += accepted;
                    self.metrics.bytes_written += accepted as u64;
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(source)) => return Err(SerialError::Write { written, source }),
            }
        }

        if self.config.flush_after_write {
            transport
                .flush()
                .await
                .map_err(|source| SerialError::Write { written, source })?;
        }

        log::trace!("{} <- {}", self.port, hex::encode(data));
        Ok(written)
    }

    async fn read(
        &mut self,
        transport: &mut Box<dyn SerialTransport>,
        request: &ReadRequest,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<u8>> {
        if request.max_bytes == 0 {
            return Ok(Vec::new());
        }

        let idle_gap = self.config.read_idle_gap();
        loop {
            if let Some(end) = self.frame_end(request) {
                return Ok(self.take(end));
            }

            let wait_until = if self.received.is_empty() || request.delimiter.is_some() {
                request.deadline
            } else {
                (Instant::now() + idle_gap).min(request.deadline)
            };

            match self.fill(transport, wait_until, cancel).await? {
                Fill::Data => {}
                Fill::Idle | Fill::Eof if !self.received.is_empty() => break,
                Fill::Idle => return Err(SerialError::ReadTimeout(request.timeout)),
                Fill::Eof => {
                    return Err(SerialError::Read(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial device disconnected",
                    )))
                }
            }
        }

        // Deadline or idle gap reached with data in hand: a partial read, not a failure
        let end = self.received.len().min(request.max_bytes);
        Ok(self.take(end))
    }

    /// Length of the response already sitting in the receive buffer, if it is complete.
    fn frame_end(&self, request: &ReadRequest) -> Option<usize> {
        let window = self.received.len().min(request.max_bytes);
        match request.delimiter {
            Some(delimiter) => self.received[..window]
                .iter()
                .position(|byte| *byte == delimiter)
                .map(|index| index + 1)
                .or((window == request.max_bytes).then_some(window)),
            None => {
                let full = window == request.max_bytes;
                let settled = window > 0 && self.config.read_idle_gap_ms == 0;
                (full || settled).then_some(window)
            }
        }
    }

    /// Pull one chunk off the transport into the receive buffer.
    async fn fill(
        &mut self,
        transport: &mut Box<dyn SerialTransport>,
        wait_until: Instant,
        cancel: Option<&CancelToken>,
    ) -> Result<Fill> {
        loop {
            let step = tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => Err(SerialError::Cancelled),
                _ = self.shutdown.cancelled() => Err(SerialError::SessionClosed(self.port.clone())),
                step = tokio::time::timeout_at(wait_until, transport.read(&mut self.scratch)) => Ok(step),
            };

            match step? {
                Err(_elapsed) => return Ok(Fill::Idle),
                Ok(Ok(0)) => return Ok(Fill::Eof),
                Ok(Ok(n)) => {
                    log::trace!("{} -> {}", self.port, hex::encode(&self.scratch[..n]));
                    self.received.extend_from_slice(&self.scratch[..n]);
                    return Ok(Fill::Data);
                }
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) =>
                {
                    continue
                }
                Ok(Err(e)) => return Err(SerialError::Read(e)),
            }
        }
    }

    fn take(&mut self, end: usize) -> Vec<u8> {
        self.received.drain(..end).collect()
    }

    fn record_error(&mut self, error: &SerialError) {
        match error {
            SerialError::Cancelled => self.metrics.cancelled += 1,
            SerialError::ReadTimeout(_) => self.metrics.read_timeouts += 1,
            _ => {}
        }
        self.metrics.last_error = Some(error.to_string());
    }

    /// Stop accepting requests and fail everything still queued.
    fn reject_pending(&mut self) {
        self.cmd_rx.close();
        while let Ok(request) = self.cmd_rx.try_recv() {
            request.reject(SerialError::SessionClosed(self.port.clone()));
        }
    }
}

async fn wait_cancelled(token: Option<&CancelToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
