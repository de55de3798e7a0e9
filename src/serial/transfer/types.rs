//! Request, cancellation and metrics types shared by the scheduler and its handle
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::serial::{Result, SerialError};

/// Caller-held switch that aborts a queued or running transfer.
///
/// Clones share the same state; cancelling any clone cancels them all.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token has been cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender is owned by `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session transfer tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Requests that may wait behind the running one before submitters are held back.
    pub queue_capacity: usize,
    /// Bytes pulled from the transport per read call.
    pub read_chunk_size: usize,
    /// After the first bytes of a read arrive, keep collecting until the line has been
    /// idle this long. Zero returns as soon as anything arrives.
    pub read_idle_gap_ms: u64,
    /// Flush the transport after every completed write.
    pub flush_after_write: bool,
}

impl TransferConfig {
    pub fn read_idle_gap(&self) -> Duration {
        Duration::from_millis(self.read_idle_gap_ms)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            read_chunk_size: 1024,
            read_idle_gap_ms: 0,
            flush_after_write: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferMetrics {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub writes_completed: u64,
    pub reads_completed: u64,
    /// Transport calls that accepted less than the remaining payload.
    pub short_writes: u64,
    /// Reads that returned fewer bytes than requested.
    pub partial_reads: u64,
    pub read_timeouts: u64,
    pub cancelled: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct ReadRequest {
    pub max_bytes: usize,
    pub timeout: Duration,
    pub deadline: Instant,
    /// Stop after this byte instead of at the first arrival.
    pub delimiter: Option<u8>,
}

impl ReadRequest {
    pub fn new(max_bytes: usize, timeout: Duration, delimiter: Option<u8>) -> Self {
        Self {
            max_bytes,
            timeout,
            deadline: Instant::now() + timeout,
            delimiter,
        }
    }
}

pub(crate) enum TransferRequest {
    Write {
        data: Vec<u8>,
        cancel: Option<CancelToken>,
        responder: oneshot::Sender<Result<usize>>,
    },
    Read {
        request: ReadRequest,
        cancel: Option<CancelToken>,
        responder: oneshot::Sender<Result<Vec<u8>>>,
    },
}

impl TransferRequest {
    /// The submitter stopped waiting for the answer.
    pub fn is_abandoned(&self) -> bool {
        match self {
            TransferRequest::Write { responder, .. } => responder.is_closed(),
            TransferRequest::Read { responder, .. } => responder.is_closed(),
        }
    }

    pub fn reject(self, error: SerialError) {
        match self {
            TransferRequest::Write { responder, .. } => {
                let _ = responder.send(Err(error));
            }
            TransferRequest::Read { responder, .. } => {
                let _ = responder.send(Err(error));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiters_on_every_clone() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        assert!(!token.is_cancelled());
        token.clone().cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_once_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("already cancelled");
    }

    #[test]
    fn config_fills_missing_fields_with_defaults() {
        let config: TransferConfig = serde_json::from_str(r#"{ "read_idle_gap_ms": 15 }"#).unwrap();
        assert_eq!(config.read_idle_gap(), Duration::from_millis(15));
        assert_eq!(config.queue_capacity, TransferConfig::default().queue_capacity);
        assert!(config.flush_after_write);
    }
}
