use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::catalog::PortCatalog;
use crate::serial::{CancelToken, PortIdentifier, Result, SerialError};

/// Events emitted by the port monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// A serial port was added
    PortAdded(PortIdentifier),
    /// A serial port was removed
    PortRemoved(PortIdentifier),
}

/// Watches for serial ports appearing and disappearing
#[async_trait]
pub trait PortMonitor: Send + Sync {
    /// Start monitoring for port changes
    async fn start(&mut self) -> Result<()>;

    /// Stop monitoring
    async fn stop(&mut self) -> Result<()>;

    /// Get receiver for port events
    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>>;
}

/// Port monitor that re-enumerates the catalog on a fixed interval and reports the difference.
pub struct PollingPortMonitor {
    catalog: PortCatalog,
    interval: Duration,
    tx: Option<mpsc::Sender<PortEvent>>,
    rx: Option<mpsc::Receiver<PortEvent>>,
    stop: CancelToken,
    task_handle: Option<JoinHandle<()>>,
}

impl PollingPortMonitor {
    pub fn new(catalog: PortCatalog, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(100);

        Self {
            catalog,
            interval,
            tx: Some(tx),
            rx: Some(rx),
            stop: CancelToken::new(),
            task_handle: None,
        }
    }
}

#[async_trait]
impl PortMonitor for PollingPortMonitor {
    async fn start(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| SerialError::InvalidConfiguration("port monitor already started".into()))?;

        // Baseline: ports present at start are not reported as added
        let mut known: BTreeSet<PortIdentifier> = self.catalog.list_ports().await?.into_iter().collect();
        let catalog = self.catalog.clone();
        let stop = self.stop.clone();
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let handle = tokio::spawn(async move {
            // First tick fires immediately and would only repeat the baseline
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        log::info!("Port monitor stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        let current: BTreeSet<PortIdentifier> = match catalog.list_ports().await {
                            Ok(ports) => ports.into_iter().collect(),
                            Err(e) => {
                                log::warn!("Port monitor skipped a scan: {}", e);
                                continue;
                            }
                        };

                        let removed = known.difference(&current).cloned().map(PortEvent::PortRemoved);
                        let added = current.difference(&known).cloned().map(PortEvent::PortAdded);
                        for event in removed.chain(added) {
                            log::debug!("Port event: {:?}", event);
                            if tx.send(event).await.is_err() {
                                log::debug!("Port event receiver dropped, stopping monitor");
                                return;
                            }
                        }
                        known = current;
                    }
                }
            }
        });

        self.task_handle = Some(handle);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.stop.cancel();

        if let Some(handle) = self.task_handle.take() {
            handle
                .await
                .map_err(|e| SerialError::Enumeration(format!("port monitor task failed: {}", e)))?;
        }

        Ok(())
    }

    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>> {
        self.rx.take()
    }
}
