#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serialmon_lib::{ConnectionManager, PortCatalog, SimulatedBackend, TransferConfig};
use tokio::io::{AsyncReadExt, DuplexStream};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A manager over a fresh simulated backend.
pub fn simulated_manager() -> (SimulatedBackend, ConnectionManager) {
    simulated_manager_with(TransferConfig::default())
}

pub fn simulated_manager_with(config: TransferConfig) -> (SimulatedBackend, ConnectionManager) {
    init_logging();
    let backend = SimulatedBackend::new();
    let catalog = PortCatalog::new(Arc::new(backend.clone()));
    (backend, ConnectionManager::with_config(catalog, config))
}

/// Read exactly `len` bytes from the device end of a link, failing the test after a second.
pub async fn read_wire(peer: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut wire = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(1), peer.read_exact(&mut wire))
        .await
        .expect("device did not receive the expected bytes in time")
        .expect("device link failed");
    wire
}
