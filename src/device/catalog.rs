use std::sync::Arc;

use crate::serial::{PortBackend, PortIdentifier, Result, SerialDeviceInfo, SystemBackend};

/// Lists the serial devices a backend can see.
///
/// Owns the backend that the [`ConnectionManager`](super::ConnectionManager) opens ports
/// through, so enumeration and opening always agree on what exists.
#[derive(Clone)]
pub struct PortCatalog {
    backend: Arc<dyn PortBackend>,
}

impl PortCatalog {
    pub fn new(backend: Arc<dyn PortBackend>) -> Self {
        Self { backend }
    }

    /// Catalog over the host's real serial ports.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemBackend::new()))
    }

    /// Identifiers of the ports present right now.
    pub async fn list_ports(&self) -> Result<Vec<PortIdentifier>> {
        let devices = self.list_devices().await?;
        Ok(devices.into_iter().map(|device| device.port).collect())
    }

    /// Ports present right now, with whatever metadata the platform reports.
    pub async fn list_devices(&self) -> Result<Vec<SerialDeviceInfo>> {
        let devices = self.backend.available_ports().await?;
        log::debug!("Enumerated {} serial ports", devices.len());
        Ok(devices)
    }

    pub async fn find(&self, port: &PortIdentifier) -> Result<Option<SerialDeviceInfo>> {
        let devices = self.list_devices().await?;
        Ok(devices.into_iter().find(|device| &device.port == port))
    }

    pub async fn contains(&self, port: &PortIdentifier) -> Result<bool> {
        Ok(self.find(port).await?.is_some())
    }

    pub(crate) fn backend(&self) -> &Arc<dyn PortBackend> {
        &self.backend
    }
}
