use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::device::{ConnectionManager, PollingPortMonitor, PortCatalog, Session, SessionInfo};
use crate::serial::{BaudRate, PortBackend, PortIdentifier, Result, SerialDeviceInfo, SystemBackend};

/// Typed entry point for every serial operation: enumerate, open, write, read, close.
///
/// Each method is independently awaitable and fails with a [`SerialError`](crate::SerialError)
/// whose variant identifies what went wrong.
pub struct SerialMonitor {
    manager: ConnectionManager,
    settings: Settings,
}

impl SerialMonitor {
    pub fn new(backend: Arc<dyn PortBackend>, settings: Settings) -> Self {
        let catalog = PortCatalog::new(backend);
        let manager = ConnectionManager::with_config(catalog, settings.transfer.clone());
        Self { manager, settings }
    }

    /// Monitor for the host's real serial ports with default settings.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemBackend::new()), Settings::default())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn catalog(&self) -> &PortCatalog {
        self.manager.catalog()
    }

    /// Fetch list of available serial ports
    pub async fn list_ports(&self) -> Result<Vec<PortIdentifier>> {
        self.catalog().list_ports().await
    }

    /// Available serial ports with their USB metadata
    pub async fn list_devices(&self) -> Result<Vec<SerialDeviceInfo>> {
        self.catalog().list_devices().await
    }

    /// Open a port. The baud rate is checked before the device is touched.
    pub async fn open(&self, port: &str, baud_rate: u32) -> Result<Session> {
        let baud = BaudRate::try_from(baud_rate)?;
        self.manager.open(&PortIdentifier::new(port), baud).await
    }

    /// Open a port at the configured default baud rate
    pub async fn open_default(&self, port: &str) -> Result<Session> {
        self.manager
            .open(&PortIdentifier::new(port), self.settings.default_baud_rate)
            .await
    }

    /// Send data to the serial port
    pub async fn write(&self, session: &Session, data: &[u8]) -> Result<usize> {
        session.write(data).await
    }

    /// Send a text message to the serial port
    pub async fn write_text(&self, session: &Session, message: &str) -> Result<usize> {
        session.write(message.as_bytes()).await
    }

    /// Read data from the serial port
    pub async fn read(&self, session: &Session, max_bytes: usize, timeout_ms: u64) -> Result<Vec<u8>> {
        session.read(max_bytes, Duration::from_millis(timeout_ms)).await
    }

    /// Read one line, including its terminator, decoded lossily as UTF-8
    pub async fn read_line(&self, session: &Session, timeout_ms: u64) -> Result<String> {
        let line = session
            .read_until(
                self.settings.line_delimiter,
                self.settings.max_line_length,
                Duration::from_millis(timeout_ms),
            )
            .await?;
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Close a session. Closing twice is harmless.
    pub async fn close(&self, session: &Session) {
        self.manager.close(session).await
    }

    /// Snapshot of all open sessions
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.manager.sessions()
    }

    /// Hot-plug monitor over this monitor's catalog, polling at the configured interval
    pub fn port_monitor(&self) -> PollingPortMonitor {
        PollingPortMonitor::new(self.catalog().clone(), self.settings.monitor_interval())
    }
}
