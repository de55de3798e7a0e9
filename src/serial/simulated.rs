//! In-process serial devices for tests and demos.
//!
//! Each simulated device is a named entry in a [`SimulatedBackend`]. Opening it creates a
//! `tokio::io::duplex` pair: the host end becomes the session transport, the device end of
//! the most recent open is handed out through [`SimulatedDevice::accept`]. The duplex buffer size models the link's
//! buffer, so a small capacity produces short writes and backpressure. Dropping the device
//! end models an unplugged cable.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::Notify;

use super::interface::{PortBackend, SerialTransport};
use super::{BaudRate, PortIdentifier, PortKind, Result, SerialDeviceInfo, SerialError};

const DEFAULT_LINK_CAPACITY: usize = 4096;

#[derive(Clone, Default)]
pub struct SimulatedBackend {
    state: Arc<Mutex<BackendState>>,
}

#[derive(Default)]
struct BackendState {
    devices: BTreeMap<PortIdentifier, SimulatedDevice>,
    enumeration_error: Option<String>,
}

/// Handle to one simulated device.
#[derive(Clone)]
pub struct SimulatedDevice {
    port: PortIdentifier,
    shared: Arc<DeviceShared>,
}

struct DeviceShared {
    config: Mutex<DeviceConfig>,
    /// Device end of the latest open that nobody has accepted yet.
    pending: Mutex<Option<DuplexStream>>,
    connected: Notify,
}

struct DeviceConfig {
    link_capacity: usize,
    busy: Option<String>,
    last_baud: Option<BaudRate>,
    open_count: usize,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a device with the default link buffer.
    pub fn add_device(&self, name: &str) -> SimulatedDevice {
        self.add_device_with_capacity(name, DEFAULT_LINK_CAPACITY)
    }

    /// Plug in a device whose link accepts at most `link_capacity` unread bytes.
    pub fn add_device_with_capacity(&self, name: &str, link_capacity: usize) -> SimulatedDevice {
        let device = SimulatedDevice {
            port: PortIdentifier::new(name),
            shared: Arc::new(DeviceShared {
                config: Mutex::new(DeviceConfig {
                    link_capacity: link_capacity.max(1),
                    busy: None,
                    last_baud: None,
                    open_count: 0,
                }),
                pending: Mutex::new(None),
                connected: Notify::new(),
            }),
        };

        self.lock().devices.insert(device.port.clone(), device.clone());
        log::debug!("Simulated device {} plugged in", name);
        device
    }

    /// Unplug a device from enumeration. Open sessions keep their link until the
    /// device end is dropped.
    pub fn remove_device(&self, name: &str) -> Option<SimulatedDevice> {
        let removed = self.lock().devices.remove(&PortIdentifier::new(name));
        if removed.is_some() {
            log::debug!("Simulated device {} unplugged", name);
        }
        removed
    }

    pub fn device(&self, name: &str) -> Option<SimulatedDevice> {
        self.lock().devices.get(&PortIdentifier::new(name)).cloned()
    }

    /// Make enumeration fail with the given message, or succeed again with `None`.
    pub fn set_enumeration_error(&self, message: Option<&str>) {
        self.lock().enumeration_error = message.map(str::to_string);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PortBackend for SimulatedBackend {
    async fn available_ports(&self) -> Result<Vec<SerialDeviceInfo>> {
        let state = self.lock();
        if let Some(message) = &state.enumeration_error {
            return Err(SerialError::Enumeration(message.clone()));
        }

        Ok(state
            .devices
            .keys()
            .map(|port| SerialDeviceInfo::bare(port.clone(), PortKind::Virtual))
            .collect())
    }

    async fn open(&self, port: &PortIdentifier, baud: BaudRate) -> Result<Box<dyn SerialTransport>> {
        let device = self
            .lock()
            .devices
            .get(port)
            .cloned()
            .ok_or_else(|| SerialError::DeviceNotFound(port.clone()))?;

        let host_end = device.connect(baud)?;
        Ok(Box::new(host_end))
    }
}

impl SimulatedDevice {
    pub fn port(&self) -> &PortIdentifier {
        &self.port
    }

    /// Device end of the link from the latest open, waiting for an open if none is pending.
    /// Each end is handed out once.
    pub async fn accept(&self) -> DuplexStream {
        loop {
            let connected = self.shared.connected.notified();
            let device_end = self.pending().take();
            if let Some(device_end) = device_end {
                return device_end;
            }
            connected.await;
        }
    }

    /// Make opens fail as if another process held the device, or clear that with `None`.
    pub fn set_busy(&self, reason: Option<&str>) {
        self.config().busy = reason.map(str::to_string);
    }

    pub fn set_link_capacity(&self, link_capacity: usize) {
        self.config().link_capacity = link_capacity.max(1);
    }

    /// Baud rate of the most recent open.
    pub fn baud_rate(&self) -> Option<BaudRate> {
        self.config().last_baud
    }

    pub fn open_count(&self) -> usize {
        self.config().open_count
    }

    fn connect(&self, baud: BaudRate) -> Result<DuplexStream> {
        let capacity = {
            let mut config = self.config();
            if let Some(reason) = &config.busy {
                return Err(SerialError::OpenFailed {
                    port: self.port.clone(),
                    message: reason.clone(),
                });
            }
            config.last_baud = Some(baud);
            config.open_count += 1;
            config.link_capacity
        };

        let (host_end, device_end) = tokio::io::duplex(capacity);
        // An end never accepted belongs to a link that is already gone
        if self.pending().replace(device_end).is_some() {
            log::debug!("Simulated device {} dropped an unaccepted link", self.port);
        }
        self.shared.connected.notify_one();
        Ok(host_end)
    }

    fn config(&self) -> std::sync::MutexGuard<'_, DeviceConfig> {
        self.shared.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Option<DuplexStream>> {
        self.shared.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
