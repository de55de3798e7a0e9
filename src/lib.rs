pub mod commands;
pub mod config;
pub mod device;
pub mod serial;

pub use commands::SerialMonitor;
pub use config::Settings;
pub use device::{
    CloseReason, ConnectionManager, PollingPortMonitor, PortCatalog, PortEvent, PortMonitor, Session, SessionInfo,
    SessionState,
};
pub use serial::{
    BaudRate, CancelToken, ErrorCategory, PortBackend, PortIdentifier, PortKind, Result, SerialDeviceInfo,
    SerialError, SerialTransport, SimulatedBackend, SimulatedDevice, SystemBackend, TransferConfig,
    TransferMetrics,
};
