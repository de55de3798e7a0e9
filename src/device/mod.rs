pub mod catalog;
pub mod manager;
pub mod models;
pub mod port_monitor;

pub use catalog::PortCatalog;
pub use manager::ConnectionManager;
pub use models::*;
pub use port_monitor::{PollingPortMonitor, PortEvent, PortMonitor};
