pub mod interface;
pub mod simulated;
pub mod transfer;

pub use interface::{PortBackend, SerialTransport, SystemBackend};
pub use simulated::{SimulatedBackend, SimulatedDevice};
pub use transfer::{CancelToken, TransferConfig, TransferMetrics};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Opaque name of a serial device, e.g. `/dev/ttyUSB0` or `COM3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortIdentifier(String);

impl PortIdentifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PortIdentifier {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for PortIdentifier {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl AsRef<str> for PortIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Supported line speeds. Anything else is rejected before a port is touched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BaudRate {
    B4800,
    B9600,
    B19200,
    B38400,
    B57600,
    #[default]
    B115200,
}

impl BaudRate {
    pub const ALL: [BaudRate; 6] = [
        BaudRate::B4800,
        BaudRate::B9600,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
    ];

    pub fn as_u32(self) -> u32 {
        match self {
            BaudRate::B4800 => 4800,
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
        }
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = SerialError;

    fn try_from(value: u32) -> Result<Self> {
        BaudRate::ALL
            .into_iter()
            .find(|baud| baud.as_u32() == value)
            .ok_or_else(|| SerialError::InvalidBaudRate(value.to_string()))
    }
}

impl From<BaudRate> for u32 {
    fn from(baud: BaudRate) -> Self {
        baud.as_u32()
    }
}

impl FromStr for BaudRate {
    type Err = SerialError;

    fn from_str(s: &str) -> Result<Self> {
        let value: u32 = s
            .trim()
            .parse()
            .map_err(|_| SerialError::InvalidBaudRate(s.to_string()))?;
        BaudRate::try_from(value)
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// How a port is attached to the host, as reported by enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortKind {
    Usb,
    Pci,
    Bluetooth,
    Virtual,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port: PortIdentifier,
    pub kind: PortKind,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl SerialDeviceInfo {
    /// Info for a port with no metadata beyond its name.
    pub fn bare(port: PortIdentifier, kind: PortKind) -> Self {
        Self {
            port,
            kind,
            vid: None,
            pid: None,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }
}

/// Broad class of a failure, so callers can tell a caller mistake from a
/// flaky link from a device that is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Configuration,
    Transient,
    Permanent,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Failed to enumerate serial ports: {0}")]
    Enumeration(String),

    #[error("Port {0} already has an open session")]
    AlreadyOpen(PortIdentifier),

    #[error("Device not found: {0}")]
    DeviceNotFound(PortIdentifier),

    #[error("Failed to open {port}: {message}")]
    OpenFailed { port: PortIdentifier, message: String },

    #[error("Write failed after {written} bytes: {source}")]
    Write {
        written: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("No data received within {0:?}")]
    ReadTimeout(Duration),

    #[error("Read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Unsupported baud rate: {0}")]
    InvalidBaudRate(String),

    #[error("Session on {0} is closed")]
    SessionClosed(PortIdentifier),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl SerialError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SerialError::InvalidBaudRate(_)
            | SerialError::AlreadyOpen(_)
            | SerialError::InvalidConfiguration(_) => ErrorCategory::Configuration,
            SerialError::OpenFailed { .. }
            | SerialError::Write { .. }
            | SerialError::ReadTimeout(_)
            | SerialError::Read(_)
            | SerialError::Cancelled => ErrorCategory::Transient,
            SerialError::Enumeration(_)
            | SerialError::DeviceNotFound(_)
            | SerialError::SessionClosed(_) => ErrorCategory::Permanent,
        }
    }

    /// Whether the error means the transport itself broke and the session must go.
    pub(crate) fn is_transport_failure(&self) -> bool {
        matches!(self, SerialError::Write { .. } | SerialError::Read(_))
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_rate_accepts_only_the_supported_set() {
        for baud in BaudRate::ALL {
            assert_eq!(BaudRate::try_from(baud.as_u32()).unwrap(), baud);
        }
        assert!(matches!(BaudRate::try_from(14400), Err(SerialError::InvalidBaudRate(_))));
        assert!(matches!(BaudRate::try_from(0), Err(SerialError::InvalidBaudRate(_))));
    }

    #[test]
    fn baud_rate_parses_from_strings() {
        assert_eq!("9600".parse::<BaudRate>().unwrap(), BaudRate::B9600);
        assert_eq!(" 115200 ".parse::<BaudRate>().unwrap(), BaudRate::B115200);
        assert!(matches!("fast".parse::<BaudRate>(), Err(SerialError::InvalidBaudRate(s)) if s == "fast"));
    }

    #[test]
    fn baud_rate_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&BaudRate::B57600).unwrap(), "57600");
        assert_eq!(serde_json::from_str::<BaudRate>("4800").unwrap(), BaudRate::B4800);
        assert!(serde_json::from_str::<BaudRate>("1200").is_err());
    }

    #[test]
    fn errors_are_categorized() {
        let port = PortIdentifier::new("/dev/ttyUSB0");
        assert_eq!(SerialError::AlreadyOpen(port.clone()).category(), ErrorCategory::Configuration);
        assert_eq!(SerialError::ReadTimeout(Duration::from_millis(10)).category(), ErrorCategory::Transient);
        assert_eq!(SerialError::DeviceNotFound(port).category(), ErrorCategory::Permanent);
    }
}
