use async_trait::async_trait;
use serialport::SerialPortType;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};

use super::{BaudRate, PortIdentifier, PortKind, Result, SerialDeviceInfo, SerialError};

/// Raw duplex byte stream to one open device.
///
/// Anything that is `AsyncRead + AsyncWrite` qualifies: a `tokio_serial::SerialStream`
/// for real hardware, a `tokio::io::DuplexStream` for simulated devices.
pub trait SerialTransport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SerialTransport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Host-side access to serial devices: enumeration and opening.
#[async_trait]
pub trait PortBackend: Send + Sync {
    /// Snapshot of the devices currently present.
    async fn available_ports(&self) -> Result<Vec<SerialDeviceInfo>>;

    /// Open a device at the given line speed (8N1, no flow control).
    async fn open(&self, port: &PortIdentifier, baud: BaudRate) -> Result<Box<dyn SerialTransport>>;
}

/// Backend for the host's real serial ports.
#[derive(Debug, Clone, Default)]
pub struct SystemBackend;

impl SystemBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PortBackend for SystemBackend {
    async fn available_ports(&self) -> Result<Vec<SerialDeviceInfo>> {
        // Enumeration walks the platform device registry and may block
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .map_err(|e| SerialError::Enumeration(e.to_string()))?
            .map_err(|e| SerialError::Enumeration(e.to_string()))?;

        Ok(ports.into_iter().map(device_info).collect())
    }

    async fn open(&self, port: &PortIdentifier, baud: BaudRate) -> Result<Box<dyn SerialTransport>> {
        log::debug!("Opening {} at {} baud", port, baud);
        let stream = tokio_serial::new(port.as_str(), baud.as_u32())
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| open_error(port, e))?;

        Ok(Box::new(stream))
    }
}

fn device_info(port: serialport::SerialPortInfo) -> SerialDeviceInfo {
    let id = PortIdentifier::new(port.port_name);
    match port.port_type {
        SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
            port: id,
            kind: PortKind::Usb,
            vid: Some(usb_info.vid),
            pid: Some(usb_info.pid),
            serial_number: usb_info.serial_number,
            manufacturer: usb_info.manufacturer,
            product: usb_info.product,
        },
        SerialPortType::PciPort => SerialDeviceInfo::bare(id, PortKind::Pci),
        SerialPortType::BluetoothPort => SerialDeviceInfo::bare(id, PortKind::Bluetooth),
        SerialPortType::Unknown => SerialDeviceInfo::bare(id, PortKind::Unknown),
    }
}

fn open_error(port: &PortIdentifier, error: tokio_serial::Error) -> SerialError {
    match error.kind {
        tokio_serial::ErrorKind::NoDevice
        | tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => SerialError::DeviceNotFound(port.clone()),
        _ => SerialError::OpenFailed {
            port: port.clone(),
            message: error.description,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_maps_to_not_found() {
        let port = PortIdentifier::new("/dev/ttyNOPE");
        let err = open_error(&port, tokio_serial::Error::new(tokio_serial::ErrorKind::NoDevice, "gone"));
        assert!(matches!(err, SerialError::DeviceNotFound(p) if p == port));

        let err = open_error(
            &port,
            tokio_serial::Error::new(tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound), "no such file"),
        );
        assert!(matches!(err, SerialError::DeviceNotFound(_)));
    }

    #[test]
    fn other_open_failures_keep_the_platform_message() {
        let port = PortIdentifier::new("/dev/ttyS0");
        let err = open_error(
            &port,
            tokio_serial::Error::new(
                tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied),
                "Permission denied",
            ),
        );
        match err {
            SerialError::OpenFailed { message, .. } => assert_eq!(message, "Permission denied"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
