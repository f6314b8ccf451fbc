//! Serial transport layer for bootloader communication.
//!
//! Provides a trait-based abstraction over device enumeration and byte
//! streams, enabling both real hardware and mock testing.

use std::io::{Read, Write};
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serialport::{available_ports, SerialPort, SerialPortType};

use super::config::{MAX_OPEN_RETRIES, OPEN_RETRY_DELAY, SERIAL_READ_TIMEOUT};
use super::error::{TransportError, TransportResult};

/// What the transport knows about one port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Serial port path (e.g., "/dev/ttyACM0" or "COM3").
    pub port: String,
    /// USB Vendor ID (0 for non-USB ports).
    pub vid: u16,
    /// USB Product ID (0 for non-USB ports).
    pub pid: u16,
    /// Device serial number (if available).
    pub serial_number: Option<String>,
    /// Product name (if available).
    pub product: Option<String>,
    /// Manufacturer name (if available).
    pub manufacturer: Option<String>,
}

/// Device enumeration and channel opening.
#[cfg_attr(test, automock)]
pub trait Transport: Send {
    /// List the ports currently present.
    fn list_devices(&self) -> TransportResult<Vec<DeviceDescriptor>>;

    /// Open an exclusive byte channel to a device.
    fn open(&self, descriptor: &DeviceDescriptor) -> TransportResult<Box<dyn Channel>>;
}

/// A byte stream to one device.
#[cfg_attr(test, automock)]
pub trait Channel: Send {
    /// Send bytes to the device.
    fn send(&mut self, bytes: &[u8]) -> TransportResult<()>;

    /// Receive whatever arrives within `timeout`.
    ///
    /// An empty result means nothing arrived before the timeout expired.
    fn receive(&mut self, timeout: Duration) -> TransportResult<Vec<u8>>;

    /// Release the device.
    fn close(&mut self) -> TransportResult<()>;
}

/// Serial port transport implementation.
#[derive(Debug, Clone)]
pub struct SerialTransport {
    baud_rate: u32,
}

impl SerialTransport {
    /// Create a transport opening ports at the given baud rate.
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl Transport for SerialTransport {
    fn list_devices(&self) -> TransportResult<Vec<DeviceDescriptor>> {
        let mut devices = Vec::new();

        for port in available_ports()? {
            // On macOS, skip tty.* ports to avoid duplicates
            // Each USB serial device appears as both /dev/cu.* and /dev/tty.*
            #[cfg(target_os = "macos")]
            if port.port_name.contains("/dev/tty.") {
                continue;
            }

            let descriptor = match &port.port_type {
                SerialPortType::UsbPort(usb_info) => DeviceDescriptor {
                    port: port.port_name.clone(),
                    vid: usb_info.vid,
                    pid: usb_info.pid,
                    serial_number: usb_info.serial_number.clone(),
                    product: usb_info.product.clone(),
                    manufacturer: usb_info.manufacturer.clone(),
                },
                _ => DeviceDescriptor {
                    port: port.port_name.clone(),
                    vid: 0,
                    pid: 0,
                    serial_number: None,
                    product: None,
                    manufacturer: None,
                },
            };
            devices.push(descriptor);
        }

        Ok(devices)
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> TransportResult<Box<dyn Channel>> {
        let channel = SerialChannel::open(&descriptor.port, self.baud_rate)?;
        Ok(Box::new(channel))
    }
}

/// An open serial port.
pub struct SerialChannel {
    port: Option<Box<dyn SerialPort>>,
}

impl SerialChannel {
    /// Open a serial port exclusively.
    ///
    /// Retries when the driver reports a transient error, which happens right
    /// after USB re-enumeration while the driver is not fully ready.
    pub fn open(port_name: &str, baud_rate: u32) -> TransportResult<Self> {
        let normalized_name = normalize_port_name(port_name);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let builder = serialport::new(&normalized_name, baud_rate)
                .timeout(SERIAL_READ_TIMEOUT)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None);

            match open_exclusive(builder) {
                Ok(port) => {
                    // Clear any pending input data from previous sessions
                    port.clear(serialport::ClearBuffer::Input).ok();
                    return Ok(Self { port: Some(port) });
                }
                Err(e) => {
                    let err_str = e.to_string().to_lowercase();

                    // Transient errors that may resolve after driver initialization
                    let is_transient = err_str.contains("not functioning")
                        || err_str.contains("temporarily unavailable")
                        || err_str.contains("interrupted");

                    if is_transient && attempt < MAX_OPEN_RETRIES {
                        log::debug!(
                            "Opening {} failed ({}), retrying ({}/{})",
                            port_name,
                            e,
                            attempt,
                            MAX_OPEN_RETRIES
                        );
                        std::thread::sleep(OPEN_RETRY_DELAY);
                        continue;
                    }

                    return Err(classify_open_error(port_name, e));
                }
            }
        }
    }

    fn port(&mut self) -> TransportResult<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(TransportError::Closed)
    }
}

impl Channel for SerialChannel {
    fn send(&mut self, bytes: &[u8]) -> TransportResult<()> {
        let port = self.port()?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> TransportResult<Vec<u8>> {
        let port = self.port()?;
        port.set_timeout(timeout)?;

        let mut buffer = [0u8; 512];
        match port.read(&mut buffer) {
            Ok(n) => Ok(buffer[..n].to_vec()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn close(&mut self) -> TransportResult<()> {
        // Dropping the handle releases the port
        self.port.take();
        Ok(())
    }
}

/// Open a port that no other process can open until it is dropped.
#[cfg(unix)]
fn open_exclusive(builder: serialport::SerialPortBuilder) -> serialport::Result<Box<dyn SerialPort>> {
    let mut port = builder.open_native()?;
    port.set_exclusive(true)?;
    Ok(Box::new(port))
}

/// Open a port; Windows only ever grants one handle per COM port.
#[cfg(not(unix))]
fn open_exclusive(builder: serialport::SerialPortBuilder) -> serialport::Result<Box<dyn SerialPort>> {
    builder.open()
}

/// Map a port open failure to a transport error.
fn classify_open_error(port_name: &str, e: serialport::Error) -> TransportError {
    let err_str = e.to_string().to_lowercase();

    // A held lock is reported as a missing device by some backends
    if err_str.contains("busy")
        || err_str.contains("in use")
        || err_str.contains("access is denied")
        || err_str.contains("exclusive lock")
    {
        return TransportError::PortBusy {
            port: port_name.to_string(),
        };
    }

    match e.kind() {
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            TransportError::PortPermissionDenied {
                port: port_name.to_string(),
            }
        }
        serialport::ErrorKind::NoDevice
        | serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => TransportError::PortNotFound {
            port: port_name.to_string(),
        },
        _ => TransportError::Serial(e),
    }
}

/// Normalize a port name for cross-platform compatibility.
fn normalize_port_name(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        // Prefer cu. over tty. for better compatibility
        if name.starts_with("/dev/tty.") {
            return name.replace("/dev/tty.", "/dev/cu.");
        }
    }

    #[cfg(target_os = "windows")]
    {
        // COM ports > 9 need \\.\\ prefix
        if name.starts_with("COM") {
            if let Ok(n) = name[3..].parse::<u32>() {
                if n > 9 {
                    return format!("\\\\.\\{}", name);
                }
            }
        }
    }

    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_port_name_passthrough() {
        assert_eq!(normalize_port_name("/dev/ttyACM0"), "/dev/ttyACM0");
        assert_eq!(normalize_port_name("COM1"), "COM1");
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn test_normalize_port_name_macos_tty_to_cu() {
        assert_eq!(
            normalize_port_name("/dev/tty.usbmodem1234"),
            "/dev/cu.usbmodem1234"
        );
    }

    #[cfg(target_os = "windows")]
    #[test]
    fn test_normalize_port_name_windows_high_com() {
        assert_eq!(normalize_port_name("COM9"), "COM9");
        assert_eq!(normalize_port_name("COM10"), "\\\\.\\COM10");
    }

    #[test]
    fn test_classify_busy_port() {
        let err = serialport::Error::new(serialport::ErrorKind::Unknown, "Device or resource busy");
        assert!(matches!(
            classify_open_error("/dev/ttyACM0", err),
            TransportError::PortBusy { port } if port == "/dev/ttyACM0"
        ));
    }

    #[test]
    fn test_classify_missing_port() {
        let err = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert!(matches!(
            classify_open_error("COM7", err),
            TransportError::PortNotFound { .. }
        ));
    }

    #[test]
    fn test_classify_other_error() {
        let err = serialport::Error::new(serialport::ErrorKind::InvalidInput, "bad baud");
        assert!(matches!(
            classify_open_error("COM7", err),
            TransportError::Serial(_)
        ));
    }

    #[test]
    fn test_classify_lock_held_as_busy() {
        let err = serialport::Error::new(
            serialport::ErrorKind::NoDevice,
            "Unable to acquire exclusive lock on serial port",
        );
        assert!(matches!(
            classify_open_error("/dev/ttyACM0", err),
            TransportError::PortBusy { .. }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_second_open_of_claimed_port_fails() {
        use serialport::TTYPort;

        let (_master, slave) = TTYPort::pair().unwrap();
        let name = slave.name().unwrap();

        let mut first = SerialChannel::open(&name, 115_200).unwrap();
        let second = SerialChannel::open(&name, 115_200);
        assert!(matches!(second, Err(TransportError::PortBusy { .. })));

        first.close().unwrap();
    }

    #[test]
    fn test_open_missing_port_fails() {
        let result = SerialChannel::open("/dev/this-port-does-not-exist", 115_200);
        assert!(result.is_err());
    }
}
