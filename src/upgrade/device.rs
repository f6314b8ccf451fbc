//! Device detection for the Thymio II.
//!
//! Finds robots among the ports the transport reports, by USB VID/PID or by
//! the product name of their serial interface.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::config::{is_thymio_product, is_thymio_usb_id};
use super::error::UpgradeError;
use super::transport::{DeviceDescriptor, Transport};

/// An additional VID/PID pair to accept as a Thymio II.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

/// A robot found during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Stable identifier: the USB serial number, else the port path.
    pub id: String,
    /// Everything the transport reported for the port.
    pub descriptor: DeviceDescriptor,
}

impl DeviceHandle {
    /// Wrap a transport descriptor.
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        let id = descriptor
            .serial_number
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| descriptor.port.clone());
        Self { id, descriptor }
    }

    /// Transport-level address of the device.
    pub fn address(&self) -> &str {
        &self.descriptor.port
    }

    /// Get a display label for this device.
    pub fn label(&self) -> String {
        match self.descriptor.product.as_deref() {
            Some(name) if !name.is_empty() => format!("{} ({})", name, self.descriptor.port),
            _ => format!("Thymio-II ({})", self.descriptor.port),
        }
    }
}

/// Check whether a port looks like a Thymio II.
pub fn is_candidate(descriptor: &DeviceDescriptor, extra_ids: &[UsbId]) -> bool {
    is_thymio_usb_id(descriptor.vid, descriptor.pid)
        || extra_ids
            .iter()
            .any(|id| id.vid == descriptor.vid && id.pid == descriptor.pid)
        || descriptor
            .product
            .as_deref()
            .is_some_and(is_thymio_product)
}

/// Find all connected Thymio II robots.
///
/// Takes a snapshot of the transport's ports; call again to re-enumerate.
/// An enumeration failure is logged and reported as no device.
pub fn scan(transport: &dyn Transport, extra_ids: &[UsbId]) -> Vec<DeviceHandle> {
    let descriptors = match transport.list_devices() {
        Ok(descriptors) => descriptors,
        Err(e) => {
            log::warn!("Device enumeration failed: {}", e);
            return Vec::new();
        }
    };

    let devices: Vec<DeviceHandle> = descriptors
        .into_iter()
        .filter(|d| is_candidate(d, extra_ids))
        .map(DeviceHandle::new)
        .collect();

    log::debug!("Scan found {} Thymio II candidate(s)", devices.len());
    devices
}

/// Require exactly one device.
pub fn resolve_single(mut devices: Vec<DeviceHandle>) -> Result<DeviceHandle, UpgradeError> {
    match devices.len() {
        0 => Err(UpgradeError::DeviceNotFound),
        1 => Ok(devices.remove(0)),
        _ => Err(UpgradeError::MultipleDevicesFound {
            descriptors: devices.iter().map(DeviceHandle::label).collect(),
        }),
    }
}

/// Labels for a device list, numbering products that appear more than once.
///
/// Two robots both called "Thymio-II" become "Thymio-II #1" and "Thymio-II #2".
pub fn numbered_labels(devices: &[DeviceHandle]) -> Vec<String> {
    let name = |d: &DeviceHandle| {
        d.descriptor
            .product
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "Thymio-II".to_string())
    };

    let mut totals: HashMap<String, usize> = HashMap::new();
    for device in devices {
        *totals.entry(name(device)).or_default() += 1;
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    devices
        .iter()
        .map(|device| {
            let product = name(device);
            if totals[&product] > 1 {
                let index = seen.entry(product.clone()).or_default();
                *index += 1;
                format!("{} #{} ({})", product, index, device.address())
            } else {
                device.label()
            }
        })
        .collect()
}
