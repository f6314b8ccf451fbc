//! `scan` command: list connected robots.

use serde::Serialize;
use std::sync::Arc;

use crate::upgrade::{numbered_labels, DeviceHandle, Transport, Upgrader};

/// Device information for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedDevice {
    /// Stable identifier (serial number or port).
    pub id: String,
    /// Serial port path.
    pub port: String,
    /// Display label, numbered when several robots share a name.
    pub label: String,
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
    /// Device serial number (if available).
    pub serial_number: Option<String>,
    /// Whether an upgrade currently holds this robot.
    pub in_use: bool,
}

impl ScannedDevice {
    fn new(handle: &DeviceHandle, label: String, claimed: Option<&str>) -> Self {
        Self {
            id: handle.id.clone(),
            port: handle.address().to_string(),
            label,
            vid: handle.descriptor.vid,
            pid: handle.descriptor.pid,
            serial_number: handle.descriptor.serial_number.clone(),
            in_use: claimed == Some(handle.address()),
        }
    }
}

/// Detect connected robots.
///
/// Robots with duplicate labels are numbered (e.g., "Thymio-II #1", "Thymio-II #2").
pub fn list_devices<T: Transport>(upgrader: &Upgrader<T>) -> Vec<ScannedDevice> {
    let devices = upgrader.scan();
    let claimed = upgrader.claimed_port();
    numbered_labels(&devices)
        .into_iter()
        .zip(&devices)
        .map(|(label, handle)| ScannedDevice::new(handle, label, claimed.as_deref()))
        .collect()
}

/// Print the robots currently connected.
pub async fn run<T>(upgrader: Arc<Upgrader<T>>, json: bool) -> Result<(), String>
where
    T: Transport + Sync + 'static,
{
    // Port enumeration blocks
    let devices = tokio::task::spawn_blocking(move || list_devices(&upgrader))
        .await
        .map_err(|e| format!("Failed to detect devices: {}", e))?;

    if json {
        let text = serde_json::to_string_pretty(&devices)
            .map_err(|e| format!("Failed to serialize devices: {}", e))?;
        println!("{}", text);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No Thymio II found");
        return Ok(());
    }

    for device in &devices {
        let usage = if device.in_use { " [in use]" } else { "" };
        println!(
            "{}  {:04x}:{:04x}  {}{}",
            device.port, device.vid, device.pid, device.label, usage
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::UpgraderSettings;
    use crate::test_helpers::DescriptorBuilder;
    use crate::upgrade::MockTransport;

    #[test]
    fn test_list_devices_numbers_duplicates() {
        let mut transport = MockTransport::new();
        transport.expect_list_devices().returning(|| {
            Ok(vec![
                DescriptorBuilder::new()
                    .port("/dev/ttyACM0")
                    .serial_number("A1")
                    .build(),
                DescriptorBuilder::new().port("/dev/ttyACM1").build(),
                DescriptorBuilder::new().port("/dev/ttyS0").other_device().build(),
            ])
        });
        let upgrader = Upgrader::new(transport, UpgraderSettings::default());

        let devices = list_devices(&upgrader);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "A1");
        assert_eq!(devices[0].label, "Thymio-II #1 (/dev/ttyACM0)");
        assert_eq!(devices[1].label, "Thymio-II #2 (/dev/ttyACM1)");
        assert!(!devices[0].in_use);
    }

    #[test]
    fn test_scanned_device_json() {
        let handle = DeviceHandle::new(DescriptorBuilder::new().port("COM3").build());
        let device = ScannedDevice::new(&handle, handle.label(), Some("COM3"));
        let json = serde_json::to_string(&device).unwrap();
        assert!(json.contains("\"inUse\":true"));
        assert!(json.contains("\"serialNumber\":null"));
    }
}
