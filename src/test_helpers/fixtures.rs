use std::fmt::Write as _;

use crate::upgrade::{DeviceDescriptor, FlashLayout, FLAG_PAGE_CHECKSUM, THYMIO_PIDS, THYMIO_VID};

/// Builder for creating test DeviceDescriptor instances
pub struct DescriptorBuilder {
    port: String,
    vid: u16,
    pid: u16,
    serial_number: Option<String>,
    product: Option<String>,
    manufacturer: Option<String>,
}

impl DescriptorBuilder {
    pub fn new() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            vid: THYMIO_VID,
            pid: THYMIO_PIDS[0],
            serial_number: None,
            product: Some("Thymio-II".to_string()),
            manufacturer: Some("EPFL".to_string()),
        }
    }

    pub fn port(mut self, port: &str) -> Self {
        self.port = port.to_string();
        self
    }

    pub fn usb_id(mut self, vid: u16, pid: u16) -> Self {
        self.vid = vid;
        self.pid = pid;
        self
    }

    pub fn serial_number(mut self, serial: &str) -> Self {
        self.serial_number = Some(serial.to_string());
        self
    }

    pub fn product(mut self, product: &str) -> Self {
        self.product = Some(product.to_string());
        self
    }

    pub fn no_product(mut self) -> Self {
        self.product = None;
        self
    }

    /// An FTDI serial adapter that is not a robot.
    pub fn other_device(self) -> Self {
        let mut builder = self.usb_id(0x0403, 0x6001).product("FT232R USB UART");
        builder.manufacturer = Some("FTDI".to_string());
        builder
    }

    pub fn build(self) -> DeviceDescriptor {
        DeviceDescriptor {
            port: self.port,
            vid: self.vid,
            pid: self.pid,
            serial_number: self.serial_number,
            product: self.product,
            manufacturer: self.manufacturer,
        }
    }
}

impl Default for DescriptorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for the flash layout a fake bootloader announces
pub struct LayoutBuilder {
    layout: FlashLayout,
}

impl LayoutBuilder {
    pub fn new() -> Self {
        Self {
            layout: FlashLayout {
                page_size: 2048,
                pages_start: 0,
                pages_count: 64,
                flags: 0,
            },
        }
    }

    pub fn page_size(mut self, page_size: u16) -> Self {
        self.layout.page_size = page_size;
        self
    }

    pub fn pages_start(mut self, pages_start: u16) -> Self {
        self.layout.pages_start = pages_start;
        self
    }

    pub fn pages_count(mut self, pages_count: u16) -> Self {
        self.layout.pages_count = pages_count;
        self
    }

    pub fn with_checksum(mut self) -> Self {
        self.layout.flags |= FLAG_PAGE_CHECKSUM;
        self
    }

    pub fn build(self) -> FlashLayout {
        self.layout
    }
}

impl Default for LayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for Intel-HEX text with valid checksums.
///
/// Records are emitted in the order they are added, followed by an
/// end-of-file record.
pub struct HexImageBuilder {
    lines: Vec<String>,
}

impl HexImageBuilder {
    pub fn new() -> Self {
        Self { lines: Vec::new() }
    }

    pub fn data(self, offset: u16, bytes: &[u8]) -> Self {
        self.record(0x00, offset, bytes)
    }

    pub fn extended_segment(self, segment: u16) -> Self {
        self.record(0x02, 0, &segment.to_be_bytes())
    }

    pub fn start_segment(self, cs: u16, ip: u16) -> Self {
        let mut bytes = cs.to_be_bytes().to_vec();
        bytes.extend_from_slice(&ip.to_be_bytes());
        self.record(0x03, 0, &bytes)
    }

    pub fn extended_linear(self, upper: u16) -> Self {
        self.record(0x04, 0, &upper.to_be_bytes())
    }

    pub fn start_linear(self, eip: u32) -> Self {
        self.record(0x05, 0, &eip.to_be_bytes())
    }

    fn record(mut self, kind: u8, offset: u16, bytes: &[u8]) -> Self {
        let mut raw = vec![bytes.len() as u8];
        raw.extend_from_slice(&offset.to_be_bytes());
        raw.push(kind);
        raw.extend_from_slice(bytes);
        let sum = raw.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        raw.push(0u8.wrapping_sub(sum));

        let mut line = String::from(":");
        for byte in raw {
            write!(line, "{:02X}", byte).expect("writing to a String cannot fail");
        }
        self.lines.push(line);
        self
    }

    pub fn build(self) -> String {
        let mut text = self.lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(":00000001FF\n");
        text
    }
}

impl Default for HexImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}
