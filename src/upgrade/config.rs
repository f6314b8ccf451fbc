//! Configuration constants for the Thymio bootloader protocol.

use std::time::Duration;

// ============================================================================
// USB Device Identifiers
// ============================================================================

/// Mobsya (EPFL) USB Vendor ID used by the Thymio II.
pub const THYMIO_VID: u16 = 0x0617;

/// Product IDs of the Thymio II when plugged directly over USB.
pub const THYMIO_PIDS: &[u16] = &[
    0x000A, // Thymio-II
];

/// Product string prefix reported by the robot's USB serial interface.
pub const THYMIO_PRODUCT_PREFIX: &str = "Thymio-II";

// ============================================================================
// Serial Communication
// ============================================================================

/// Baud rate of the robot's USB CDC link (ignored by the device, required by the API).
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Serial read timeout applied when the port is opened.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Number of attempts at opening a port that reports a transient driver error.
pub const MAX_OPEN_RETRIES: u32 = 5;

/// Delay between two port open attempts.
pub const OPEN_RETRY_DELAY: Duration = Duration::from_millis(200);

// ============================================================================
// Bootloader Protocol Timeouts
// ============================================================================

/// Timeout waiting for a reply to a regular bootloader command.
pub const ACK_TIMEOUT_MS: u64 = 2000;

/// Timeout waiting for the flash description after asking the robot to reboot
/// into its bootloader. The robot has to reset, so this is longer.
pub const CONNECT_TIMEOUT_MS: u64 = 5000;

// ============================================================================
// Message Framing
// ============================================================================

/// Node id used by the host as message source.
pub const HOST_NODE_ID: u16 = 0;

/// Node id of a Thymio II on a direct USB link.
pub const DEFAULT_TARGET_NODE: u16 = 1;

/// Size of the frame header: payload length, source and type, 16 bits each.
pub const FRAME_HEADER_SIZE: usize = 6;

/// Largest payload accepted from the device. Anything bigger is a corrupted
/// stream, no bootloader message comes close.
pub const MAX_FRAME_PAYLOAD: usize = 4096;

/// Bootloader message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Leave the bootloader and start the application.
    Reset = 0x8000,
    /// Erase a run of flash pages.
    Erase = 0x8001,
    /// Write one flash page.
    WritePage = 0x8002,
    /// Ask for the CRC of a flash page.
    ReadChecksum = 0x8003,
    /// Flash geometry, sent by the bootloader when it starts.
    Description = 0x8004,
    /// CRC of a flash page, reply to `ReadChecksum`.
    PageChecksum = 0x8005,
    /// Command status.
    Ack = 0x8006,
    /// Reboot the application into the bootloader.
    EnterBootloader = 0x800C,
}

impl MessageType {
    /// Parse a message type from its wire value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x8000 => Some(MessageType::Reset),
            0x8001 => Some(MessageType::Erase),
            0x8002 => Some(MessageType::WritePage),
            0x8003 => Some(MessageType::ReadChecksum),
            0x8004 => Some(MessageType::Description),
            0x8005 => Some(MessageType::PageChecksum),
            0x8006 => Some(MessageType::Ack),
            0x800C => Some(MessageType::EnterBootloader),
            _ => None,
        }
    }
}

/// Status codes carried by an `Ack` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AckStatus {
    Success = 0,
    InvalidFrameSize = 1,
    ProgrammingFailed = 2,
    NotProgramming = 3,
    AddressOutOfRange = 4,
}

impl AckStatus {
    /// Parse a status code. Unknown codes return `None`.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0 => Some(AckStatus::Success),
            1 => Some(AckStatus::InvalidFrameSize),
            2 => Some(AckStatus::ProgrammingFailed),
            3 => Some(AckStatus::NotProgramming),
            4 => Some(AckStatus::AddressOutOfRange),
            _ => None,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            AckStatus::Success => "Operation successful",
            AckStatus::InvalidFrameSize => "Invalid frame size",
            AckStatus::ProgrammingFailed => "Flash programming failed",
            AckStatus::NotProgramming => "Bootloader is not programming",
            AckStatus::AddressOutOfRange => "Address outside programmable flash",
        }
    }
}

/// Flag bit in the flash description: the bootloader can report page CRCs.
pub const FLAG_PAGE_CHECKSUM: u16 = 0x0001;

// ============================================================================
// Helper Functions
// ============================================================================

/// Check if a VID/PID combination is a Thymio II.
pub fn is_thymio_usb_id(vid: u16, pid: u16) -> bool {
    vid == THYMIO_VID && THYMIO_PIDS.contains(&pid)
}

/// Check if a USB product string names a Thymio II.
pub fn is_thymio_product(product: &str) -> bool {
    product.starts_with(THYMIO_PRODUCT_PREFIX)
}
