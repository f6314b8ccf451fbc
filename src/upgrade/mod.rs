//! Firmware upgrade engine for the Thymio II robot.
//!
//! Reprograms the robot's flash over its USB serial link by driving the
//! resident bootloader.
//!
//! # Protocol Overview
//!
//! The upgrade consists of:
//! 1. **Device Detection** - Find exactly one Thymio II by USB VID/PID or product name
//! 2. **Image Parsing** - Read and validate an Intel-HEX firmware image
//! 3. **Confirmation** - Warn the user not to unplug the robot
//! 4. **Bootloader Entry** - Reboot into the bootloader, read the flash layout
//! 5. **Erase and Write** - Erase the image span, write it page by page
//! 6. **Verification** - Compare page checksums, when the bootloader can
//! 7. **Reset** - Boot the new firmware
//!
//! # Example
//!
//! ```ignore
//! use upgrade::{ImageSource, SerialTransport, Upgrader};
//!
//! let upgrader = Upgrader::new(SerialTransport::new(115_200), settings);
//! let result = upgrader.upgrade(
//!     &ImageSource::File("thymio.hex".into()),
//!     |warning| ask_user(warning),
//!     |stage| println!("{}: {:.0}%", stage.message(), stage.percent()),
//! );
//! ```

mod config;
mod device;
mod error;
mod hex;
mod message;
mod orchestrator;
mod session;
mod transport;

// Configuration
pub use config::{ACK_TIMEOUT_MS, CONNECT_TIMEOUT_MS, DEFAULT_BAUD_RATE, DEFAULT_TARGET_NODE};

// Errors
pub use error::{ErrorKind, UpgradeError};

// Device detection
pub use device::{numbered_labels, DeviceHandle, UsbId};

// Image parsing
pub use hex::{parse_file, FirmwareImage, RecordKind};

// Session
pub use session::{SessionConfig, SessionState};

// Orchestration
pub use orchestrator::{ImageSource, UpgradeResult, UpgradeStage, Upgrader};

// Transport
pub use transport::{SerialTransport, Transport};

// Test doubles need the wire-level types
#[cfg(test)]
pub use config::{AckStatus, MessageType, FLAG_PAGE_CHECKSUM, THYMIO_PIDS, THYMIO_VID};
#[cfg(test)]
pub use error::{TransportError, TransportResult};
#[cfg(test)]
pub use message::{FlashLayout, FrameDecoder, Message};
#[cfg(test)]
pub use session::page_checksum;
#[cfg(test)]
pub use transport::{Channel, DeviceDescriptor, MockTransport};
