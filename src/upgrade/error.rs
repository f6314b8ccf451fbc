//! Error types for the Thymio firmware upgrade engine.

use std::path::PathBuf;

use thiserror::Error;

use super::session::SessionState;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type alias for bootloader session operations.
pub type BootloaderResult<T> = Result<T, BootloaderError>;

/// Errors raised while parsing an Intel-HEX image. Line numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The image ended without an end-of-file record.
    #[error("Hex image is truncated: no end-of-file record")]
    Truncated,

    /// A record's checksum byte does not match its contents.
    #[error("Checksum mismatch on line {0}")]
    ChecksumMismatch(usize),

    /// A line is not a valid Intel-HEX record.
    #[error("Malformed record on line {0}")]
    MalformedLine(usize),

    /// A data record writes to bytes already written by an earlier record.
    #[error("Data record on line {line} overlaps earlier data at 0x{address:08X}")]
    Overlap { line: usize, address: u32 },
}

/// Errors from the serial transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Serial port error from the serialport crate.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port is busy (in use by another process).
    #[error("Port '{port}' is busy or in use by another application")]
    PortBusy { port: String },

    /// Permission denied accessing serial port.
    #[error("Permission denied for port '{port}'")]
    PortPermissionDenied { port: String },

    /// The port vanished, usually because the robot was unplugged.
    #[error("Port '{port}' not found")]
    PortNotFound { port: String },

    /// The channel was already closed.
    #[error("Channel is closed")]
    Closed,
}

/// Failure to reach the bootloader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The device did not answer, or another program holds the link.
    #[error("Cannot connect to Thymio II: {0}")]
    Unreachable(String),
}

/// Errors raised by a bootloader session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootloaderError {
    /// Timeout, malformed reply or unexpected status on the link.
    #[error("Communication error: {0}")]
    Communication(String),

    /// The device rejected an operation.
    #[error("Device error: {0}")]
    Device(String),

    /// The host asked for something the protocol does not allow.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The command is not valid in the session's current state.
    #[error("Operation {operation} is not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// Cancellation was asked after flash contents started changing.
    #[error("Cannot cancel once the flash is being modified (state {state:?})")]
    CancelRefused { state: SessionState },
}

/// Categories of upgrade failure, without their details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    ImageUnreadable,
    EmptyImage,
    DeviceNotFound,
    MultipleDevicesFound,
    Unreachable,
    Communication,
    Device,
    Protocol,
    Cancelled,
    Busy,
}

/// Every way an upgrade attempt can fail.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The hex image is not valid.
    #[error("Unable to read hex file: {0}")]
    Parse(#[from] ParseError),

    /// The hex image file could not be read.
    #[error("Unable to open hex file '{}': {source}", .path.display())]
    ImageUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The hex image holds no data to write.
    #[error("Hex image contains no data records")]
    EmptyImage,

    /// No Thymio II is plugged in.
    #[error("Cannot find Thymio II")]
    DeviceNotFound,

    /// More than one candidate; the user has to unplug the others.
    #[error("Several Thymio II found, keep only one plugged in: {}", .descriptors.join(", "))]
    MultipleDevicesFound { descriptors: Vec<String> },

    /// The bootloader could not be reached.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// The bootloader session failed before any flash was erased.
    #[error(transparent)]
    Bootloader(#[from] BootloaderError),

    /// The bootloader session failed after the erase command was sent.
    #[error(transparent)]
    FlashInterrupted(BootloaderError),

    /// The user declined the pre-upgrade warning.
    #[error("Upgrade cancelled by user")]
    Cancelled,

    /// Another upgrade is already running.
    #[error("An upgrade is already in progress on {port}")]
    Busy { port: String },
}

impl UpgradeError {
    /// Get the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpgradeError::Parse(_) => ErrorKind::Parse,
            UpgradeError::ImageUnreadable { .. } => ErrorKind::ImageUnreadable,
            UpgradeError::EmptyImage => ErrorKind::EmptyImage,
            UpgradeError::DeviceNotFound => ErrorKind::DeviceNotFound,
            UpgradeError::MultipleDevicesFound { .. } => ErrorKind::MultipleDevicesFound,
            UpgradeError::Connect(ConnectError::Unreachable(_)) => ErrorKind::Unreachable,
            UpgradeError::Bootloader(e) | UpgradeError::FlashInterrupted(e) => match e {
                BootloaderError::Communication(_) => ErrorKind::Communication,
                BootloaderError::Device(_) => ErrorKind::Device,
                _ => ErrorKind::Protocol,
            },
            UpgradeError::Cancelled => ErrorKind::Cancelled,
            UpgradeError::Busy { .. } => ErrorKind::Busy,
        }
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Parse => "UPG-001",
            ErrorKind::ImageUnreadable => "UPG-002",
            ErrorKind::EmptyImage => "UPG-003",
            ErrorKind::DeviceNotFound => "UPG-010",
            ErrorKind::MultipleDevicesFound => "UPG-011",
            ErrorKind::Unreachable => "UPG-020",
            ErrorKind::Communication => "UPG-030",
            ErrorKind::Device => "UPG-031",
            ErrorKind::Protocol => "UPG-032",
            ErrorKind::Busy => "UPG-040",
            ErrorKind::Cancelled => "UPG-099",
        }
    }

    /// Whether the flash may have been partially rewritten.
    pub fn device_state_undefined(&self) -> bool {
        matches!(self, UpgradeError::FlashInterrupted(_))
    }

    /// Message for the person running the upgrade.
    pub fn user_message(&self) -> String {
        let mut message = format!("[{}] {}", self.error_code(), self);
        match self {
            UpgradeError::Connect(_) => message.push_str(
                ". Most probably another program is currently connected to the Thymio II; \
                 make sure no Studio or other updater is running and try again",
            ),
            _ if self.device_state_undefined() => message.push_str(
                ". The robot firmware is now in an undefined state: \
                 restart the upgrade from the beginning, do not unplug the robot",
            ),
            _ => {}
        }
        message
    }
}
