//! Bootloader session: the exclusive conversation with one robot.
//!
//! A session drives the bootloader through a fixed sequence:
//! 1. `connect` - reboot the robot into its bootloader, read the flash layout
//! 2. `erase` - erase the pages covering the image span
//! 3. `write_page` - program pages one at a time, ascending
//! 4. `verify` - compare page checksums, when the bootloader supports it
//! 5. `reset_to_application` - boot the new firmware
//!
//! Every command waits for the device's reply before returning. A failure of
//! any kind is terminal: the session moves to `Errored`, releases the device,
//! and refuses every further command. Nothing is retried.

use std::ops::Range;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::config::{
    AckStatus, MessageType, ACK_TIMEOUT_MS, CONNECT_TIMEOUT_MS, DEFAULT_TARGET_NODE, HOST_NODE_ID,
};
use super::device::DeviceHandle;
use super::error::{BootloaderError, BootloaderResult, ConnectError, TransportError};
use super::message::{FlashLayout, Frame, FrameDecoder, Message};
use super::transport::{Channel, Transport};

/// Lifecycle of a bootloader session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Erasing,
    Writing,
    Verifying,
    Resetting,
    Completed,
    Errored,
    Cancelled,
}

impl SessionState {
    /// Whether no command is accepted anymore.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Errored | SessionState::Cancelled
        )
    }

    /// Whether flash contents may already have changed.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            SessionState::Erasing
                | SessionState::Writing
                | SessionState::Verifying
                | SessionState::Resetting
        )
    }
}

/// Result of the verification step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Every written page matched.
    Verified,
    /// The bootloader cannot report checksums.
    Skipped,
}

/// Protocol parameters of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Node id the commands are addressed to.
    pub target_node: u16,
    /// Reply timeout for regular commands.
    pub ack_timeout: Duration,
    /// Timeout for the flash description after asking for the bootloader.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_node: DEFAULT_TARGET_NODE,
            ack_timeout: Duration::from_millis(ACK_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
        }
    }
}

/// CRC-16 (XMODEM) of a page, as the bootloader computes it.
pub fn page_checksum(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// An exclusive bootloader session with one device.
pub struct BootloaderSession {
    handle: DeviceHandle,
    config: SessionConfig,
    state: SessionState,
    channel: Option<Box<dyn Channel>>,
    decoder: FrameDecoder,
    layout: Option<FlashLayout>,
    erased: Option<Range<u32>>,
    erase_sent: bool,
    last_written: Option<u32>,
    written: Vec<(u16, u16)>,
}

impl BootloaderSession {
    /// Create a session for a device. Nothing is opened until `connect`.
    pub fn new(handle: DeviceHandle, config: SessionConfig) -> Self {
        Self {
            handle,
            config,
            state: SessionState::Disconnected,
            channel: None,
            decoder: FrameDecoder::new(),
            layout: None,
            erased: None,
            erase_sent: false,
            last_written: None,
            written: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Flash layout reported by the bootloader, once connected.
    pub fn layout(&self) -> Option<FlashLayout> {
        self.layout
    }

    /// The device this session owns.
    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    /// Whether an erase command went out, so the flash may have changed.
    pub fn flash_touched(&self) -> bool {
        self.erase_sent
    }

    /// Open the device and switch it into bootloader mode.
    pub fn connect(&mut self, transport: &dyn Transport) -> Result<(), ConnectError> {
        if self.state != SessionState::Disconnected {
            return Err(ConnectError::Unreachable(format!(
                "session for {} is already {:?}",
                self.handle.label(),
                self.state
            )));
        }

        self.state = SessionState::Connecting;
        log::info!("Connecting to {}", self.handle.label());

        let channel = match transport.open(&self.handle.descriptor) {
            Ok(channel) => channel,
            Err(e) => {
                self.state = SessionState::Errored;
                return Err(ConnectError::Unreachable(open_failure_detail(&self.handle, e)));
            }
        };
        self.channel = Some(channel);

        match self.enter_bootloader() {
            Ok(layout) => {
                log::info!(
                    "Bootloader ready: {} pages of {} bytes from page {}, flags 0x{:04X}",
                    layout.pages_count,
                    layout.page_size,
                    layout.pages_start,
                    layout.flags
                );
                self.layout = Some(layout);
                self.state = SessionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.abort();
                Err(ConnectError::Unreachable(format!(
                    "{} did not enter its bootloader: {}",
                    self.handle.label(),
                    e
                )))
            }
        }
    }

    fn enter_bootloader(&mut self) -> BootloaderResult<FlashLayout> {
        let dest = self.config.target_node;
        self.send(&Message::EnterBootloader { dest })?;

        // The application may still be chatting while it reboots
        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = self.receive_frame(remaining)?;
            if MessageType::from_u16(frame.kind) != Some(MessageType::Description) {
                log::debug!(
                    "Ignoring message 0x{:04X} from node {} while waiting for bootloader",
                    frame.kind,
                    frame.source
                );
                continue;
            }

            let layout = match Message::decode(&frame)? {
                Message::Description(layout) => layout,
                other => return Err(unexpected_reply(&other, "EnterBootloader")),
            };
            if layout.page_size == 0 || layout.pages_count == 0 {
                return Err(BootloaderError::Communication(format!(
                    "invalid flash description {:?}",
                    layout
                )));
            }
            return Ok(layout);
        }
    }

    /// Erase the pages covering `span`.
    pub fn erase(&mut self, span: Range<u32>) -> BootloaderResult<()> {
        self.guard(|session| {
            session.require("erase", &[SessionState::Connected])?;
            let layout = session.connected_layout()?;

            if span.is_empty() {
                return Err(BootloaderError::InvalidRequest("empty erase span".into()));
            }

            let page_size = layout.page_size as u32;
            let first_page = span.start / page_size;
            let last_page = (span.end - 1) / page_size;
            let allowed = layout.pages_start as u32..layout.pages_start as u32 + layout.pages_count as u32;
            if !allowed.contains(&first_page) || !allowed.contains(&last_page) {
                let range = layout.programmable_range();
                return Err(BootloaderError::InvalidRequest(format!(
                    "image span 0x{:08X}..0x{:08X} is outside programmable flash 0x{:08X}..0x{:08X}",
                    span.start, span.end, range.start, range.end
                )));
            }

            let page_count = last_page - first_page + 1;
            session.state = SessionState::Erasing;
            session.erase_sent = true;
            log::info!("Erasing {} page(s) from page {}", page_count, first_page);

            session.exchange_ack(&Message::Erase {
                dest: session.config.target_node,
                first_page: first_page as u16,
                page_count: page_count as u16,
            })?;

            session.erased = Some(first_page * page_size..(last_page + 1) * page_size);
            Ok(())
        })
    }

    /// Program one page.
    ///
    /// Pages must be page-aligned, exactly one page long, inside the erased
    /// range, and strictly ascending.
    pub fn write_page(&mut self, address: u32, bytes: &[u8]) -> BootloaderResult<()> {
        self.guard(|session| {
            session.require("write_page", &[SessionState::Erasing, SessionState::Writing])?;
            let layout = session.connected_layout()?;
            let page_size = layout.page_size as u32;

            if address % page_size != 0 {
                return Err(BootloaderError::InvalidRequest(format!(
                    "address 0x{:08X} is not aligned on a {} byte page",
                    address, page_size
                )));
            }
            if bytes.len() != page_size as usize {
                return Err(BootloaderError::InvalidRequest(format!(
                    "page at 0x{:08X} has {} bytes, expected {}",
                    address,
                    bytes.len(),
                    page_size
                )));
            }
            if !session.erased.as_ref().is_some_and(|r| r.contains(&address)) {
                return Err(BootloaderError::InvalidRequest(format!(
                    "page at 0x{:08X} was not erased",
                    address
                )));
            }
            if let Some(previous) = session.last_written.filter(|&p| address <= p) {
                return Err(BootloaderError::InvalidRequest(format!(
                    "page at 0x{:08X} does not follow page at 0x{:08X}",
                    address, previous
                )));
            }

            let page_number = (address / page_size) as u16;
            session.state = SessionState::Writing;
            log::debug!("Writing page {} (0x{:08X})", page_number, address);

            session.exchange_ack(&Message::WritePage {
                dest: session.config.target_node,
                page_number,
                data: bytes.to_vec(),
            })?;

            session.last_written = Some(address);
            session.written.push((page_number, page_checksum(bytes)));
            Ok(())
        })
    }

    /// Compare the checksum of every written page with the device's.
    pub fn verify(&mut self) -> BootloaderResult<VerifyOutcome> {
        self.guard(|session| {
            session.require("verify", &[SessionState::Writing])?;
            let layout = session.connected_layout()?;
            session.state = SessionState::Verifying;

            if !layout.supports_checksum() {
                log::info!("Bootloader cannot report checksums, skipping verification");
                return Ok(VerifyOutcome::Skipped);
            }

            let written = session.written.clone();
            for (page_number, expected) in written {
                let reply = session.exchange(&Message::ReadChecksum {
                    dest: session.config.target_node,
                    page_number,
                })?;
                match reply {
                    Message::PageChecksum { page_number: p, crc } if p == page_number => {
                        if crc != expected {
                            return Err(BootloaderError::Device(format!(
                                "checksum mismatch on page {}: expected 0x{:04X}, device has 0x{:04X}",
                                page_number, expected, crc
                            )));
                        }
                    }
                    Message::PageChecksum { page_number: p, .. } => {
                        return Err(BootloaderError::Communication(format!(
                            "checksum reply for page {} while asking for page {}",
                            p, page_number
                        )));
                    }
                    other => return Err(unexpected_reply(&other, "ReadChecksum")),
                }
            }

            log::info!("Verified {} page(s)", session.written.len());
            Ok(VerifyOutcome::Verified)
        })
    }

    /// Leave the bootloader and start the new firmware.
    pub fn reset_to_application(&mut self) -> BootloaderResult<()> {
        self.guard(|session| {
            session.require(
                "reset_to_application",
                &[SessionState::Writing, SessionState::Verifying],
            )?;
            session.state = SessionState::Resetting;
            log::info!("Restarting {}", session.handle.label());

            session.exchange_ack(&Message::Reset {
                dest: session.config.target_node,
            })?;

            session.close_channel();
            session.state = SessionState::Completed;
            Ok(())
        })
    }

    /// Give up before anything destructive happened.
    ///
    /// Refused once erasing has started; the session then has to run to a
    /// terminal state.
    pub fn cancel(&mut self) -> BootloaderResult<()> {
        match self.state {
            SessionState::Disconnected | SessionState::Connecting | SessionState::Connected => {
                log::info!("Cancelling session for {}", self.handle.label());
                self.close_channel();
                self.state = SessionState::Cancelled;
                Ok(())
            }
            state if state.is_destructive() => Err(BootloaderError::CancelRefused { state }),
            state => Err(BootloaderError::InvalidState {
                operation: "cancel",
                state,
            }),
        }
    }

    /// Run a command; any failure makes the session unusable.
    fn guard<T>(
        &mut self,
        command: impl FnOnce(&mut Self) -> BootloaderResult<T>,
    ) -> BootloaderResult<T> {
        if self.state.is_terminal() {
            return command(self);
        }
        let result = command(self);
        if let Err(e) = &result {
            log::warn!("Session for {} failed: {}", self.handle.label(), e);
            self.abort();
        }
        result
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> BootloaderResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(BootloaderError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn connected_layout(&self) -> BootloaderResult<FlashLayout> {
        self.layout
            .ok_or_else(|| BootloaderError::InvalidRequest("no flash layout received".into()))
    }

    fn abort(&mut self) {
        self.close_channel();
        self.state = SessionState::Errored;
    }

    fn close_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close() {
                log::warn!("Closing {} failed: {}", self.handle.address(), e);
            }
        }
        if self.decoder.pending() > 0 {
            log::debug!("Dropping {} unread bytes", self.decoder.pending());
        }
        self.decoder.reset();
    }

    fn send(&mut self, message: &Message) -> BootloaderResult<()> {
        let channel = self.channel.as_mut().ok_or_else(|| link_error(TransportError::Closed))?;
        log::debug!("-> {:?}", message.kind());
        channel.send(&message.encode(HOST_NODE_ID)).map_err(link_error)
    }

    /// Wait for the next frame, or fail once `timeout` expires.
    fn receive_frame(&mut self, timeout: Duration) -> BootloaderResult<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let channel = self.channel.as_mut().ok_or_else(|| link_error(TransportError::Closed))?;
            let bytes = if remaining.is_zero() {
                Vec::new()
            } else {
                channel.receive(remaining).map_err(link_error)?
            };
            if bytes.is_empty() {
                return Err(BootloaderError::Communication(format!(
                    "no reply within {} ms",
                    timeout.as_millis()
                )));
            }
            self.decoder.extend(&bytes);
        }
    }

    fn receive(&mut self, timeout: Duration) -> BootloaderResult<Message> {
        let frame = self.receive_frame(timeout)?;
        let message = Message::decode(&frame)?;
        log::debug!("<- {:?} from node {}", message.kind(), frame.source);
        Ok(message)
    }

    fn exchange(&mut self, message: &Message) -> BootloaderResult<Message> {
        self.send(message)?;
        self.receive(self.config.ack_timeout)
    }

    fn exchange_ack(&mut self, message: &Message) -> BootloaderResult<()> {
        let command = format!("{:?}", message.kind());
        match self.exchange(message)? {
            Message::Ack { status, address } => match AckStatus::from_u16(status) {
                Some(AckStatus::Success) => Ok(()),
                Some(fault) => Err(BootloaderError::Device(format!(
                    "{} rejected: {} (status {}, address 0x{:04X})",
                    command,
                    fault.description(),
                    status,
                    address
                ))),
                None => Err(BootloaderError::Communication(format!(
                    "unknown status {} in reply to {}",
                    status, command
                ))),
            },
            other => Err(unexpected_reply(&other, &command)),
        }
    }
}

impl Drop for BootloaderSession {
    fn drop(&mut self) {
        self.close_channel();
    }
}

fn link_error(e: TransportError) -> BootloaderError {
    BootloaderError::Communication(e.to_string())
}

fn unexpected_reply(reply: &Message, command: &str) -> BootloaderError {
    BootloaderError::Communication(format!(
        "unexpected {:?} reply to {}",
        reply.kind(),
        command
    ))
}

fn open_failure_detail(handle: &DeviceHandle, e: TransportError) -> String {
    match e {
        TransportError::PortBusy { .. } => format!(
            "{} is busy, another program is probably connected to the robot",
            handle.label()
        ),
        TransportError::PortPermissionDenied { .. } => {
            format!("permission denied opening {}", handle.address())
        }
        TransportError::PortNotFound { .. } => {
            format!("{} disappeared, was the robot unplugged?", handle.label())
        }
        other => format!("cannot open {}: {}", handle.address(), other),
    }
}
