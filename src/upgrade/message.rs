//! Bootloader message encoding.
//!
//! Every message travels in a frame made of three little-endian 16-bit
//! words followed by the payload:
//!
//! ```text
//! +---------+---------+---------+----------------+
//! | len u16 | src u16 | typ u16 | payload (len)  |
//! +---------+---------+---------+----------------+
//! ```
//!
//! `len` counts the payload only. All payload fields are 16-bit little-endian
//! words, except the raw page data of `WritePage`.

use super::config::{MessageType, FLAG_PAGE_CHECKSUM, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
use super::error::{BootloaderError, BootloaderResult};

/// Flash geometry announced by the bootloader when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashLayout {
    /// Size of one flash page in bytes.
    pub page_size: u16,
    /// First page the bootloader accepts to program.
    pub pages_start: u16,
    /// Number of programmable pages.
    pub pages_count: u16,
    /// Capability flags.
    pub flags: u16,
}

impl FlashLayout {
    /// Whether the bootloader can report page checksums for verification.
    pub fn supports_checksum(&self) -> bool {
        self.flags & FLAG_PAGE_CHECKSUM != 0
    }

    /// Programmable byte range.
    pub fn programmable_range(&self) -> std::ops::Range<u32> {
        let page_size = self.page_size as u32;
        let start = self.pages_start as u32 * page_size;
        start..start + self.pages_count as u32 * page_size
    }
}

/// A decoded frame, before interpretation of its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub source: u16,
    pub kind: u16,
    pub payload: Vec<u8>,
}

/// Bootloader messages, both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    EnterBootloader { dest: u16 },
    Erase { dest: u16, first_page: u16, page_count: u16 },
    WritePage { dest: u16, page_number: u16, data: Vec<u8> },
    ReadChecksum { dest: u16, page_number: u16 },
    Reset { dest: u16 },
    Description(FlashLayout),
    PageChecksum { page_number: u16, crc: u16 },
    Ack { status: u16, address: u16 },
}

impl Message {
    /// Wire type of this message.
    pub fn kind(&self) -> MessageType {
        match self {
            Message::EnterBootloader { .. } => MessageType::EnterBootloader,
            Message::Erase { .. } => MessageType::Erase,
            Message::WritePage { .. } => MessageType::WritePage,
            Message::ReadChecksum { .. } => MessageType::ReadChecksum,
            Message::Reset { .. } => MessageType::Reset,
            Message::Description(_) => MessageType::Description,
            Message::PageChecksum { .. } => MessageType::PageChecksum,
            Message::Ack { .. } => MessageType::Ack,
        }
    }

    fn payload(&self) -> Vec<u8> {
        let words: Vec<u16> = match self {
            Message::EnterBootloader { dest } | Message::Reset { dest } => vec![*dest],
            Message::Erase {
                dest,
                first_page,
                page_count,
            } => vec![*dest, *first_page, *page_count],
            Message::WritePage {
                dest,
                page_number,
                data,
            } => {
                let mut payload = Vec::with_capacity(4 + data.len());
                payload.extend_from_slice(&dest.to_le_bytes());
                payload.extend_from_slice(&page_number.to_le_bytes());
                payload.extend_from_slice(data);
                return payload;
            }
            Message::ReadChecksum { dest, page_number } => vec![*dest, *page_number],
            Message::Description(layout) => vec![
                layout.page_size,
                layout.pages_start,
                layout.pages_count,
                layout.flags,
            ],
            Message::PageChecksum { page_number, crc } => vec![*page_number, *crc],
            Message::Ack { status, address } => vec![*status, *address],
        };
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Build the complete frame for this message.
    pub fn encode(&self, source: u16) -> Vec<u8> {
        let payload = self.payload();
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&source.to_le_bytes());
        frame.extend_from_slice(&(self.kind() as u16).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    /// Interpret a frame. Unknown types and short payloads are communication errors.
    pub fn decode(frame: &Frame) -> BootloaderResult<Self> {
        let kind = MessageType::from_u16(frame.kind).ok_or_else(|| {
            BootloaderError::Communication(format!("unknown message type 0x{:04X}", frame.kind))
        })?;

        let payload = &frame.payload;
        let word = |index: usize| -> BootloaderResult<u16> {
            payload
                .get(index * 2..index * 2 + 2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .ok_or_else(|| {
                    BootloaderError::Communication(format!(
                        "{:?} message too short ({} bytes)",
                        kind,
                        payload.len()
                    ))
                })
        };

        Ok(match kind {
            MessageType::EnterBootloader => Message::EnterBootloader { dest: word(0)? },
            MessageType::Reset => Message::Reset { dest: word(0)? },
            MessageType::Erase => Message::Erase {
                dest: word(0)?,
                first_page: word(1)?,
                page_count: word(2)?,
            },
            MessageType::WritePage => Message::WritePage {
                dest: word(0)?,
                page_number: word(1)?,
                data: payload[4..].to_vec(),
            },
            MessageType::ReadChecksum => Message::ReadChecksum {
                dest: word(0)?,
                page_number: word(1)?,
            },
            MessageType::Description => Message::Description(FlashLayout {
                page_size: word(0)?,
                pages_start: word(1)?,
                pages_count: word(2)?,
                flags: word(3)?,
            }),
            MessageType::PageChecksum => Message::PageChecksum {
                page_number: word(0)?,
                crc: word(1)?,
            },
            MessageType::Ack => Message::Ack {
                status: word(0)?,
                address: word(1)?,
            },
        })
    }
}

/// Streaming decoder turning received bytes into frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(1024),
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Take the next complete frame out of the buffer, if there is one.
    pub fn next_frame(&mut self) -> BootloaderResult<Option<Frame>> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let len = u16::from_le_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if len > MAX_FRAME_PAYLOAD {
            self.reset();
            return Err(BootloaderError::Communication(format!(
                "frame payload of {} bytes exceeds maximum {}",
                len, MAX_FRAME_PAYLOAD
            )));
        }

        if self.buffer.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }

        let source = u16::from_le_bytes([self.buffer[2], self.buffer[3]]);
        let kind = u16::from_le_bytes([self.buffer[4], self.buffer[5]]);
        let payload = self.buffer[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].to_vec();
        self.buffer.drain(..FRAME_HEADER_SIZE + len);

        Ok(Some(Frame {
            source,
            kind,
            payload,
        }))
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
