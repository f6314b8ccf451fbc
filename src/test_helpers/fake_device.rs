//! A scripted Thymio II bootloader behind the `Channel` trait.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::upgrade::{
    page_checksum, AckStatus, Channel, FlashLayout, FrameDecoder, Message, MessageType,
    TransportError, TransportResult, DEFAULT_TARGET_NODE,
};

/// Bytes handed out per `receive` call, so replies arrive in pieces.
const CHUNK_SIZE: usize = 7;

/// Frame with a type the bootloader does not define, as sent by the
/// application firmware while it reboots.
const CHATTER_FRAME: [u8; 8] = [0x02, 0x00, 0x01, 0x00, 0x00, 0x90, 0x00, 0x00];

#[derive(Debug, Default)]
struct Recorder {
    messages: Vec<Message>,
    closed: bool,
}

/// Read side of a fake device, usable after the device moved into a session.
#[derive(Clone)]
pub struct FakeProbe {
    recorder: Arc<Mutex<Recorder>>,
}

impl FakeProbe {
    /// Every message the host sent, in order.
    pub fn messages(&self) -> Vec<Message> {
        self.recorder.lock().expect("recorder poisoned").messages.clone()
    }

    /// Types of every message the host sent, in order.
    pub fn commands(&self) -> Vec<MessageType> {
        self.messages().iter().map(Message::kind).collect()
    }

    /// Whether the host closed the channel.
    pub fn closed(&self) -> bool {
        self.recorder.lock().expect("recorder poisoned").closed
    }
}

/// Fake bootloader answering the host like a real robot would.
pub struct FakeThymio {
    layout: FlashLayout,
    recorder: Arc<Mutex<Recorder>>,
    decoder: FrameDecoder,
    outbox: VecDeque<u8>,
    exchanges: usize,
    timeout_on: Option<usize>,
    rejections: HashMap<MessageType, u16>,
    corrupt_checksums: bool,
    chatter: bool,
    flash: HashMap<u16, Vec<u8>>,
    closed: bool,
}

impl FakeThymio {
    pub fn new(layout: FlashLayout) -> Self {
        Self {
            layout,
            recorder: Arc::new(Mutex::new(Recorder::default())),
            decoder: FrameDecoder::new(),
            outbox: VecDeque::new(),
            exchanges: 0,
            timeout_on: None,
            rejections: HashMap::new(),
            corrupt_checksums: false,
            chatter: false,
            flash: HashMap::new(),
            closed: false,
        }
    }

    pub fn probe(&self) -> FakeProbe {
        FakeProbe {
            recorder: Arc::clone(&self.recorder),
        }
    }

    /// Stay silent on the n-th command (1-based).
    pub fn timeout_on_exchange(mut self, exchange: usize) -> Self {
        self.timeout_on = Some(exchange);
        self
    }

    /// Answer a command type with a fault status.
    pub fn reject(self, kind: MessageType, status: AckStatus) -> Self {
        self.reject_with_code(kind, status as u16)
    }

    /// Answer a command type with a raw status code.
    pub fn reject_with_code(mut self, kind: MessageType, status: u16) -> Self {
        self.rejections.insert(kind, status);
        self
    }

    /// Report wrong page checksums.
    pub fn corrupt_checksums(mut self) -> Self {
        self.corrupt_checksums = true;
        self
    }

    /// Send an application frame before the flash description.
    pub fn with_chatter(mut self) -> Self {
        self.chatter = true;
        self
    }

    fn ack(&self, kind: MessageType, address: u16) -> Message {
        Message::Ack {
            status: self.rejections.get(&kind).copied().unwrap_or(0),
            address,
        }
    }

    fn answer(&mut self, message: &Message) -> Option<Message> {
        match message {
            Message::EnterBootloader { .. } => {
                if self.chatter {
                    self.outbox.extend(CHATTER_FRAME);
                }
                Some(Message::Description(self.layout))
            }
            Message::Erase { first_page, .. } => Some(self.ack(MessageType::Erase, *first_page)),
            Message::WritePage {
                page_number, data, ..
            } => {
                self.flash.insert(*page_number, data.clone());
                Some(self.ack(MessageType::WritePage, *page_number))
            }
            Message::ReadChecksum { page_number, .. } => {
                let erased = vec![0xFF; self.layout.page_size as usize];
                let page = self.flash.get(page_number).unwrap_or(&erased);
                let mut crc = page_checksum(page);
                if self.corrupt_checksums {
                    crc ^= 0x5555;
                }
                Some(Message::PageChecksum {
                    page_number: *page_number,
                    crc,
                })
            }
            Message::Reset { .. } => Some(self.ack(MessageType::Reset, 0)),
            _ => None,
        }
    }
}

impl Channel for FakeThymio {
    fn send(&mut self, bytes: &[u8]) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        self.decoder.extend(bytes);
        while let Some(frame) = self.decoder.next_frame().expect("host sent a bad frame") {
            let message = Message::decode(&frame).expect("host sent an unknown message");
            self.recorder
                .lock()
                .expect("recorder poisoned")
                .messages
                .push(message.clone());

            self.exchanges += 1;
            if self.timeout_on == Some(self.exchanges) {
                continue;
            }
            if let Some(reply) = self.answer(&message) {
                self.outbox.extend(reply.encode(DEFAULT_TARGET_NODE));
            }
        }
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> TransportResult<Vec<u8>> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let count = self.outbox.len().min(CHUNK_SIZE);
        Ok(self.outbox.drain(..count).collect())
    }

    fn close(&mut self) -> TransportResult<()> {
        self.closed = true;
        self.recorder.lock().expect("recorder poisoned").closed = true;
        Ok(())
    }
}
