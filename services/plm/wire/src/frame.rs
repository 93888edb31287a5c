//! Message framing for the modem serial protocol.
//!
//! The serial line carries no length prefix, so the decoder buffers partial
//! input, looks up the frame length from the command code and resynchronises
//! on the next start byte whenever it meets bytes it cannot place.

use crate::header::{CommandCode, ACK, HEADER_SIZE, MAX_FRAME_SIZE, NAK, START_BYTE};
use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

/// A decoded modem message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Command code from the header
    pub kind: CommandCode,
    /// Bytes following the header
    pub payload: Bytes,
    /// Complete frame as received, header included
    pub raw: Bytes,
}

impl Message {
    /// Build a message view over a complete raw frame
    pub fn from_raw(raw: Bytes) -> Result<Self, crate::WireError> {
        if raw.len() < HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }
        if raw[0] != START_BYTE {
            return Err(crate::WireError::StartByte(raw[0]));
        }
        let kind = CommandCode::try_from(raw[1])?;
        let flags = raw.get(5).copied();
        match kind.frame_len(flags) {
            Some(len) if len == raw.len() => {}
            Some(_) => return Err(crate::WireError::Malformed),
            None => return Err(crate::WireError::Incomplete),
        }
        Ok(Self {
            kind,
            payload: raw.slice(HEADER_SIZE..),
            raw,
        })
    }

    /// Human readable message type
    pub fn type_name(&self) -> &'static str {
        self.kind.name()
    }

    /// For replies to host commands, whether the modem accepted the command
    pub fn acknowledged(&self) -> Option<bool> {
        if !self.kind.is_command_reply() {
            return None;
        }
        match self.raw.last() {
            Some(&ACK) => Some(true),
            Some(&NAK) => Some(false),
            _ => None,
        }
    }
}

/// Streaming decoder turning raw serial chunks into messages
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buffer: BytesMut,
}

impl MessageDecoder {
    /// Create a new decoder with an empty buffer
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_SIZE * 4),
        }
    }

    /// Feed a chunk and return every message it completes
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Message> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        loop {
            match Self::decode_frame(&mut self.buffer) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => break,
                Err(e) => {
                    // Drop the start byte we could not place and rescan
                    trace!("Resynchronising decoder: {}", e);
                    self.buffer.advance(1);
                }
            }
        }
        messages
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decode one frame from the front of `buf`
    fn decode_frame(buf: &mut BytesMut) -> Result<Option<Message>, crate::WireError> {
        // Skip noise (stray NAKs, line garbage) in front of the next start byte
        match buf.iter().position(|&b| b == START_BYTE) {
            Some(0) => {}
            Some(skip) => {
                trace!("Skipping {} bytes before start byte", skip);
                buf.advance(skip);
            }
            None => {
                if !buf.is_empty() {
                    trace!("Skipping {} bytes without start byte", buf.len());
                    buf.clear();
                }
                return Ok(None);
            }
        }

        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let kind = CommandCode::try_from(buf[1])?;
        let frame_len = match kind.frame_len(buf.get(5).copied()) {
            Some(len) => len,
            None => return Ok(None),
        };

        if buf.len() < frame_len {
            return Ok(None);
        }

        let raw = buf.split_to(frame_len).freeze();
        Ok(Some(Message {
            kind,
            payload: raw.slice(HEADER_SIZE..),
            raw,
        }))
    }
}
