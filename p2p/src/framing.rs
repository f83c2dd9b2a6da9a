//! Length-prefixed streaming frame codec.
//!
//! Wire layout: a 4-byte big-endian `u32` body length followed by the
//! UTF-8 JSON message body. The decoder is a byte-stream state machine:
//! feed it arbitrary chunks, pull complete validated messages out. Frames
//! over [`MAX_FRAME_BYTES`](crate::protocol::MAX_FRAME_BYTES) are rejected
//! before the body is buffered.

use crate::{
    error::P2pError,
    protocol::{Message, MAX_FRAME_BYTES},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length-prefix header size.
pub const FRAME_HEADER_BYTES: usize = 4;

/// Encode a message into a ready-to-write frame.
pub fn encode_frame(message: &Message) -> Result<Bytes, P2pError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(P2pError::MessageTooLarge {
            size: body.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_BYTES + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Streaming decoder accumulating bytes until complete frames emerge.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_BYTES)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame,
        }
    }

    /// Append raw bytes from the socket.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next complete frame, if one is available.
    ///
    /// `Ok(None)` means more bytes are needed. Errors are terminal for the
    /// connection: an oversized length prefix or an unparseable body
    /// leaves no way to resynchronise the stream.
    pub fn next_frame(&mut self) -> Result<Option<Message>, P2pError> {
        if self.buffer.len() < FRAME_HEADER_BYTES {
            return Ok(None);
        }
        let length = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if length > self.max_frame {
            return Err(P2pError::MessageTooLarge {
                size: length,
                max: self.max_frame,
            });
        }
        if self.buffer.len() < FRAME_HEADER_BYTES + length {
            return Ok(None);
        }
        self.buffer.advance(FRAME_HEADER_BYTES);
        let body = self.buffer.split_to(length);
        let message: Message = serde_json::from_slice(&body)?;
        message.validate()?;
        Ok(Some(message))
    }
}
