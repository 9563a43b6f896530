//! Length-prefixed frame format.
//!
//! Every request, response and event travels as a single frame:
//!
//! ```text
//! +-------------+---------------------------+
//! | payload_len | payload                   |
//! | 4 bytes BE  | payload_len bytes         |
//! +-------------+---------------------------+
//! ```
//!
//! The payload encoding is opaque at this layer. An empty payload is a valid
//! frame (`[0, 0, 0, 0]`) and is used to signal "no response body".

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the length prefix in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame payload with the length prefix removed.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame around the given payload.
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    /// Encodes a payload into a frame.
    pub fn encode(payload: &[u8]) -> Result<BytesMut, ProtocolError> {
        let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_u32(len);
        buf.put_slice(payload);
        Ok(buf)
    }

    /// Encodes this frame.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        Self::encode(&self.payload).map(BytesMut::freeze)
    }

    /// Decodes a frame, stripping the length prefix.
    ///
    /// The returned payload is everything after the prefix and may be empty.
    pub fn decode(frame: Bytes) -> Result<Self, ProtocolError> {
        if frame.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort(frame.len()));
        }
        Ok(Self {
            payload: frame.slice(FRAME_HEADER_SIZE..),
        })
    }

    /// Returns the payload length declared in a frame's prefix.
    pub fn declared_len(frame: &[u8]) -> Option<usize> {
        let prefix: [u8; FRAME_HEADER_SIZE] = frame.get(..FRAME_HEADER_SIZE)?.try_into().ok()?;
        Some(u32::from_be_bytes(prefix) as usize)
    }

    /// Returns true if the frame carries no payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
