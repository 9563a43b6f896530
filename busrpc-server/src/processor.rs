//! Application processor boundary.

use crate::properties::RequestProperties;
use async_trait::async_trait;
use busrpc_protocol::{ProtocolError, FRAME_HEADER_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Processor failure.
///
/// A `Protocol` failure abandons the request without a reply. A `Runtime`
/// failure still flushes whatever output was written, so the caller hears
/// back immediately.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl From<ProtocolError> for ProcessorError {
    fn from(e: ProtocolError) -> Self {
        ProcessorError::Protocol(e.to_string())
    }
}

/// Application logic run for each request frame.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Handles one request payload (length prefix already stripped), writing
    /// the response payload to `output`.
    ///
    /// Writing nothing means no reply is sent.
    async fn process(
        &self,
        input: Bytes,
        output: &mut OutputBuffer,
        props: &RequestProperties,
    ) -> Result<(), ProcessorError>;
}

/// Response sink that produces a length-prefixed frame.
///
/// The frame, header included, may not exceed `limit` bytes. A limit of 0
/// disables the check.
#[derive(Debug)]
pub struct OutputBuffer {
    buf: BytesMut,
    limit: usize,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u32(0);
        Self { buf, limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Payload bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len() - FRAME_HEADER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), ProcessorError> {
        let frame_len = self.buf.len() + data.len();
        if self.limit > 0 && frame_len > self.limit {
            return Err(ProcessorError::Runtime(format!(
                "response frame of {} bytes exceeds limit of {} bytes",
                frame_len, self.limit
            )));
        }
        if frame_len - FRAME_HEADER_SIZE > u32::MAX as usize {
            return Err(ProcessorError::Runtime(format!(
                "response of {} bytes cannot be framed",
                frame_len - FRAME_HEADER_SIZE
            )));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Finishes the frame, filling in the length prefix.
    pub fn into_frame(mut self) -> Bytes {
        let len = (self.buf.len() - FRAME_HEADER_SIZE) as u32;
        self.buf[..FRAME_HEADER_SIZE].copy_from_slice(&len.to_be_bytes());
        self.buf.freeze()
    }
}
