//! Payload codecs for envelopes.
//!
//! Codecs produce and consume frame payloads only; the length prefix is added
//! and removed by [`Frame`](crate::Frame).

use crate::error::ProtocolError;
use crate::message::{Event, Request, Response};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes and decodes envelopes carried inside frames.
pub trait PayloadCodec: Send + Sync {
    /// Short codec name used in logs.
    fn name(&self) -> &'static str;

    fn encode_request(&self, request: &Request) -> Result<Bytes, ProtocolError>;
    fn decode_request(&self, payload: &[u8]) -> Result<Request, ProtocolError>;

    fn encode_response(&self, response: &Response) -> Result<Bytes, ProtocolError>;
    fn decode_response(&self, payload: &[u8]) -> Result<Response, ProtocolError>;

    fn encode_event(&self, event: &Event) -> Result<Bytes, ProtocolError>;
    fn decode_event(&self, payload: &[u8]) -> Result<Event, ProtocolError>;
}

/// JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }

    fn encode<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode<T: DeserializeOwned>(
        payload: &[u8],
        expected: &'static str,
        msg_type: impl Fn(&T) -> &str,
    ) -> Result<T, ProtocolError> {
        let value: T = serde_json::from_slice(payload)?;
        let actual = msg_type(&value);
        if actual != expected {
            return Err(ProtocolError::UnexpectedType {
                expected,
                actual: actual.to_string(),
            });
        }
        Ok(value)
    }
}

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_request(&self, request: &Request) -> Result<Bytes, ProtocolError> {
        Self::encode(request)
    }

    fn decode_request(&self, payload: &[u8]) -> Result<Request, ProtocolError> {
        Self::decode(payload, "request", |r: &Request| r.msg_type.as_str())
    }

    fn encode_response(&self, response: &Response) -> Result<Bytes, ProtocolError> {
        Self::encode(response)
    }

    fn decode_response(&self, payload: &[u8]) -> Result<Response, ProtocolError> {
        Self::decode(payload, "response", |r: &Response| r.msg_type.as_str())
    }

    fn encode_event(&self, event: &Event) -> Result<Bytes, ProtocolError> {
        Self::encode(event)
    }

    fn decode_event(&self, payload: &[u8]) -> Result<Event, ProtocolError> {
        Self::decode(payload, "event", |e: &Event| e.msg_type.as_str())
    }
}
