//! Method dispatch over request/response envelopes.
//!
//! [`MethodProcessor`] decodes each payload into a [`Request`], runs the
//! handler registered for its `op` and writes the encoded [`Response`].

use crate::processor::{OutputBuffer, Processor, ProcessorError};
use crate::properties::RequestProperties;
use async_trait::async_trait;
use busrpc_protocol::context::CID_HEADER;
use busrpc_protocol::{
    Context, ErrorCode, JsonCodec, PayloadCodec, Request, Response, ResponseError,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Failure returned by a method handler.
#[derive(Debug, Error)]
pub enum MethodError {
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Failed(String),
}

impl MethodError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MethodError::InvalidParams(_) => ErrorCode::BadRequest,
            MethodError::Failed(_) => ErrorCode::InternalError,
        }
    }
}

impl From<serde_json::Error> for MethodError {
    fn from(e: serde_json::Error) -> Self {
        MethodError::InvalidParams(e.to_string())
    }
}

/// Handler for one method.
pub trait MethodHandler: Send + Sync {
    fn call(&self, ctx: Context, params: Value) -> BoxFuture<'static, Result<Value, MethodError>>;
}

impl<F, Fut> MethodHandler for F
where
    F: Fn(Context, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
{
    fn call(&self, ctx: Context, params: Value) -> BoxFuture<'static, Result<Value, MethodError>> {
        Box::pin(self(ctx, params))
    }
}

/// Processor routing requests to method handlers by operation name.
pub struct MethodProcessor {
    codec: Arc<dyn PayloadCodec>,
    methods: HashMap<String, Arc<dyn MethodHandler>>,
}

impl Default for MethodProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodProcessor {
    pub fn new() -> Self {
        Self {
            codec: Arc::new(JsonCodec::new()),
            methods: HashMap::new(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_method<H>(mut self, op: impl Into<String>, handler: H) -> Self
    where
        H: MethodHandler + 'static,
    {
        self.register(op, handler);
        self
    }

    /// Registers `handler` for `op`, replacing any previous handler.
    pub fn register<H>(&mut self, op: impl Into<String>, handler: H)
    where
        H: MethodHandler + 'static,
    {
        let op = op.into();
        tracing::debug!("Registered method {}", op);
        self.methods.insert(op, Arc::new(handler));
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    async fn dispatch(&self, request: Request) -> Response {
        let Request {
            id,
            op,
            mut headers,
            params,
            ..
        } = request;
        headers
            .entry(CID_HEADER.to_string())
            .or_insert_with(|| id.clone());
        let ctx = Context::from_headers(headers);

        let Some(handler) = self.methods.get(&op) else {
            tracing::debug!("Unknown method {} (cid={})", op, id);
            return Response::error(
                id,
                ResponseError::new(ErrorCode::UnknownMethod, format!("unknown method: {}", op)),
            );
        };

        match handler.call(ctx, params).await {
            Ok(result) => Response::ok(id, result),
            Err(e) => {
                tracing::debug!("Method {} failed (cid={}): {}", op, id, e);
                Response::error(id, ResponseError::new(e.code(), e.to_string()))
            }
        }
    }
}

#[async_trait]
impl Processor for MethodProcessor {
    async fn process(
        &self,
        input: Bytes,
        output: &mut OutputBuffer,
        _props: &RequestProperties,
    ) -> Result<(), ProcessorError> {
        let request = self.codec.decode_request(&input)?;
        let response = self.dispatch(request).await;
        let payload = self.codec.encode_response(&response)?;
        output.write(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn processor() -> MethodProcessor {
        MethodProcessor::new()
            .with_method("echo", |_ctx: Context, params: Value| async move { Ok::<Value, MethodError>(params) })
            .with_method("whoami", |ctx: Context, _params: Value| async move {
                Ok::<Value, MethodError>(json!({
                    "cid": ctx.correlation_id(),
                    "tenant": ctx.request_header("tenant"),
                }))
            })
            .with_method("strict", |_ctx: Context, params: Value| async move {
                let n: u64 = serde_json::from_value(params["n"].clone())?;
                Ok::<Value, MethodError>(json!(n * 2))
            })
            .with_method("broken", |_ctx: Context, _params: Value| async move {
                Err::<Value, _>(MethodError::Failed("database unavailable".to_string()))
            })
    }

    async fn run(processor: &MethodProcessor, request: &Request) -> Response {
        let codec = JsonCodec::new();
        let input = codec.encode_request(request).unwrap();
        let mut output = OutputBuffer::new(0);
        processor
            .process(input, &mut output, &RequestProperties::new())
            .await
            .unwrap();
        let frame = output.into_frame();
        codec.decode_response(&frame[4..]).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_echo() {
        let response = run(
            &processor(),
            &Request::new("cid-1", "echo").with_params(json!({"msg": "hi"})),
        )
        .await;
        assert!(response.is_ok());
        assert_eq!(response.id, "cid-1");
        assert_eq!(response.result, Some(json!({"msg": "hi"})));
    }

    #[tokio::test]
    async fn test_handler_sees_request_context() {
        let mut ctx = Context::with_correlation_id("cid-2");
        ctx.add_request_header("tenant", "acme");
        let response = run(&processor(), &Request::from_context(&ctx, "whoami")).await;
        assert_eq!(
            response.result,
            Some(json!({"cid": "cid-2", "tenant": "acme"}))
        );
    }

    #[tokio::test]
    async fn test_error_responses() {
        let processor = processor();

        let response = run(&processor, &Request::new("a", "missing")).await;
        assert_eq!(response.error.unwrap().code, ErrorCode::UnknownMethod);

        let response = run(
            &processor,
            &Request::new("b", "strict").with_params(json!({"n": "two"})),
        )
        .await;
        assert_eq!(response.error.unwrap().code, ErrorCode::BadRequest);

        let response = run(&processor, &Request::new("c", "broken")).await;
        let err = response.error.unwrap();
        assert_eq!(err.code, ErrorCode::InternalError);
        assert_eq!(err.message, "database unavailable");
    }

    #[tokio::test]
    async fn test_undecodable_input_is_protocol_failure() {
        let mut output = OutputBuffer::new(0);
        let result = processor()
            .process(
                Bytes::from_static(b"not json"),
                &mut output,
                &RequestProperties::new(),
            )
            .await;
        assert!(matches!(result, Err(ProcessorError::Protocol(_))));
        assert!(output.is_empty());
    }

    #[test]
    fn test_registered_methods() {
        let mut names: Vec<_> = processor().methods().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["broken", "echo", "strict", "whoami"]);
    }
}
