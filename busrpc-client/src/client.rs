//! High-level client API.

use crate::error::ClientError;
use crate::transport::AsyncClientTransport;
use busrpc_protocol::{
    Context, ErrorCode, Frame, JsonCodec, PayloadCodec, Request, ResponseError,
};
use busrpc_transport::BrokerConnection;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout applied when the call context carries none.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// High-level client for busrpc services.
///
/// Calls through one client are serialized, matching the single outstanding
/// request its transport supports. Use one client per concurrent caller.
pub struct Client {
    transport: AsyncClientTransport,
    codec: Arc<dyn PayloadCodec>,
    config: ClientConfig,
    call_lock: Mutex<()>,
}

impl Client {
    /// Creates a client with the default configuration and JSON codec.
    pub fn new(conn: Arc<dyn BrokerConnection>) -> Self {
        Self::with_config(conn, ClientConfig::default())
    }

    pub fn with_config(conn: Arc<dyn BrokerConnection>, config: ClientConfig) -> Self {
        Self {
            transport: AsyncClientTransport::new(conn),
            codec: Arc::new(JsonCodec::new()),
            config,
            call_lock: Mutex::new(()),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub async fn open(&self) -> Result<(), ClientError> {
        self.transport.open().await
    }

    pub async fn close(&self) -> Result<(), ClientError> {
        self.transport.close().await
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the underlying transport.
    pub fn transport(&self) -> &AsyncClientTransport {
        &self.transport
    }

    fn encode(&self, ctx: &Context, op: &str, params: Value) -> Result<bytes::Bytes, ClientError> {
        let request = Request::from_context(ctx, op).with_params(params);
        let payload = self.codec.encode_request(&request)?;
        Ok(Frame::encode(&payload)?.freeze())
    }

    /// Invokes `op` on the service listening on `subject`.
    ///
    /// Waits up to the context timeout, or the configured default. Response
    /// headers are copied into `ctx`. Replies carrying another correlation id
    /// are skipped; if only those arrive, the call fails with
    /// [`ClientError::CorrelationMismatch`] at the deadline.
    pub async fn call(
        &self,
        ctx: &mut Context,
        subject: &str,
        op: &str,
        params: Value,
    ) -> Result<Value, ClientError> {
        let _guard = self.call_lock.lock().await;

        let frame = self.encode(ctx, op, params)?;
        let timeout = ctx.timeout().unwrap_or(self.config.request_timeout);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut pending = self.transport.request(ctx, subject, frame).await?;

        // Replies to earlier, timed-out calls can still arrive on the inbox.
        // Skip them until our own reply shows up or the deadline passes.
        let mut stale: Option<String> = None;
        let response = loop {
            let reply = match tokio::time::timeout_at(deadline, pending.next_reply()).await {
                Ok(reply) => reply?,
                Err(_) => {
                    tracing::debug!(
                        "Request cid={} op={} timed out after {:?}",
                        ctx.correlation_id(),
                        op,
                        timeout
                    );
                    return Err(match stale {
                        Some(actual) => ClientError::CorrelationMismatch {
                            expected: ctx.correlation_id().to_string(),
                            actual,
                        },
                        None => ClientError::Timeout,
                    });
                }
            };

            if reply.is_empty() {
                return Err(ClientError::EmptyReply);
            }

            let response = self.codec.decode_response(&reply)?;
            if response.id == ctx.correlation_id() {
                break response;
            }
            tracing::debug!(
                "Skipping reply cid={} while waiting for cid={}",
                response.id,
                ctx.correlation_id()
            );
            stale = Some(response.id);
        };
        ctx.set_response_headers(response.headers.clone());

        if response.is_error() {
            let err = response.error.unwrap_or_else(|| {
                ResponseError::new(ErrorCode::InternalError, "error response without details")
            });
            return Err(ClientError::ServerError {
                code: err.code,
                message: err.message,
                retryable: err.retryable,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Sends `op` without waiting for a reply.
    pub async fn notify(
        &self,
        ctx: &Context,
        subject: &str,
        op: &str,
        params: Value,
    ) -> Result<(), ClientError> {
        let frame = self.encode(ctx, op, params)?;
        self.transport.oneway(ctx, subject, frame).await
    }

    /// Pings the service on `subject`.
    pub async fn ping(&self, subject: &str) -> Result<(), ClientError> {
        let mut ctx = Context::new();
        self.call(&mut ctx, subject, "ping", json!({})).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busrpc_protocol::Response;
    use busrpc_transport::MemoryBroker;
    use bytes::Bytes;

    /// Answers every request on `subject` with the response built by `respond`.
    async fn spawn_responder<F>(broker: Arc<MemoryBroker>, subject: &str, respond: F)
    where
        F: Fn(Request) -> Option<Bytes> + Send + 'static,
    {
        let mut sub = broker.subscribe(subject, None).await.unwrap();
        tokio::spawn(async move {
            let codec = JsonCodec::new();
            while let Some(msg) = sub.next().await {
                let frame = Frame::decode(msg.payload).unwrap();
                let request = codec.decode_request(&frame.payload).unwrap();
                if let (Some(reply), Some(body)) = (msg.reply, respond(request)) {
                    broker.publish(&reply, body).await.unwrap();
                }
            }
        });
    }

    fn frame(response: &Response) -> Option<Bytes> {
        let payload = JsonCodec::new().encode_response(response).unwrap();
        Some(Frame::encode(&payload).unwrap().freeze())
    }

    async fn open_client(broker: &Arc<MemoryBroker>) -> Client {
        let client = Client::new(broker.clone());
        client.open().await.unwrap();
        client
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        let config = ClientConfig::new().with_request_timeout(Duration::from_secs(2));
        assert_eq!(config.request_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let broker = Arc::new(MemoryBroker::new());
        spawn_responder(broker.clone(), "svc", |req| {
            frame(&Response::ok(req.id, req.params).with_header("served-by", "test"))
        })
        .await;
        let client = open_client(&broker).await;

        let mut ctx = Context::new();
        let result = client
            .call(&mut ctx, "svc", "echo", json!({"msg": "hello"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"msg": "hello"}));
        assert_eq!(ctx.response_header("served-by"), Some("test"));
    }

    #[tokio::test]
    async fn test_call_maps_server_error() {
        let broker = Arc::new(MemoryBroker::new());
        spawn_responder(broker.clone(), "svc", |req| {
            let err = ResponseError::new(ErrorCode::UnknownMethod, format!("unknown method: {}", req.op));
            frame(&Response::error(req.id, err))
        })
        .await;
        let client = open_client(&broker).await;

        let result = client.call(&mut Context::new(), "svc", "nope", json!({})).await;
        match result {
            Err(ClientError::ServerError {
                code, retryable, ..
            }) => {
                assert_eq!(code, ErrorCode::UnknownMethod);
                assert!(!retryable);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_times_out_then_recovers() {
        let broker = Arc::new(MemoryBroker::new());
        let client = open_client(&broker).await;

        let mut ctx = Context::new().with_timeout(Duration::from_millis(30));
        let result = client.call(&mut ctx, "nobody", "ping", json!({})).await;
        assert!(matches!(result, Err(ClientError::Timeout)));

        // The abandoned request no longer occupies the transport.
        spawn_responder(broker.clone(), "svc", |req| frame(&Response::ok(req.id, json!("pong")))).await;
        let result = client.call(&mut Context::new(), "svc", "ping", json!({})).await;
        assert_eq!(result.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_call_rejects_mismatched_correlation_id() {
        let broker = Arc::new(MemoryBroker::new());
        spawn_responder(broker.clone(), "svc", |_req| frame(&Response::ok("someone-else", Value::Null)))
            .await;
        let client = open_client(&broker).await;

        let mut ctx = Context::new().with_timeout(Duration::from_millis(50));
        let result = client.call(&mut ctx, "svc", "ping", json!({})).await;
        match result {
            Err(ClientError::CorrelationMismatch { expected, actual }) => {
                assert_eq!(expected, ctx.correlation_id());
                assert_eq!(actual, "someone-else");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_late_reply_does_not_break_next_call() {
        let broker = Arc::new(MemoryBroker::new());
        let mut sub = broker.subscribe("slow", None).await.unwrap();
        {
            let broker = broker.clone();
            tokio::spawn(async move {
                let codec = JsonCodec::new();
                while let Some(msg) = sub.next().await {
                    let request = codec
                        .decode_request(&Frame::decode(msg.payload).unwrap().payload)
                        .unwrap();
                    let body = frame(&Response::ok(request.id, json!("done"))).unwrap();
                    let broker = broker.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(80)).await;
                        broker.publish(&msg.reply.unwrap(), body).await.unwrap();
                    });
                }
            });
        }
        let client = open_client(&broker).await;

        let mut first = Context::new().with_timeout(Duration::from_millis(40));
        let result = client.call(&mut first, "slow", "work", json!({})).await;
        assert!(matches!(result, Err(ClientError::Timeout)));

        // The first reply lands while this call is waiting and is skipped.
        let mut second = Context::new().with_timeout(Duration::from_millis(500));
        let result = client.call(&mut second, "slow", "work", json!({})).await;
        assert_eq!(result.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_empty_reply() {
        let broker = Arc::new(MemoryBroker::new());
        spawn_responder(broker.clone(), "svc", |_req| Some(Bytes::from_static(&[0, 0, 0, 0]))).await;
        let client = open_client(&broker).await;

        let result = client.call(&mut Context::new(), "svc", "ping", json!({})).await;
        assert!(matches!(result, Err(ClientError::EmptyReply)));
    }

    #[tokio::test]
    async fn test_call_requires_open() {
        let broker = Arc::new(MemoryBroker::new());
        let client = Client::new(broker);
        let result = client.call(&mut Context::new(), "svc", "ping", json!({})).await;
        assert!(matches!(result, Err(ClientError::NotOpen)));
    }

    #[tokio::test]
    async fn test_ping_and_notify() {
        let broker = Arc::new(MemoryBroker::new());
        spawn_responder(broker.clone(), "svc", |req| match req.op.as_str() {
            "ping" => frame(&Response::ok(req.id, json!({"pong": true}))),
            _ => None,
        })
        .await;
        let client = open_client(&broker).await;

        client.ping("svc").await.unwrap();
        client
            .notify(&Context::new(), "svc", "audit", json!({"event": "login"}))
            .await
            .unwrap();
        let notifications: Vec<_> = broker
            .published_to("svc")
            .into_iter()
            .filter(|m| m.reply.is_none())
            .collect();
        assert_eq!(notifications.len(), 1);
    }
}
