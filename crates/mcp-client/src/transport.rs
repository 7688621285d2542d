//! Tool-server transports.
//!
//! Each server speaks JSON-RPC 2.0 over one of two transports:
//! - **WebSocket** (preferred): a single long-lived connection that
//!   multiplexes concurrent requests by id. A dispatcher task owns the
//!   read half and routes each response to the waiter that sent the
//!   matching request, so out-of-order responses are fine.
//! - **HTTP** (fallback): request/response POSTs against the server's
//!   REST endpoints (`/tools/list`, `/tools/call`, `/health`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Per-request timeout on both transports.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect: {0}")]
    Connect(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("timeout waiting for response")]
    Timeout,

    #[error("connection closed with requests in flight")]
    Closed,

    #[error("request cancelled")]
    Cancelled,

    #[error("method not supported on this transport: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Whether the retry/backoff policy applies. Business failures
    /// (4xx, unsupported methods, cancellation) are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connect(_)
            | TransportError::Io(_)
            | TransportError::Timeout
            | TransportError::Closed => true,
            TransportError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Trait for tool-server transports.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and wait for the corresponding response.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError>;

    /// Send a JSON-RPC notification (no response expected).
    async fn notify(&self, method: &str) -> Result<(), TransportError>;

    /// Whether the client must run the `initialize` handshake after
    /// connecting. True for WebSocket; the HTTP fallback is stateless.
    fn needs_handshake(&self) -> bool {
        true
    }

    /// Check if the transport is still usable.
    fn is_alive(&self) -> bool;

    /// Shut down the transport; pending waiters receive a cancellation.
    async fn close(&self);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WebSocket transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;
type PendingMap = HashMap<u64, oneshot::Sender<Result<JsonRpcResponse, TransportError>>>;

/// Table of in-flight requests, shared between callers and the
/// dispatcher. Responses may arrive in any order; each is delivered to
/// the waiter registered under its id.
#[derive(Default)]
struct Pending {
    map: parking_lot::Mutex<PendingMap>,
}

impl Pending {
    fn register(&self, id: u64) -> oneshot::Receiver<Result<JsonRpcResponse, TransportError>> {
        let (tx, rx) = oneshot::channel();
        self.map.lock().insert(id, tx);
        rx
    }

    fn resolve(&self, id: u64, response: JsonRpcResponse) -> bool {
        match self.map.lock().remove(&id) {
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    fn forget(&self, id: u64) {
        self.map.lock().remove(&id);
    }

    /// Fail every in-flight request with the error produced by `make_err`.
    fn drain_with(&self, make_err: impl Fn() -> TransportError) {
        let waiters: Vec<_> = self.map.lock().drain().collect();
        for (_, tx) in waiters {
            let _ = tx.send(Err(make_err()));
        }
    }
}

/// WebSocket transport: one persistent connection per server.
pub struct WsTransport {
    sink: Mutex<WsSink>,
    pending: Arc<Pending>,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
}

impl WsTransport {
    /// Connect and spawn the dispatcher task that routes responses.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, mut read) = stream.split();

        let pending = Arc::new(Pending::default());
        let alive = Arc::new(AtomicBool::new(true));

        let dispatcher = {
            let pending = Arc::clone(&pending);
            let alive = Arc::clone(&alive);
            let url = url.to_string();
            tokio::spawn(async move {
                while let Some(frame) = read.next().await {
                    match frame {
                        Ok(Message::Text(text)) => dispatch_frame(&pending, &text),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(url = %url, error = %e, "tool server read error");
                            break;
                        }
                    }
                }
                // Unexpected disconnect: every outstanding waiter fails.
                alive.store(false, Ordering::SeqCst);
                pending.drain_with(|| TransportError::Closed);
                tracing::debug!(url = %url, "tool server connection closed");
            })
        };

        Ok(Self {
            sink: Mutex::new(sink),
            pending,
            dispatcher: Mutex::new(Some(dispatcher)),
            next_id: AtomicU64::new(1),
            alive,
        })
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))
    }
}

/// Route one incoming frame to its waiter. Frames without a known id
/// (notifications, parse-error responses) are logged and dropped.
fn dispatch_frame(pending: &Pending, text: &str) {
    match serde_json::from_str::<JsonRpcResponse>(text) {
        Ok(response) => {
            let Some(id) = response.id else {
                tracing::debug!("dropping response without id");
                return;
            };
            if !pending.resolve(id, response) {
                tracing::debug!(id, "no waiter for response id (late or duplicate)");
            }
        }
        Err(_) => {
            tracing::debug!(frame = %truncate(text, 200), "skipping non-response frame");
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[async_trait]
impl McpTransport for WsTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&request)?;

        // Register before sending so a fast response cannot race the waiter.
        let rx = self.pending.register(id);

        tracing::debug!(id, method, "sending tool-server request");
        if let Err(e) = self.send_text(json).await {
            self.pending.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.forget(id);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        self.send_text(serde_json::to_string(&notif)?).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.pending.drain_with(|| TransportError::Cancelled);

        {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
        }

        if let Some(mut handle) = self.dispatcher.lock().await.take() {
            // The dispatcher ends when the server acknowledges the close;
            // don't wait forever on a wedged peer.
            if tokio::time::timeout(Duration::from_secs(2), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP fallback transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stateless HTTP transport: each JSON-RPC method maps onto a REST
/// endpoint; the response body is the method's result payload.
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    async fn read_body(response: reqwest::Response) -> Result<Value, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))
    }

    fn wrap(&self, result: Value) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(self.next_id.fetch_add(1, Ordering::Relaxed)),
            result: Some(result),
            error: None,
        }
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let result = match method {
            "tools/list" => {
                let response = self
                    .client
                    .post(format!("{}/tools/list", self.base_url))
                    .json(&params.unwrap_or_else(|| serde_json::json!({})))
                    .send()
                    .await
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                Self::read_body(response).await?
            }
            "tools/call" => {
                let response = self
                    .client
                    .post(format!("{}/tools/call", self.base_url))
                    .json(&params.unwrap_or_else(|| serde_json::json!({})))
                    .send()
                    .await
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                Self::read_body(response).await?
            }
            "ping" => {
                let response = self
                    .client
                    .get(format!("{}/health", self.base_url))
                    .send()
                    .await
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                Self::read_body(response).await?;
                serde_json::json!({ "ok": true })
            }
            other => return Err(TransportError::Unsupported(other.to_string())),
        };

        Ok(self.wrap(result))
    }

    async fn notify(&self, _method: &str) -> Result<(), TransportError> {
        // Request/response only; there is nothing to notify.
        Ok(())
    }

    fn needs_handshake(&self) -> bool {
        false
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
