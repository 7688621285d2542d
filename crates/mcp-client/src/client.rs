//! Per-server tool client: discovery, invocation, health.
//!
//! One client owns one connection to one tool server. Tool names are
//! namespaced with the server id (`"<server>.<local>"`) at discovery and
//! the prefix is stripped again before invocation so the server always
//! sees its local identifier.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use dh_domain::retry::{retry_with_backoff, RetryPolicy};

use crate::protocol::{self, schema_is_valid, JsonRpcError, ToolCallResult, ToolsListResult};
use crate::transport::{HttpTransport, McpTransport, TransportError, WsTransport};

/// A tool as known to the registry, immutable per discovery cycle.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Server-namespaced name, e.g. `web.search`.
    pub qualified_name: String,
    /// Sanitized name surfaced to the LLM; assigned by the registry when
    /// the catalog is rebuilt.
    pub exposed_name: String,
    pub description: String,
    /// Opaque JSON Schema, forwarded unchanged to the LLM.
    pub input_schema: Value,
    pub server_id: String,
}

/// Errors specific to tool-server operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The server returned a JSON-RPC `error` object. Surfaced verbatim.
    #[error("{0}")]
    Rpc(JsonRpcError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool server not connected: {0}")]
    ServerNotFound(String),

    #[error("tool server is unhealthy: {0}")]
    ServerUnhealthy(String),
}

impl From<McpError> for dh_domain::Error {
    fn from(e: McpError) -> Self {
        match e {
            McpError::ToolNotFound(name) => dh_domain::Error::ToolNotFound(name),
            McpError::ServerNotFound(id) | McpError::ServerUnhealthy(id) => {
                dh_domain::Error::ServerUnavailable(id)
            }
            other => dh_domain::Error::Other(other.to_string()),
        }
    }
}

/// A connection to one remote tool server.
pub struct ToolServerClient {
    server_id: String,
    url: String,
    transport: Box<dyn McpTransport>,
    healthy: AtomicBool,
    policy: RetryPolicy,
}

impl ToolServerClient {
    /// Connect to a server, choosing the transport by URL scheme
    /// (`ws`/`wss` preferred, `http`/`https` fallback), and run the
    /// handshake where the transport requires one.
    pub async fn connect(server_id: &str, url: &str) -> Result<Self, McpError> {
        let transport: Box<dyn McpTransport> = if url.starts_with("ws://") || url.starts_with("wss://")
        {
            Box::new(WsTransport::connect(url).await?)
        } else {
            Box::new(HttpTransport::new(url)?)
        };

        let client = Self::with_transport(server_id, url, transport);
        client.handshake().await?;
        Ok(client)
    }

    /// Build a client over an existing transport. Used directly by tests
    /// and by callers that manage their own connections.
    pub fn with_transport(
        server_id: &str,
        url: &str,
        transport: Box<dyn McpTransport>,
    ) -> Self {
        Self {
            server_id: server_id.to_string(),
            url: url.to_string(),
            transport,
            healthy: AtomicBool::new(true),
            policy: RetryPolicy::default(),
        }
    }

    /// Override the backoff policy (tests use a fast one).
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && self.transport.is_alive()
    }

    async fn handshake(&self) -> Result<(), McpError> {
        if !self.transport.needs_handshake() {
            return Ok(());
        }

        let params = serde_json::to_value(protocol::initialize_params())
            .map_err(|e| McpError::Protocol(format!("failed to serialize initialize params: {e}")))?;

        let response = self.transport.request("initialize", Some(params)).await?;
        if let Err(err) = response.into_result() {
            return Err(McpError::Protocol(format!("initialize failed: {err}")));
        }

        self.transport.notify("notifications/initialized").await?;
        tracing::debug!(server_id = %self.server_id, "tool server handshake complete");
        Ok(())
    }

    /// Discover this server's tools via `tools/list`.
    ///
    /// Names come back prefixed with the server id. Tools whose input
    /// schema is not an object schema with `properties` are rejected at
    /// discovery. Retries transport failures with exponential backoff;
    /// a terminal failure marks the server unhealthy.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let result = retry_with_backoff(
            self.policy,
            "tools/list",
            || self.transport.request("tools/list", None),
            TransportError::is_retryable,
        )
        .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.healthy.store(false, Ordering::SeqCst);
                tracing::error!(server_id = %self.server_id, error = %e, "tool discovery failed");
                return Err(e.into());
            }
        };

        let value = match response.into_result() {
            Ok(value) => value,
            Err(err) => {
                self.healthy.store(false, Ordering::SeqCst);
                return Err(McpError::Rpc(err));
            }
        };

        let listed: ToolsListResult = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("failed to parse tools/list result: {e}")))?;

        let mut tools = Vec::with_capacity(listed.tools.len());
        for tool in listed.tools {
            if !schema_is_valid(&tool.input_schema) {
                tracing::warn!(
                    server_id = %self.server_id,
                    tool = %tool.name,
                    "rejecting tool with malformed input schema"
                );
                continue;
            }
            tools.push(ToolDescriptor {
                qualified_name: format!("{}.{}", self.server_id, tool.name),
                exposed_name: String::new(),
                description: tool.description,
                input_schema: tool.input_schema,
                server_id: self.server_id.clone(),
            });
        }

        self.healthy.store(true, Ordering::SeqCst);
        tracing::info!(
            server_id = %self.server_id,
            tool_count = tools.len(),
            "discovered tools"
        );
        Ok(tools)
    }

    /// Invoke a tool. Accepts qualified or local names; the outbound
    /// request always carries the local name. Transport failures retry
    /// with backoff; JSON-RPC errors from the server surface verbatim.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let local_name = name
            .strip_prefix(&format!("{}.", self.server_id))
            .unwrap_or(name);

        let params = serde_json::json!({
            "name": local_name,
            "arguments": arguments,
        });

        let result = retry_with_backoff(
            self.policy,
            "tools/call",
            || self.transport.request("tools/call", Some(params.clone())),
            TransportError::is_retryable,
        )
        .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.healthy.store(false, Ordering::SeqCst);
                tracing::error!(
                    server_id = %self.server_id,
                    tool = local_name,
                    error = %e,
                    "tool call failed"
                );
                return Err(e.into());
            }
        };

        let value = response.into_result().map_err(McpError::Rpc)?;
        let parsed: ToolCallResult = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("failed to parse tools/call result: {e}")))?;

        self.healthy.store(true, Ordering::SeqCst);
        Ok(parsed.into_value())
    }

    /// Out-of-band health probe. A successful ping also recovers a
    /// server previously marked unhealthy.
    pub async fn health_check(&self) -> bool {
        match self.transport.request("ping", None).await {
            Ok(response) if !response.is_error() => {
                self.healthy.store(true, Ordering::SeqCst);
                true
            }
            _ => {
                self.healthy.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Release the transport; pending waiters receive a cancellation.
    pub async fn close(&self) {
        tracing::debug!(server_id = %self.server_id, "closing tool server client");
        self.transport.close().await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport for exercising the client and registry
    //! without a network.

    use super::*;
    use crate::protocol::JsonRpcResponse;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    /// Scripted transport: canned tool list and per-tool results.
    pub struct MockTransport {
        pub tools: Mutex<Vec<Value>>,
        pub results: Mutex<std::collections::HashMap<String, Value>>,
        pub fail_listing: AtomicBool,
        pub calls: Mutex<Vec<(String, Value)>>,
        alive: AtomicBool,
    }

    impl MockTransport {
        pub fn new(tools: Vec<Value>) -> Self {
            Self {
                tools: Mutex::new(tools),
                results: Mutex::new(std::collections::HashMap::new()),
                fail_listing: AtomicBool::new(false),
                calls: Mutex::new(Vec::new()),
                alive: AtomicBool::new(true),
            }
        }

        pub fn tool(name: &str) -> Value {
            serde_json::json!({
                "name": name,
                "description": format!("{name} tool"),
                "inputSchema": { "type": "object", "properties": {} }
            })
        }

        pub fn with_result(self, tool: &str, result: Value) -> Self {
            self.results.lock().insert(tool.to_string(), result);
            self
        }
    }

    #[async_trait]
    impl McpTransport for MockTransport {
        async fn request(
            &self,
            method: &str,
            params: Option<Value>,
        ) -> Result<JsonRpcResponse, TransportError> {
            let result = match method {
                "tools/list" => {
                    if self.fail_listing.load(Ordering::SeqCst) {
                        return Err(TransportError::Connect("server unreachable".into()));
                    }
                    serde_json::json!({ "tools": *self.tools.lock() })
                }
                "tools/call" => {
                    let params = params.unwrap_or_default();
                    let name = params["name"].as_str().unwrap_or_default().to_string();
                    let arguments = params["arguments"].clone();
                    self.calls.lock().push((name.clone(), arguments));
                    let results = self.results.lock();
                    match results.get(&name) {
                        Some(result) => {
                            serde_json::json!({ "content": [{ "type": "json", "json": result }] })
                        }
                        None => {
                            return Ok(JsonRpcResponse {
                                jsonrpc: "2.0".into(),
                                id: Some(1),
                                result: None,
                                error: Some(JsonRpcError {
                                    code: crate::protocol::error_codes::METHOD_NOT_FOUND,
                                    message: format!("Unknown tool: {name}"),
                                    data: None,
                                }),
                            })
                        }
                    }
                }
                "ping" => serde_json::json!({ "ok": true }),
                other => return Err(TransportError::Unsupported(other.to_string())),
            };

            Ok(JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id: Some(1),
                result: Some(result),
                error: None,
            })
        }

        async fn notify(&self, _method: &str) -> Result<(), TransportError> {
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
}
