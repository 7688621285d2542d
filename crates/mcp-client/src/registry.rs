//! Tool registry: aggregates every configured tool server into one
//! consistent catalog.
//!
//! The catalog is a sorted map keyed by qualified name and is replaced
//! atomically on every refresh — readers observe either the old set or
//! the new set, never a partial one. Exposed (LLM-safe) names are
//! derived deterministically from the sorted catalog so the mapping is
//! stable across refreshes for a fixed input set.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use dh_domain::config::McpServerConfig;
use dh_domain::ToolDefinition;

use crate::client::{McpError, ToolDescriptor, ToolServerClient};

/// Per-server status owned by the registry; mutated only by refresh.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    pub server_id: String,
    pub url: String,
    pub healthy: bool,
    pub last_seen: DateTime<Utc>,
    pub tool_count: usize,
}

/// Callback invoked after each refresh with the new catalog and server
/// set; the persistence collaborator uses it to mirror registry state.
pub type RefreshedCallback =
    Arc<dyn Fn(&BTreeMap<String, ToolDescriptor>, &[ServerHandle]) + Send + Sync>;

/// Routing surface the agent loop depends on.
#[async_trait]
pub trait ToolRouter: Send + Sync {
    /// Tool definitions for the LLM, restricted to healthy servers.
    fn llm_tools(&self) -> Vec<ToolDefinition>;

    /// Resolve a tool by exposed or qualified name and execute it.
    async fn call_tool(&self, name: &str, arguments: Value) -> dh_domain::Result<Value>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct RegistryState {
    clients: HashMap<String, Arc<ToolServerClient>>,
    /// Qualified name -> descriptor. Sorted so exposed-name assignment
    /// is deterministic.
    tools: BTreeMap<String, ToolDescriptor>,
    exposed_to_qualified: HashMap<String, String>,
    handles: HashMap<String, ServerHandle>,
}

struct RefreshTask {
    handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
    interval_secs: i64,
}

/// Aggregates N tool-server clients into a single tool catalog.
pub struct McpRegistry {
    server_configs: Vec<McpServerConfig>,
    state: parking_lot::Mutex<RegistryState>,
    /// Serializes refreshes; `state` is never held across I/O.
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_task: tokio::sync::Mutex<Option<RefreshTask>>,
    on_refreshed: parking_lot::Mutex<Option<RefreshedCallback>>,
}

impl McpRegistry {
    pub fn new(server_configs: Vec<McpServerConfig>) -> Self {
        Self {
            server_configs,
            state: parking_lot::Mutex::new(RegistryState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            refresh_task: tokio::sync::Mutex::new(None),
            on_refreshed: parking_lot::Mutex::new(None),
        }
    }

    /// Install a callback invoked after every refresh.
    pub fn set_refreshed_callback(&self, callback: RefreshedCallback) {
        *self.on_refreshed.lock() = Some(callback);
    }

    /// Connect to every configured server and run an initial discovery.
    ///
    /// Servers that fail to connect are logged and skipped; they are
    /// retried on the next `connect_all` (not on refresh, which only
    /// rediscovers over existing connections).
    pub async fn connect_all(&self) {
        tracing::info!(count = self.server_configs.len(), "connecting to tool servers");

        for config in &self.server_configs {
            match ToolServerClient::connect(&config.server_id, &config.url).await {
                Ok(client) => {
                    self.add_client(Arc::new(client));
                }
                Err(e) => {
                    tracing::warn!(
                        server_id = %config.server_id,
                        url = %config.url,
                        error = %e,
                        "failed to connect to tool server, skipping"
                    );
                }
            }
        }

        self.refresh_tools().await;
    }

    /// Register a connected client. Exposed for tests and for callers
    /// that manage their own connections.
    pub fn add_client(&self, client: Arc<ToolServerClient>) {
        let mut state = self.state.lock();
        state.handles.insert(
            client.server_id().to_string(),
            ServerHandle {
                server_id: client.server_id().to_string(),
                url: client.url().to_string(),
                healthy: client.is_healthy(),
                last_seen: Utc::now(),
                tool_count: 0,
            },
        );
        state.clients.insert(client.server_id().to_string(), client);
    }

    /// Rediscover tools from every connected server and swap the catalog
    /// atomically. Per-server failures are logged and drop that server's
    /// tools from the new catalog without aborting the others.
    pub async fn refresh_tools(&self) {
        let _guard = self.refresh_lock.lock().await;

        let clients: Vec<Arc<ToolServerClient>> =
            self.state.lock().clients.values().cloned().collect();

        let discoveries = futures_util::future::join_all(
            clients.iter().map(|client| async move {
                (client.server_id().to_string(), client.list_tools().await)
            }),
        )
        .await;

        let now = Utc::now();
        let mut new_tools: BTreeMap<String, ToolDescriptor> = BTreeMap::new();
        let mut discovered: HashMap<String, usize> = HashMap::new();

        for (server_id, result) in discoveries {
            match result {
                Ok(tools) => {
                    discovered.insert(server_id, tools.len());
                    for tool in tools {
                        new_tools.insert(tool.qualified_name.clone(), tool);
                    }
                }
                Err(e) => {
                    tracing::error!(server_id = %server_id, error = %e, "tool discovery failed");
                }
            }
        }

        let exposed_map = assign_exposed_names(&mut new_tools);

        let (catalog_snapshot, handles_snapshot) = {
            let mut state = self.state.lock();
            for client in &clients {
                if let Some(handle) = state.handles.get_mut(client.server_id()) {
                    handle.healthy = client.is_healthy();
                    handle.tool_count = *discovered.get(client.server_id()).unwrap_or(&0);
                    if handle.healthy {
                        handle.last_seen = now;
                    }
                }
            }
            state.tools = new_tools;
            state.exposed_to_qualified = exposed_map;
            (
                state.tools.clone(),
                state.handles.values().cloned().collect::<Vec<_>>(),
            )
        };

        tracing::info!(
            tools = catalog_snapshot.len(),
            servers = clients.len(),
            "tool catalog refreshed"
        );

        let callback = self.on_refreshed.lock().clone();
        if let Some(callback) = callback {
            callback(&catalog_snapshot, &handles_snapshot);
        }
    }

    /// Tool definitions for the LLM: only tools whose owning server is
    /// currently healthy, under their exposed names.
    pub fn to_llm_tools(&self) -> Vec<ToolDefinition> {
        let state = self.state.lock();
        state
            .tools
            .values()
            .filter(|tool| {
                state
                    .clients
                    .get(&tool.server_id)
                    .map(|c| c.is_healthy())
                    .unwrap_or(false)
            })
            .map(|tool| ToolDefinition {
                name: tool.exposed_name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            })
            .collect()
    }

    /// Look up a tool by qualified name.
    pub fn get_tool(&self, qualified_name: &str) -> Option<ToolDescriptor> {
        self.state.lock().tools.get(qualified_name).cloned()
    }

    /// Route and execute a tool call.
    ///
    /// `name` may be a qualified name or an exposed name; resolution is
    /// exact-qualified first, then the exposed map. The outbound call
    /// always uses the qualified name so the owning server receives its
    /// local identifier.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let (qualified_name, client) = {
            let state = self.state.lock();
            let descriptor = state.tools.get(name).or_else(|| {
                state
                    .exposed_to_qualified
                    .get(name)
                    .and_then(|qualified| state.tools.get(qualified))
            });
            let Some(descriptor) = descriptor else {
                return Err(McpError::ToolNotFound(name.to_string()));
            };
            let Some(client) = state.clients.get(&descriptor.server_id) else {
                return Err(McpError::ServerNotFound(descriptor.server_id.clone()));
            };
            if !client.is_healthy() {
                return Err(McpError::ServerUnhealthy(descriptor.server_id.clone()));
            }
            (descriptor.qualified_name.clone(), Arc::clone(client))
        };

        tracing::info!(tool = %qualified_name, server_id = %client.server_id(), "calling tool");
        client.call_tool(&qualified_name, arguments).await
    }

    pub fn list_healthy_servers(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut servers: Vec<String> = state
            .clients
            .iter()
            .filter(|(_, client)| client.is_healthy())
            .map(|(id, _)| id.clone())
            .collect();
        servers.sort();
        servers
    }

    /// Snapshot of per-server status.
    pub fn server_handles(&self) -> Vec<ServerHandle> {
        let mut handles: Vec<ServerHandle> =
            self.state.lock().handles.values().cloned().collect();
        handles.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        handles
    }

    pub fn tool_count(&self) -> usize {
        self.state.lock().tools.len()
    }

    /// Stop the refresh loop and close every client connection.
    pub async fn close_all(&self) {
        self.stop_periodic_refresh().await;
        let clients: Vec<Arc<ToolServerClient>> =
            self.state.lock().clients.values().cloned().collect();
        futures_util::future::join_all(clients.iter().map(|c| c.close())).await;
    }

    // ── Periodic refresh lifecycle ─────────────────────────────────

    /// Start the periodic refresh loop.
    ///
    /// An interval <= 0 stops any running loop and disables refresh.
    /// Calling this with the interval the running loop already uses is
    /// a no-op; a different interval restarts the loop.
    pub async fn start_periodic_refresh(self: &Arc<Self>, interval_secs: i64) {
        if interval_secs <= 0 {
            self.stop_periodic_refresh().await;
            return;
        }

        {
            let task = self.refresh_task.lock().await;
            if let Some(task) = task.as_ref() {
                if !task.handle.is_finished() && task.interval_secs == interval_secs {
                    return;
                }
            }
        }
        self.stop_periodic_refresh().await;

        let cancel = CancellationToken::new();
        let registry = Arc::clone(self);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let interval = Duration::from_secs(interval_secs as u64);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        registry.refresh_tools().await;
                    }
                }
            }
        });

        *self.refresh_task.lock().await = Some(RefreshTask {
            handle,
            cancel,
            interval_secs,
        });
        tracing::info!(interval_secs, "periodic tool refresh started");
    }

    /// Cancel the refresh loop and wait for any in-flight refresh.
    pub async fn stop_periodic_refresh(&self) {
        let task = self.refresh_task.lock().await.take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
            // An in-flight refresh holds this lock until it completes.
            let _guard = self.refresh_lock.lock().await;
            tracing::debug!("periodic tool refresh stopped");
        }
    }
}

#[async_trait]
impl ToolRouter for McpRegistry {
    fn llm_tools(&self) -> Vec<ToolDefinition> {
        self.to_llm_tools()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> dh_domain::Result<Value> {
        McpRegistry::call_tool(self, name, arguments)
            .await
            .map_err(Into::into)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Exposed-name derivation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sanitize a qualified name into an LLM-safe identifier: alphanumerics
/// are preserved, every other character becomes `_`, and a leading digit
/// is prefixed with `t_`.
pub fn sanitize_exposed(qualified_name: &str) -> String {
    let sanitized: String = qualified_name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    match sanitized.chars().next() {
        Some(first) if first.is_ascii_digit() => format!("t_{sanitized}"),
        _ => sanitized,
    }
}

/// Assign a unique exposed name to every descriptor, resolving
/// collisions with `_2`, `_3`, … suffixes in catalog (sorted) order so
/// the mapping is deterministic for a fixed input set.
fn assign_exposed_names(tools: &mut BTreeMap<String, ToolDescriptor>) -> HashMap<String, String> {
    let mut exposed_to_qualified: HashMap<String, String> = HashMap::new();

    for (qualified, descriptor) in tools.iter_mut() {
        let base = sanitize_exposed(qualified);
        let mut candidate = base.clone();
        let mut suffix = 2;
        while exposed_to_qualified.contains_key(&candidate) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        exposed_to_qualified.insert(candidate.clone(), qualified.clone());
        descriptor.exposed_name = candidate;
    }

    exposed_to_qualified
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::MockTransport;
    use dh_domain::retry::RetryPolicy;

    fn no_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        }
    }

    fn mock_client(server_id: &str, transport: MockTransport) -> Arc<ToolServerClient> {
        Arc::new(
            ToolServerClient::with_transport(
                server_id,
                &format!("http://{server_id}:9000"),
                Box::new(transport),
            )
            .with_retry_policy(no_retry()),
        )
    }

    fn registry_with(clients: Vec<Arc<ToolServerClient>>) -> Arc<McpRegistry> {
        let registry = Arc::new(McpRegistry::new(Vec::new()));
        for client in clients {
            registry.add_client(client);
        }
        registry
    }

    #[test]
    fn sanitize_basic() {
        assert_eq!(sanitize_exposed("web.search"), "web_search");
        assert_eq!(sanitize_exposed("web/search"), "web_search");
        assert_eq!(sanitize_exposed("data-lake.run-query"), "data_lake_run_query");
        assert_eq!(sanitize_exposed("srv.tool name!"), "srv_tool_name_");
    }

    #[test]
    fn sanitize_prefixes_leading_digit() {
        assert_eq!(sanitize_exposed("1db.query"), "t_1db_query");
    }

    #[test]
    fn collision_resolution_is_deterministic() {
        let make = |qualified: &str| ToolDescriptor {
            qualified_name: qualified.to_string(),
            exposed_name: String::new(),
            description: String::new(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
            server_id: "s".into(),
        };

        for _ in 0..3 {
            let mut tools = BTreeMap::new();
            tools.insert("web.search".to_string(), make("web.search"));
            tools.insert("web/search".to_string(), make("web/search"));

            let map = assign_exposed_names(&mut tools);
            // "web.search" sorts before "web/search" ('.' < '/').
            assert_eq!(tools["web.search"].exposed_name, "web_search");
            assert_eq!(tools["web/search"].exposed_name, "web_search_2");
            assert_eq!(map["web_search"], "web.search");
            assert_eq!(map["web_search_2"], "web/search");
        }
    }

    #[test]
    fn exposed_names_are_injective() {
        let make = |qualified: &str| ToolDescriptor {
            qualified_name: qualified.to_string(),
            exposed_name: String::new(),
            description: String::new(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
            server_id: "s".into(),
        };
        let mut tools = BTreeMap::new();
        for name in ["a.t", "a/t", "a-t", "a_t"] {
            tools.insert(name.to_string(), make(name));
        }
        let map = assign_exposed_names(&mut tools);
        assert_eq!(map.len(), 4);
    }

    #[tokio::test]
    async fn refresh_builds_catalog_and_routes_by_both_names() {
        let transport = MockTransport::new(vec![MockTransport::tool("search")])
            .with_result("search", serde_json::json!({"hits": 1}));
        let registry = registry_with(vec![mock_client("web", transport)]);
        registry.refresh_tools().await;

        assert_eq!(registry.tool_count(), 1);
        let tools = registry.to_llm_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "web_search");

        // Both the qualified and the exposed name resolve to the server's
        // local tool name.
        let by_qualified = registry
            .call_tool("web.search", serde_json::json!({}))
            .await
            .unwrap();
        let by_exposed = registry
            .call_tool("web_search", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(by_qualified, by_exposed);
    }

    #[tokio::test]
    async fn unknown_tool_fails_fast() {
        let registry = registry_with(vec![]);
        let err = registry
            .call_tool("nope", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn refresh_drops_unreachable_server_atomically() {
        let a = MockTransport::new(vec![MockTransport::tool("t1")]);
        let b = MockTransport::new(vec![MockTransport::tool("t2")]);
        let registry = registry_with(vec![mock_client("a", a), mock_client("b", b)]);
        registry.refresh_tools().await;
        assert_eq!(registry.tool_count(), 2);

        // B becomes unreachable; the next refresh keeps only A's tools.
        let failing = MockTransport::new(vec![MockTransport::tool("t2")]);
        failing.fail_listing.store(true, std::sync::atomic::Ordering::SeqCst);
        registry.add_client(mock_client("b", failing));
        registry.refresh_tools().await;

        assert_eq!(registry.tool_count(), 1);
        let tools = registry.to_llm_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "a_t1");

        let err = registry
            .call_tool("b_t2", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn healthy_servers_listing() {
        let a = MockTransport::new(vec![MockTransport::tool("t1")]);
        let registry = registry_with(vec![mock_client("a", a)]);
        registry.refresh_tools().await;
        assert_eq!(registry.list_healthy_servers(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn refresh_callback_sees_new_catalog() {
        let transport = MockTransport::new(vec![MockTransport::tool("search")]);
        let registry = registry_with(vec![mock_client("web", transport)]);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let seen_ref = Arc::clone(&seen);
        registry.set_refreshed_callback(Arc::new(move |catalog, handles| {
            let mut seen = seen_ref.lock();
            seen.extend(catalog.keys().cloned());
            assert_eq!(handles.len(), 1);
        }));

        registry.refresh_tools().await;
        assert_eq!(*seen.lock(), vec!["web.search".to_string()]);
    }

    #[tokio::test]
    async fn periodic_refresh_lifecycle() {
        let registry = registry_with(vec![]);

        // Interval <= 0 disables the loop.
        registry.start_periodic_refresh(0).await;
        assert!(registry.refresh_task.lock().await.is_none());

        registry.start_periodic_refresh(3600).await;
        assert!(registry.refresh_task.lock().await.is_some());

        // Same interval while running: no-op (task unchanged).
        registry.start_periodic_refresh(3600).await;
        assert!(registry.refresh_task.lock().await.is_some());

        registry.stop_periodic_refresh().await;
        assert!(registry.refresh_task.lock().await.is_none());
    }
}
