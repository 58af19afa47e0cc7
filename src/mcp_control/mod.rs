//! Higher-level manager over the transport layer for remote MCP endpoints.
//!
//! Owns a persistent catalog of [`McpServerDescriptor`]s and a live
//! [`ConnectionInfo`] per connected one. Connecting creates the right
//! concrete transport via [`TransportManager`], registers the standard
//! inbound handlers, and starts a per-connection health-check loop that
//! pings on an interval and reconnects after too many consecutive failures.

use crate::error::CoreError;
use crate::metrics::{LifecycleEvent, MetricsSink, NoopMetricsSink};
use crate::transport::sse::SseTransport;
use crate::transport::stdio_process::StdioProcessTransport;
use crate::transport::{ConnectionState, HandlerFn, TransportManager};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum McpTransportKind {
    StdioProcess,
    Sse,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerDescriptor {
    pub id: String,
    pub name: String,
    pub transport: McpTransportKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub endpoint: Option<String>,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub health_check_interval: Duration,
    pub enabled: bool,
}

impl McpServerDescriptor {
    fn validate(&self) -> Result<(), CoreError> {
        if self.name.is_empty() {
            return Err(CoreError::Validation("server name is required".to_string()));
        }
        match self.transport {
            McpTransportKind::StdioProcess if self.command.is_none() => {
                Err(CoreError::Validation("stdio-process transport requires a command".to_string()))
            }
            McpTransportKind::Sse | McpTransportKind::Http if self.endpoint.is_none() => {
                Err(CoreError::Validation(format!("{:?} transport requires an endpoint", self.transport)))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub server_id: String,
    pub state: ConnectionState,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_ping: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
}

struct Inner {
    servers: HashMap<String, McpServerDescriptor>,
    connections: HashMap<String, ConnectionInfo>,
    health_tasks: HashMap<String, JoinHandle<()>>,
}

pub struct McpControlPlane {
    inner: Mutex<Inner>,
    transports: Arc<TransportManager>,
    metrics: Arc<dyn MetricsSink>,
}

impl McpControlPlane {
    pub fn new() -> Arc<Self> {
        Self::new_with_metrics(Arc::new(NoopMetricsSink))
    }

    /// Like [`McpControlPlane::new`] but forwarding lifecycle events (e.g. a
    /// connection that fails to reconnect and transitions to `ERROR`) to
    /// `metrics`.
    pub fn new_with_metrics(metrics: Arc<dyn MetricsSink>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                servers: HashMap::new(),
                connections: HashMap::new(),
                health_tasks: HashMap::new(),
            }),
            transports: TransportManager::new(),
            metrics,
        })
    }

    pub async fn add_server(&self, server: McpServerDescriptor) -> Result<(), CoreError> {
        server.validate()?;
        let mut inner = self.inner.lock().await;
        if inner.servers.contains_key(&server.id) {
            return Err(CoreError::Conflict(format!("server '{}' already exists", server.id)));
        }
        inner.servers.insert(server.id.clone(), server);
        Ok(())
    }

    pub async fn remove_server(&self, server_id: &str) -> Result<bool, CoreError> {
        let has_connection = self.inner.lock().await.connections.contains_key(server_id);
        if has_connection {
            self.disconnect_server(server_id).await?;
        }
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.health_tasks.remove(server_id) {
            task.abort();
        }
        Ok(inner.servers.remove(server_id).is_some())
    }

    pub async fn get_server(&self, server_id: &str) -> Option<McpServerDescriptor> {
        self.inner.lock().await.servers.get(server_id).cloned()
    }

    pub async fn list_servers(&self, transport: Option<McpTransportKind>, enabled_only: bool) -> Vec<McpServerDescriptor> {
        self.inner
            .lock()
            .await
            .servers
            .values()
            .filter(|s| transport.map(|t| t == s.transport).unwrap_or(true))
            .filter(|s| !enabled_only || s.enabled)
            .cloned()
            .collect()
    }

    /// Build the right transport for `server_id`, register it, connect, and
    /// start its health-check loop.
    pub async fn connect_server(self: &Arc<Self>, server_id: &str) -> Result<ConnectionInfo, CoreError> {
        let server = self
            .get_server(server_id)
            .await
            .ok_or_else(|| CoreError::server_not_found(server_id))?;

        let transport = self.build_transport(&server)?;
        register_standard_handlers(&transport).await;
        self.transports.add_transport(server_id, transport.clone()).await.or_else(|e| match e {
            CoreError::Conflict(_) => Ok(()),
            other => Err(other),
        })?;

        transport.connect().await?;

        let info = ConnectionInfo {
            server_id: server_id.to_string(),
            state: transport.state().await,
            error_count: 0,
            last_error: None,
            last_ping: None,
            connected_at: Some(Utc::now()),
            reconnect_attempts: 0,
        };

        {
            let mut inner = self.inner.lock().await;
            inner.connections.insert(server_id.to_string(), info.clone());
        }

        let plane = self.clone();
        let id = server_id.to_string();
        let handle = tokio::spawn(async move { plane.health_check_loop(id).await });
        self.inner.lock().await.health_tasks.insert(server_id.to_string(), handle);

        Ok(info)
    }

    fn build_transport(&self, server: &McpServerDescriptor) -> Result<Arc<dyn crate::transport::Transport>, CoreError> {
        match server.transport {
            McpTransportKind::StdioProcess => {
                let command = server
                    .command
                    .clone()
                    .ok_or_else(|| CoreError::Configuration("missing command".to_string()))?;
                Ok(StdioProcessTransport::new(&server.id, command, server.args.clone(), server.env.clone(), None)
                    as Arc<dyn crate::transport::Transport>)
            }
            McpTransportKind::Sse | McpTransportKind::Http => {
                let endpoint = server
                    .endpoint
                    .clone()
                    .ok_or_else(|| CoreError::Configuration("missing endpoint".to_string()))?;
                SseTransport::new(&server.id, endpoint, "/mcp/sse".to_string(), server.headers.clone(), server.timeout)
                    .map(|t| t as Arc<dyn crate::transport::Transport>)
            }
        }
    }

    pub async fn disconnect_server(&self, server_id: &str) -> Result<bool, CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.health_tasks.remove(server_id) {
            task.abort();
        }
        if inner.connections.remove(server_id).is_none() {
            return Ok(false);
        }
        drop(inner);

        self.transports.disconnect(Some(server_id)).await?;
        let _ = self.transports.remove_transport(server_id).await;
        Ok(true)
    }

    pub async fn get_connection(&self, server_id: &str) -> Option<ConnectionInfo> {
        self.inner.lock().await.connections.get(server_id).cloned()
    }

    pub async fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.inner.lock().await.connections.values().cloned().collect()
    }

    /// Requires the connection to be `CONNECTED`; failures advance the
    /// connection's error counters the same way the health loop does.
    pub async fn send_request(&self, server_id: &str, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value, CoreError> {
        let connected = self
            .inner
            .lock()
            .await
            .connections
            .get(server_id)
            .map(|c| c.state == ConnectionState::Connected)
            .unwrap_or(false);
        if !connected {
            return Err(CoreError::Transport {
                transport: server_id.to_string(),
                message: "server is not connected".to_string(),
            });
        }

        match self.transports.request(method, params, Some(server_id), timeout).await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.record_error(server_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn record_error(&self, server_id: &str, message: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(conn) = inner.connections.get_mut(server_id) {
            conn.error_count += 1;
            conn.last_error = Some(message.to_string());
        }
    }

    async fn health_check_loop(self: Arc<Self>, server_id: String) {
        loop {
            let Some(server) = self.get_server(&server_id).await else { break };
            tokio::time::sleep(server.health_check_interval).await;

            if self.inner.lock().await.connections.get(&server_id).is_none() {
                break;
            }

            let ping = self
                .transports
                .request("ping", serde_json::json!({}), Some(&server_id), Some(Duration::from_secs(5)))
                .await;

            let mut should_reconnect = false;
            {
                let mut inner = self.inner.lock().await;
                let Some(conn) = inner.connections.get_mut(&server_id) else { break };
                match ping {
                    Ok(_) => {
                        conn.last_ping = Some(Utc::now());
                        conn.error_count = 0;
                    }
                    Err(e) => {
                        conn.error_count += 1;
                        conn.last_error = Some(e.to_string());
                        if conn.error_count >= server.retry_count {
                            should_reconnect = true;
                        }
                    }
                }
            }

            if should_reconnect {
                if let Some(conn) = self.inner.lock().await.connections.get_mut(&server_id) {
                    conn.state = ConnectionState::Reconnecting;
                    conn.reconnect_attempts += 1;
                }
                let _ = self.transports.disconnect(Some(&server_id)).await;
                tokio::time::sleep(server.retry_delay).await;
                if let Err(e) = self.transports.connect(Some(&server_id)).await {
                    tracing::error!(server = %server_id, error = %e, "mcp server reconnect failed");
                    if let Some(conn) = self.inner.lock().await.connections.get_mut(&server_id) {
                        conn.state = ConnectionState::Error;
                    }
                    self.metrics.emit(LifecycleEvent::McpConnectionError { server_id: server_id.clone() });
                } else if let Some(conn) = self.inner.lock().await.connections.get_mut(&server_id) {
                    conn.state = ConnectionState::Connected;
                    conn.error_count = 0;
                }
            }
        }
    }

    /// Cancel all sessions under this plane's control: disconnect every
    /// connection and join every health task within a grace period.
    pub async fn stop(&self, grace_period: Duration) {
        let ids: Vec<String> = self.inner.lock().await.connections.keys().cloned().collect();
        for id in ids {
            let _ = self.disconnect_server(&id).await;
        }
        let _ = tokio::time::timeout(grace_period, async {
            let mut inner = self.inner.lock().await;
            for (_, task) in inner.health_tasks.drain() {
                task.abort();
            }
        })
        .await;
    }
}

async fn register_standard_handlers(transport: &Arc<dyn crate::transport::Transport>) {
    let noop_list: HandlerFn = Arc::new(|_params| Box::pin(async { Ok(serde_json::json!({"items": []})) }));
    transport.on_message("ping".to_string(), Arc::new(|_p| Box::pin(async { Ok(serde_json::json!({"pong": true})) }))).await;
    transport.on_message("notification".to_string(), Arc::new(|_p| Box::pin(async { Ok(serde_json::json!({})) }))).await;
    transport.on_message("tools/list".to_string(), noop_list.clone()).await;
    transport.on_message("resources/list".to_string(), noop_list.clone()).await;
    transport.on_message("prompts/list".to_string(), noop_list).await;
}

/// Candidate servers surfaced by discovery, with the source they came from.
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub source: String,
    pub servers: Vec<McpServerDescriptor>,
}

/// Scans for locally-installed MCP-capable binaries and well-known config
/// files. Each call is independent; callers wanting TTL-cached discovery
/// should cache `DiscoveryResult` themselves keyed by source.
pub struct Discovery {
    pub search_dirs: Vec<PathBuf>,
    pub binary_prefixes: Vec<String>,
}

impl Discovery {
    pub fn new(search_dirs: Vec<PathBuf>, binary_prefixes: Vec<String>) -> Self {
        Self { search_dirs, binary_prefixes }
    }

    /// Walk `search_dirs` (non-recursively) for executables whose file name
    /// starts with one of `binary_prefixes`.
    pub fn discover_local(&self) -> DiscoveryResult {
        let mut servers = Vec::new();
        for dir in &self.search_dirs {
            let Ok(entries) = std::fs::read_dir(dir) else { continue };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if self.binary_prefixes.iter().any(|p| name.starts_with(p.as_str())) {
                    servers.push(McpServerDescriptor {
                        id: format!("local:{name}"),
                        name: name.clone(),
                        transport: McpTransportKind::StdioProcess,
                        command: Some(entry.path().to_string_lossy().to_string()),
                        args: Vec::new(),
                        env: HashMap::new(),
                        endpoint: None,
                        headers: HashMap::new(),
                        timeout: Duration::from_secs(30),
                        retry_count: 3,
                        retry_delay: Duration::from_secs(1),
                        health_check_interval: Duration::from_secs(60),
                        enabled: true,
                    });
                }
            }
        }
        DiscoveryResult { source: "local".to_string(), servers }
    }

    /// Read a well-known JSON config (an object keyed by server name, each
    /// value a `{command, args, env}` descriptor -- the same shape the
    /// reference host's own config file uses).
    pub fn discover_from_config(&self, config_path: &std::path::Path) -> Result<DiscoveryResult, CoreError> {
        let Ok(text) = std::fs::read_to_string(config_path) else {
            return Ok(DiscoveryResult { source: "config".to_string(), servers: Vec::new() });
        };
        let parsed: Value = serde_json::from_str(&text)?;
        let mut servers = Vec::new();
        if let Some(map) = parsed.get("mcpServers").and_then(Value::as_object) {
            for (name, spec) in map {
                let command = spec.get("command").and_then(Value::as_str).map(str::to_string);
                let args = spec
                    .get("args")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                let env = spec
                    .get("env")
                    .and_then(Value::as_object)
                    .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
                    .unwrap_or_default();
                servers.push(McpServerDescriptor {
                    id: format!("config:{name}"),
                    name: name.clone(),
                    transport: McpTransportKind::StdioProcess,
                    command,
                    args,
                    env,
                    endpoint: None,
                    headers: HashMap::new(),
                    timeout: Duration::from_secs(30),
                    retry_count: 3,
                    retry_delay: Duration::from_secs(1),
                    health_check_interval: Duration::from_secs(60),
                    enabled: true,
                });
            }
        }
        Ok(DiscoveryResult { source: "config".to_string(), servers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> McpServerDescriptor {
        McpServerDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            transport: McpTransportKind::StdioProcess,
            command: Some("cat".to_string()),
            args: Vec::new(),
            env: HashMap::new(),
            endpoint: None,
            headers: HashMap::new(),
            timeout: Duration::from_secs(5),
            retry_count: 3,
            retry_delay: Duration::from_millis(10),
            health_check_interval: Duration::from_secs(3600),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn add_server_rejects_stdio_without_command() {
        let plane = McpControlPlane::new();
        let mut bad = descriptor("bad");
        bad.command = None;
        let err = plane.add_server(bad).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn add_server_rejects_duplicate_id() {
        let plane = McpControlPlane::new();
        plane.add_server(descriptor("a")).await.unwrap();
        let err = plane.add_server(descriptor("a")).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_servers_filters_by_enabled() {
        let plane = McpControlPlane::new();
        plane.add_server(descriptor("a")).await.unwrap();
        let mut disabled = descriptor("b");
        disabled.enabled = false;
        plane.add_server(disabled).await.unwrap();

        assert_eq!(plane.list_servers(None, false).await.len(), 2);
        assert_eq!(plane.list_servers(None, true).await.len(), 1);
    }

    #[tokio::test]
    async fn connect_to_unknown_server_is_not_found() {
        let plane = McpControlPlane::new();
        let err = plane.connect_server("missing").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn remove_server_disconnects_first() {
        let plane = McpControlPlane::new();
        plane.add_server(descriptor("cat-server")).await.unwrap();
        plane.connect_server("cat-server").await.unwrap();
        assert!(plane.get_connection("cat-server").await.is_some());

        let removed = plane.remove_server("cat-server").await.unwrap();
        assert!(removed);
        assert!(plane.get_connection("cat-server").await.is_none());
    }

    #[tokio::test]
    async fn send_request_without_connection_is_a_transport_error() {
        let plane = McpControlPlane::new();
        plane.add_server(descriptor("x")).await.unwrap();
        let err = plane.send_request("x", "ping", serde_json::json!({}), None).await.unwrap_err();
        assert!(matches!(err, CoreError::Transport { .. }));
    }

    #[test]
    fn discover_local_matches_prefixed_binaries() {
        let dir = crate::test_utils::temp_dir();
        std::fs::write(dir.path().join("claude-mcp-tool"), b"").unwrap();
        std::fs::write(dir.path().join("unrelated"), b"").unwrap();

        let discovery = Discovery::new(vec![dir.path().to_path_buf()], vec!["claude-mcp".to_string()]);
        let result = discovery.discover_local();
        assert_eq!(result.servers.len(), 1);
        assert_eq!(result.servers[0].name, "claude-mcp-tool");
    }
}
