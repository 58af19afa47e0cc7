//! Transport abstraction: one live JSON-RPC connection per implementor.
//!
//! [`Transport`] captures the contract shared by every concrete transport:
//! connect/disconnect lifecycle, framed send, request/response correlation
//! with timeout, fire-and-forget notify, and dispatch of inbound requests to
//! registered handlers. Concrete transports (`stdio_self`, `stdio_process`,
//! `sse`, and the test-only `fake`) only need to implement `core()`,
//! `connect()`, `disconnect()`, and `send_line()` -- everything else is a
//! provided default method built on top of [`JsonRpcCore`], the shared
//! pending-request and handler-table state.
//!
//! This mirrors the upstream source's `Transport` abstract base class, which
//! implements `request`/`notify`/`_handle_message` once and leaves only
//! `connect`/`disconnect`/`send_message`/`receive_messages` abstract; the Rust
//! rendition gets the same effect from default trait methods plus a shared
//! core struct, since Rust has no implementation inheritance.

pub mod fake;
pub mod manager;
pub mod sse;
pub mod stdio_process;
pub mod stdio_self;

pub use manager::TransportManager;

use crate::error::CoreError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

/// Lifecycle state of a transport connection.
///
/// A superset of the upstream source's `ConnectionState`: it keeps `CLOSED`
/// as the terminal rest state after a clean `disconnect()` (the source has
/// this) and adds `RECONNECTING`, entered only by a health loop driving its
/// own reconnect attempts (see the MCP control plane), never by a bare
/// transport acting alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
    Error,
    Reconnecting,
}

/// Observable per-transport statistics.
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub pending_count: usize,
}

/// A registered handler for an inbound `method`. Takes the request's
/// `params` and returns the JSON `result` value, or a [`CoreError`] which is
/// translated into a JSON-RPC `-32603` internal-error response.
pub type HandlerFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, CoreError>> + Send + Sync>;

/// Shared state backing every [`Transport`] implementation: the pending
/// request table, the method handler table, connection state, and stats.
/// Concrete transports hold this behind an `Arc` so it can be cloned into
/// background I/O tasks alongside the rest of the transport's state.
pub struct JsonRpcCore {
    name: String,
    state: Mutex<ConnectionState>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, CoreError>>>>,
    handlers: Mutex<HashMap<String, HandlerFn>>,
    stats: Mutex<TransportStats>,
}

impl JsonRpcCore {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(ConnectionState::Disconnected),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            stats: Mutex::new(TransportStats::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    pub async fn set_state(&self, s: ConnectionState) {
        *self.state.lock().await = s;
    }

    async fn begin_request(&self) -> (u64, oneshot::Receiver<Result<Value, CoreError>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        (id, rx)
    }

    async fn resolve(&self, id: u64, result: Result<Value, CoreError>) {
        if let Some(tx) = self.pending.lock().await.remove(&id) {
            let _ = tx.send(result);
        }
    }

    async fn cancel_pending_one(&self, id: u64) {
        self.pending.lock().await.remove(&id);
    }

    /// Cancel every pending request with a single cancellation reason. Used
    /// by `disconnect()`.
    pub async fn cancel_all(&self, reason: &str) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(CoreError::Cancellation(reason.to_string())));
        }
    }

    pub async fn record_sent(&self) {
        self.stats.lock().await.messages_sent += 1;
    }

    async fn record_received(&self) {
        self.stats.lock().await.messages_received += 1;
    }

    async fn record_error(&self) {
        self.stats.lock().await.errors += 1;
    }

    pub async fn mark_connected(&self) {
        self.set_state(ConnectionState::Connected).await;
        self.stats.lock().await.connected_at = Some(Utc::now());
    }

    pub async fn mark_closed(&self) {
        self.set_state(ConnectionState::Closed).await;
        self.stats.lock().await.disconnected_at = Some(Utc::now());
    }

    pub async fn register_handler(&self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.lock().await.insert(method.into(), handler);
    }

    pub async fn stats(&self) -> TransportStats {
        let mut snapshot = self.stats.lock().await.clone();
        snapshot.pending_count = self.pending.lock().await.len();
        snapshot
    }
}

/// One live connection, framed JSON-RPC 2.0 over newline-delimited JSON (or
/// an SSE/HTTP equivalent framing for the `sse` variant).
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Access this transport's shared pending/handler/state core.
    fn core(&self) -> &JsonRpcCore;

    /// DISCONNECTED -> CONNECTING -> CONNECTED, or -> ERROR with a typed failure.
    async fn connect(&self) -> Result<(), CoreError>;

    /// CLOSING -> CLOSED, cancelling all pending responses and running close
    /// handlers exactly once. A second call on an already-CLOSED transport is
    /// a no-op returning `Ok(())`.
    async fn disconnect(&self) -> Result<(), CoreError>;

    /// Write one complete JSON-RPC frame. Implementations serialize this
    /// under an internal write lock so concurrent callers stay framed.
    async fn send_line(&self, line: String) -> Result<(), CoreError>;

    /// Send a request and await the matching response.
    ///
    /// Allocates a monotonic id, registers a pending slot before sending (so
    /// a response racing the send can never be missed), and removes the slot
    /// on timeout or send failure.
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CoreError> {
        let (id, rx) = self.core().begin_request().await;
        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let line = serde_json::to_string(&frame)?;

        if let Err(e) = self.send_line(line).await {
            self.core().cancel_pending_one(id).await;
            return Err(e);
        }
        self.core().record_sent().await;

        let awaited = match timeout {
            Some(d) => match tokio::time::timeout(d, rx).await {
                Ok(inner) => inner,
                Err(_) => {
                    self.core().cancel_pending_one(id).await;
                    return Err(CoreError::Timeout(d));
                }
            },
            None => rx.await,
        };

        match awaited {
            Ok(result) => result,
            Err(_) => Err(CoreError::Transport {
                transport: self.core().name().to_string(),
                message: "read loop exited before a response arrived".to_string(),
            }),
        }
    }

    /// Send a notification; no response is expected.
    async fn notify(&self, method: &str, params: Value) -> Result<(), CoreError> {
        let frame = json!({"jsonrpc": "2.0", "method": method, "params": params});
        let line = serde_json::to_string(&frame)?;
        self.send_line(line).await?;
        self.core().record_sent().await;
        Ok(())
    }

    /// Register a handler for an inbound request or notification method.
    ///
    /// A thin forwarder to [`JsonRpcCore::register_handler`] so callers
    /// holding a `Arc<dyn Transport>` don't need to reach through `core()`
    /// themselves.
    async fn on_message(&self, method: String, handler: HandlerFn) {
        self.core().register_handler(method, handler).await;
    }

    /// Dispatch one raw inbound line: fulfills a pending request, invokes a
    /// registered handler for a request/notification, or responds
    /// method-not-found for an unhandled request.
    async fn handle_incoming(&self, raw: &str) -> Result<(), CoreError> {
        self.core().record_received().await;

        let value: Value = serde_json::from_str(raw).map_err(|e| CoreError::Parse {
            line: 0,
            message: e.to_string(),
            excerpt: raw.chars().take(100).collect(),
        })?;

        let Some(obj) = value.as_object() else {
            self.core().record_error().await;
            return Err(CoreError::Transport {
                transport: self.core().name().to_string(),
                message: "frame is not a JSON object".to_string(),
            });
        };

        let id = obj.get("id").and_then(Value::as_u64);
        let method = obj.get("method").and_then(Value::as_str);

        // A response: has `id` matching a pending request, no `method`.
        if method.is_none() {
            if let Some(id) = id {
                if let Some(result) = obj.get("result") {
                    self.core().resolve(id, Ok(result.clone())).await;
                    return Ok(());
                }
                if let Some(error) = obj.get("error") {
                    self.core().record_error().await;
                    let message = error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string();
                    self.core()
                        .resolve(
                            id,
                            Err(CoreError::Transport {
                                transport: self.core().name().to_string(),
                                message,
                            }),
                        )
                        .await;
                    return Ok(());
                }
            }
            return Ok(());
        }

        let method = method.unwrap();
        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        let id_value = obj.get("id").cloned();

        let handler = self.core().handlers.lock().await.get(method).cloned();
        match handler {
            Some(handler) => {
                let outcome = handler(params).await;
                if let Some(id_value) = id_value {
                    let response = match outcome {
                        Ok(result) => json!({"jsonrpc": "2.0", "id": id_value, "result": result}),
                        Err(e) => json!({
                            "jsonrpc": "2.0",
                            "id": id_value,
                            "error": {"code": -32603, "message": e.to_string()}
                        }),
                    };
                    self.send_line(serde_json::to_string(&response)?).await?;
                    self.core().record_sent().await;
                }
            }
            None => {
                if let Some(id_value) = id_value {
                    let response = json!({
                        "jsonrpc": "2.0",
                        "id": id_value,
                        "error": {"code": -32601, "message": format!("method not found: {method}")}
                    });
                    self.send_line(serde_json::to_string(&response)?).await?;
                    self.core().record_sent().await;
                }
            }
        }

        Ok(())
    }

    /// Current connection state.
    async fn state(&self) -> ConnectionState {
        self.core().state().await
    }

    /// Current observable statistics.
    async fn stats(&self) -> TransportStats {
        self.core().stats().await
    }
}
