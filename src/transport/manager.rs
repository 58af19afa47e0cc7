//! Owns every live transport connection by name and routes requests to a
//! primary or a specifically named one.
//!
//! Grounded on the reference implementation's `TransportManager`: transports
//! are registered under a name, the first one registered becomes primary,
//! message handlers registered through the manager apply to every transport
//! (present and future), and `broadcast` fans a notification out to every
//! connected transport without letting one failure abort the rest.

use crate::error::CoreError;
use crate::transport::{ConnectionState, HandlerFn, Transport, TransportStats};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub total_errors: u64,
}

#[derive(Debug, Clone)]
pub struct TransportSummary {
    pub name: String,
    pub state: ConnectionState,
    pub is_primary: bool,
    pub stats: TransportStats,
}

struct Inner {
    transports: HashMap<String, Arc<dyn Transport>>,
    primary: Option<String>,
    message_handlers: Vec<(String, HandlerFn)>,
    total_connections: u64,
    total_errors: u64,
}

/// Routes requests/notifications to named or primary transports and keeps
/// per-manager aggregate statistics.
pub struct TransportManager {
    inner: RwLock<Inner>,
}

impl TransportManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner {
                transports: HashMap::new(),
                primary: None,
                message_handlers: Vec::new(),
                total_connections: 0,
                total_errors: 0,
            }),
        })
    }

    /// Register a transport under `name`. The first transport registered
    /// becomes primary. Fails if `name` is already taken.
    pub async fn add_transport(
        &self,
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Result<(), CoreError> {
        let name = name.into();
        let mut inner = self.inner.write().await;
        if inner.transports.contains_key(&name) {
            return Err(CoreError::Conflict(format!("transport '{name}' already exists")));
        }

        for (method, handler) in &inner.message_handlers {
            transport.on_message(method.clone(), handler.clone()).await;
        }

        if inner.primary.is_none() {
            inner.primary = Some(name.clone());
        }
        inner.transports.insert(name, transport);
        Ok(())
    }

    pub async fn remove_transport(&self, name: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;
        let transport = inner
            .transports
            .remove(name)
            .ok_or_else(|| CoreError::NotFound { kind: "transport", id: name.to_string() })?;

        if transport.state().await == ConnectionState::Connected {
            let _ = transport.disconnect().await;
        }
        if inner.primary.as_deref() == Some(name) {
            inner.primary = inner.transports.keys().next().cloned();
        }
        Ok(())
    }

    pub async fn connect(&self, name: Option<&str>) -> Result<(), CoreError> {
        match name {
            Some(name) => self.get(name).await?.connect().await,
            None => {
                let transports = self.inner.read().await.transports.clone();
                for t in transports.into_values() {
                    if let Err(e) = t.connect().await {
                        tracing::warn!(transport = %t.core().name(), error = %e, "connect failed during connect-all");
                    }
                }
                Ok(())
            }
        }
    }

    pub async fn disconnect(&self, name: Option<&str>) -> Result<(), CoreError> {
        match name {
            Some(name) => self.get(name).await?.disconnect().await,
            None => {
                let transports = self.inner.read().await.transports.clone();
                for t in transports.into_values() {
                    if let Err(e) = t.disconnect().await {
                        tracing::warn!(transport = %t.core().name(), error = %e, "disconnect failed during disconnect-all");
                    }
                }
                Ok(())
            }
        }
    }

    pub async fn request(
        &self,
        method: &str,
        params: Value,
        transport: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Value, CoreError> {
        let t = match transport {
            Some(name) => self.get(name).await?,
            None => self.primary().await?,
        };
        t.request(method, params, timeout).await
    }

    pub async fn notify(&self, method: &str, params: Value, transport: Option<&str>) -> Result<(), CoreError> {
        let t = match transport {
            Some(name) => self.get(name).await?,
            None => self.primary().await?,
        };
        t.notify(method, params).await
    }

    /// Notify every connected transport. One failure does not stop the rest;
    /// the per-transport outcome is returned keyed by name.
    pub async fn broadcast(&self, method: &str, params: Value) -> HashMap<String, Result<(), String>> {
        let transports = self.inner.read().await.transports.clone();
        let mut results = HashMap::with_capacity(transports.len());
        for (name, t) in transports {
            if t.state().await != ConnectionState::Connected {
                continue;
            }
            let outcome = t.notify(method, params.clone()).await.map_err(|e| e.to_string());
            results.insert(name, outcome);
        }
        results
    }

    /// Register a handler for `method` on every transport registered so far
    /// and every transport registered in the future.
    pub async fn on_message(&self, method: impl Into<String>, handler: HandlerFn) {
        let method = method.into();
        let mut inner = self.inner.write().await;
        for t in inner.transports.values() {
            t.on_message(method.clone(), handler.clone()).await;
        }
        inner.message_handlers.push((method, handler));
    }

    pub async fn set_primary(&self, name: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;
        if !inner.transports.contains_key(name) {
            return Err(CoreError::NotFound { kind: "transport", id: name.to_string() });
        }
        inner.primary = Some(name.to_string());
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Arc<dyn Transport>, CoreError> {
        self.inner
            .read()
            .await
            .transports
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound { kind: "transport", id: name.to_string() })
    }

    async fn primary(&self) -> Result<Arc<dyn Transport>, CoreError> {
        let inner = self.inner.read().await;
        let name = inner
            .primary
            .as_ref()
            .ok_or_else(|| CoreError::Configuration("no primary transport available".to_string()))?;
        inner
            .transports
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound { kind: "transport", id: name.clone() })
    }

    pub async fn list(&self) -> Vec<TransportSummary> {
        let inner = self.inner.read().await;
        let mut out = Vec::with_capacity(inner.transports.len());
        for (name, t) in &inner.transports {
            out.push(TransportSummary {
                name: name.clone(),
                state: t.state().await,
                is_primary: inner.primary.as_deref() == Some(name.as_str()),
                stats: t.stats().await,
            });
        }
        out
    }

    pub async fn stats(&self) -> ManagerStats {
        let inner = self.inner.read().await;
        let mut active = 0;
        for t in inner.transports.values() {
            if t.state().await == ConnectionState::Connected {
                active += 1;
            }
        }
        ManagerStats {
            total_connections: inner.total_connections,
            active_connections: active,
            total_errors: inner.total_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;

    #[tokio::test]
    async fn first_registered_transport_becomes_primary() {
        let mgr = TransportManager::new();
        let (t1, _h1) = FakeTransport::new("a");
        let (t2, _h2) = FakeTransport::new("b");
        mgr.add_transport("a", t1).await.unwrap();
        mgr.add_transport("b", t2).await.unwrap();

        let list = mgr.list().await;
        assert!(list.iter().find(|s| s.name == "a").unwrap().is_primary);
        assert!(!list.iter().find(|s| s.name == "b").unwrap().is_primary);
    }

    #[tokio::test]
    async fn duplicate_name_is_a_conflict() {
        let mgr = TransportManager::new();
        let (t1, _h1) = FakeTransport::new("a");
        let (t2, _h2) = FakeTransport::new("a-again");
        mgr.add_transport("a", t1).await.unwrap();
        let err = mgr.add_transport("a", t2).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn removing_primary_promotes_another() {
        let mgr = TransportManager::new();
        let (t1, _h1) = FakeTransport::new("a");
        let (t2, _h2) = FakeTransport::new("b");
        mgr.add_transport("a", t1).await.unwrap();
        mgr.add_transport("b", t2).await.unwrap();

        mgr.remove_transport("a").await.unwrap();
        let list = mgr.list().await;
        assert_eq!(list.len(), 1);
        assert!(list[0].is_primary);
    }

    #[tokio::test]
    async fn notify_without_name_uses_primary() {
        let mgr = TransportManager::new();
        let (t1, mut h1) = FakeTransport::new("a");
        t1.connect().await.unwrap();
        mgr.add_transport("a", t1).await.unwrap();

        mgr.notify("ping", serde_json::json!({}), None).await.unwrap();
        let sent = h1.outbound_rx.recv().await.unwrap();
        assert!(sent.contains("ping"));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connected_transport() {
        let mgr = TransportManager::new();
        let (t1, mut h1) = FakeTransport::new("a");
        let (t2, mut h2) = FakeTransport::new("b");
        t1.connect().await.unwrap();
        t2.connect().await.unwrap();
        mgr.add_transport("a", t1).await.unwrap();
        mgr.add_transport("b", t2).await.unwrap();

        let results = mgr.broadcast("tick", serde_json::json!({})).await;
        assert_eq!(results.len(), 2);
        assert!(results["a"].is_ok());
        assert!(results["b"].is_ok());
        assert!(h1.outbound_rx.recv().await.unwrap().contains("tick"));
        assert!(h2.outbound_rx.recv().await.unwrap().contains("tick"));
    }

    #[tokio::test]
    async fn request_on_missing_transport_is_not_found() {
        let mgr = TransportManager::new();
        let err = mgr
            .request("x", serde_json::json!({}), Some("nope"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }
}
