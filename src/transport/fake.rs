//! In-process fake transport for tests.
//!
//! Wires a [`FakeTransport`] into code under test and drives it from a
//! [`FakeTransportHandle`]: read what was sent via `handle.outbound_rx`,
//! inject inbound frames via `handle.inbound_tx` (they go straight through
//! `handle_incoming`, so registered handlers and pending requests see them
//! exactly as a real transport's read loop would deliver them).

use crate::error::CoreError;
use crate::transport::{ConnectionState, JsonRpcCore, Transport};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct FakeTransport {
    core: Arc<JsonRpcCore>,
    outbound_tx: mpsc::UnboundedSender<String>,
    shutdown: Arc<CancellationToken>,
}

pub struct FakeTransportHandle {
    pub outbound_rx: mpsc::UnboundedReceiver<String>,
    pub inbound_tx: mpsc::UnboundedSender<String>,
}

impl FakeTransport {
    pub fn new(name: impl Into<String>) -> (Arc<Self>, FakeTransportHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            core: JsonRpcCore::new(name),
            outbound_tx,
            shutdown: Arc::new(CancellationToken::new()),
        });

        let reader = transport.clone();
        tokio::spawn(reader.inbound_loop(inbound_rx));

        (transport, FakeTransportHandle { outbound_rx, inbound_tx })
    }

    /// Inject a decoded value as though it arrived over the wire.
    pub async fn inject(&self, value: serde_json::Value) {
        let line = serde_json::to_string(&value).expect("Value always serializes");
        if let Err(e) = self.handle_incoming(&line).await {
            tracing::warn!(transport = %self.core.name(), error = %e, "fake transport failed to handle injected frame");
        }
    }

    async fn inbound_loop(self: Arc<Self>, mut inbound_rx: mpsc::UnboundedReceiver<String>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                line = inbound_rx.recv() => {
                    match line {
                        Some(line) => {
                            if let Err(e) = self.handle_incoming(&line).await {
                                tracing::warn!(transport = %self.core.name(), error = %e, "fake transport failed to handle inbound frame");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    fn core(&self) -> &JsonRpcCore {
        &self.core
    }

    async fn connect(&self) -> Result<(), CoreError> {
        self.core.mark_connected().await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CoreError> {
        if self.core.state().await == ConnectionState::Closed {
            return Ok(());
        }
        self.shutdown.cancel();
        self.core.cancel_all("transport disconnected").await;
        self.core.mark_closed().await;
        Ok(())
    }

    async fn send_line(&self, line: String) -> Result<(), CoreError> {
        self.outbound_tx.send(line).map_err(|e| CoreError::Transport {
            transport: self.core.name().to_string(),
            message: format!("outbound channel closed: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn connect_marks_connected() {
        let (t, _handle) = FakeTransport::new("fake");
        t.connect().await.unwrap();
        assert_eq!(t.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn notify_delivers_to_outbound_rx() {
        let (t, mut handle) = FakeTransport::new("fake");
        t.connect().await.unwrap();
        t.notify("ping", serde_json::json!({})).await.unwrap();
        let sent = tokio::time::timeout(Duration::from_secs(1), handle.outbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(sent.contains("ping"));
    }

    #[tokio::test]
    async fn request_resolves_on_injected_response() {
        let (t, _handle) = FakeTransport::new("fake");
        t.connect().await.unwrap();

        let t2 = t.clone();
        let call = tokio::spawn(async move {
            t2.request("echo", serde_json::json!({"x": 1}), Some(Duration::from_secs(2)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        t.inject(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}}))
            .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn inbound_tx_frames_reach_registered_handlers() {
        let (t, handle) = FakeTransport::new("fake");
        t.connect().await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        t.on_message(
            "greet".to_string(),
            Arc::new(move |params| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(params);
                }
                Box::pin(async { Ok(serde_json::json!({})) })
            }),
        )
        .await;

        handle
            .inbound_tx
            .send(r#"{"jsonrpc":"2.0","method":"greet","params":{"name":"a"}}"#.to_string())
            .unwrap();

        let params = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert_eq!(params["name"], "a");
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (t, _handle) = FakeTransport::new("fake");
        t.connect().await.unwrap();
        t.disconnect().await.unwrap();
        t.disconnect().await.unwrap();
        assert_eq!(t.state().await, ConnectionState::Closed);
    }
}
