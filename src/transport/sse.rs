//! `sse` transport: a persistent `GET` carries inbound events framed as
//! Server-Sent Events; outbound requests go out as sibling HTTP `POST`s.
//!
//! Grounded on the reference implementation's `SSETransport`: `data:` lines
//! are JSON messages, `event:` lines are logged only, `retry:` lines update
//! the base reconnect delay used by subsequent backoff computations. A
//! connection drop reconnects with exponential backoff up to
//! `max_reconnect_attempts`, resetting the attempt counter on every
//! successful (re)connect.

use crate::error::CoreError;
use crate::transport::{ConnectionState, JsonRpcCore, Transport};
use futures::StreamExt;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

const INITIAL_CONNECT_SETTLE: Duration = Duration::from_millis(500);
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

#[derive(Clone)]
pub struct SseTransport {
    core: Arc<JsonRpcCore>,
    base_url: String,
    endpoint: String,
    headers: HashMap<String, String>,
    client: Client,
    reconnect_delay_ms: Arc<AtomicU64>,
    reconnect_attempts: Arc<AtomicU32>,
    max_reconnect_attempts: u32,
    shutdown: Arc<CancellationToken>,
    write_lock: Arc<AsyncMutex<()>>,
}

impl SseTransport {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        endpoint: impl Into<String>,
        headers: HashMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Arc<Self>, CoreError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(CoreError::Http)?;
        Ok(Arc::new(Self {
            core: JsonRpcCore::new(name),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            endpoint: endpoint.into(),
            headers,
            client,
            reconnect_delay_ms: Arc::new(AtomicU64::new(DEFAULT_RECONNECT_DELAY_MS)),
            reconnect_attempts: Arc::new(AtomicU32::new(0)),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            shutdown: Arc::new(CancellationToken::new()),
            write_lock: Arc::new(AsyncMutex::new(())),
        }))
    }

    fn stream_url(&self) -> String {
        format!("{}{}", self.base_url, self.endpoint)
    }

    fn message_url(&self) -> String {
        format!("{}/mcp/message", self.base_url)
    }

    fn build_request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder;
        for (k, v) in &self.headers {
            builder = builder.header(k, v);
        }
        builder
    }

    async fn sse_loop(self) {
        while matches!(
            self.core.state().await,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            if self.shutdown.is_cancelled() {
                break;
            }

            let request = self.build_request(self.client.get(self.stream_url()));
            let response = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = request.send() => r,
            };

            match response {
                Ok(resp) if resp.status().is_success() => {
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    if self.core.state().await == ConnectionState::Connecting {
                        self.core.mark_connected().await;
                    } else {
                        self.core.set_state(ConnectionState::Connected).await;
                    }

                    let mut byte_stream = resp.bytes_stream();
                    let mut carry = String::new();
                    loop {
                        let chunk = tokio::select! {
                            _ = self.shutdown.cancelled() => None,
                            c = byte_stream.next() => c,
                        };
                        match chunk {
                            Some(Ok(bytes)) => {
                                carry.push_str(&String::from_utf8_lossy(&bytes));
                                while let Some(idx) = carry.find('\n') {
                                    let line = carry[..idx].trim_end_matches('\r').to_string();
                                    carry.drain(..=idx);
                                    self.handle_sse_line(&line).await;
                                }
                            }
                            Some(Err(e)) => {
                                tracing::error!(transport = %self.core.name(), error = %e, "SSE stream error");
                                break;
                            }
                            None => break,
                        }
                        if self.core.state().await != ConnectionState::Connected {
                            break;
                        }
                    }
                }
                Ok(resp) => {
                    tracing::error!(transport = %self.core.name(), status = %resp.status(), "SSE endpoint returned error status");
                }
                Err(e) => {
                    tracing::error!(transport = %self.core.name(), error = %e, "failed to open SSE stream");
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.max_reconnect_attempts {
                tracing::error!(transport = %self.core.name(), "max reconnection attempts reached");
                self.core.set_state(ConnectionState::Error).await;
                break;
            }
            self.core.set_state(ConnectionState::Reconnecting).await;
            let base = self.reconnect_delay_ms.load(Ordering::SeqCst);
            let delay = Duration::from_millis(base.saturating_mul(1u64 << (attempt - 1).min(16)));
            tracing::info!(transport = %self.core.name(), attempt, delay_ms = delay.as_millis() as u64, "reconnecting SSE stream");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn handle_sse_line(&self, line: &str) {
        if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
            match serde_json::from_str::<serde_json::Value>(data.trim()) {
                Ok(_) => {
                    if let Err(e) = self.handle_incoming(data.trim()).await {
                        tracing::warn!(transport = %self.core.name(), error = %e, "failed to handle inbound SSE frame");
                    }
                }
                Err(e) => tracing::error!(transport = %self.core.name(), error = %e, "invalid JSON in SSE event"),
            }
        } else if let Some(event_type) = line.strip_prefix("event: ").or_else(|| line.strip_prefix("event:")) {
            tracing::debug!(transport = %self.core.name(), event_type, "SSE event type");
        } else if let Some(retry) = line.strip_prefix("retry: ").or_else(|| line.strip_prefix("retry:")) {
            if let Ok(ms) = retry.trim().parse::<u64>() {
                self.reconnect_delay_ms.store(ms, Ordering::SeqCst);
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for SseTransport {
    fn core(&self) -> &JsonRpcCore {
        &self.core
    }

    async fn connect(&self) -> Result<(), CoreError> {
        if self.core.state().await == ConnectionState::Connected {
            return Ok(());
        }
        self.core.set_state(ConnectionState::Connecting).await;
        self.reconnect_attempts.store(0, Ordering::SeqCst);

        let this = self.clone();
        tokio::spawn(this.sse_loop());

        tokio::time::sleep(INITIAL_CONNECT_SETTLE).await;

        if self.core.state().await == ConnectionState::Error {
            return Err(CoreError::Transport {
                transport: self.core.name().to_string(),
                message: "SSE stream failed to establish".to_string(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CoreError> {
        if matches!(
            self.core.state().await,
            ConnectionState::Disconnected | ConnectionState::Closed
        ) {
            return Ok(());
        }
        self.core.set_state(ConnectionState::Closing).await;
        self.shutdown.cancel();
        self.core.cancel_all("transport disconnected").await;
        self.core.mark_closed().await;
        Ok(())
    }

    async fn send_line(&self, line: String) -> Result<(), CoreError> {
        let _guard = self.write_lock.lock().await;
        let value: serde_json::Value = serde_json::from_str(&line)?;
        let request = self.build_request(self.client.post(self.message_url()).json(&value));
        let response = request.send().await.map_err(CoreError::Http)?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::Transport {
                transport: self.core.name().to_string(),
                message: format!("HTTP {status}: {text}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_times_out_against_unreachable_host() {
        let t = SseTransport::new(
            "sse-test",
            "http://127.0.0.1:1",
            "/mcp/sse",
            HashMap::new(),
            Duration::from_millis(200),
        )
        .unwrap();
        let _ = t.connect().await;
        t.disconnect().await.unwrap();
    }

    #[test]
    fn strips_sse_field_prefixes() {
        assert_eq!("data: {}".strip_prefix("data: "), Some("{}"));
        assert_eq!("retry: 500".strip_prefix("retry: "), Some("500"));
    }
}
