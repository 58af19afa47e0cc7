//! `stdio-self` transport: the host process's own stdin/stdout.
//!
//! Used when this server is itself embedded as a child of some other client
//! (the reverse of [`super::stdio_process`]): requests come in on our stdin,
//! responses and our own outbound requests go out on our stdout.

use crate::error::CoreError;
use crate::transport::{ConnectionState, JsonRpcCore, Transport};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct StdioSelfTransport {
    core: Arc<JsonRpcCore>,
    stdout: Arc<AsyncMutex<tokio::io::Stdout>>,
    shutdown: Arc<CancellationToken>,
}

impl StdioSelfTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            core: JsonRpcCore::new("stdio-self"),
            stdout: Arc::new(AsyncMutex::new(tokio::io::stdout())),
            shutdown: Arc::new(CancellationToken::new()),
        })
    }

    async fn read_loop(self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = lines.next_line() => {
                    match next {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            if let Err(e) = self.handle_incoming(&line).await {
                                tracing::warn!(transport = "stdio-self", error = %e, "failed to handle inbound frame");
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!(transport = "stdio-self", error = %e, "stdin read error");
                            break;
                        }
                    }
                }
            }
        }
        self.core.mark_closed().await;
    }
}

#[async_trait::async_trait]
impl Transport for StdioSelfTransport {
    fn core(&self) -> &JsonRpcCore {
        &self.core
    }

    async fn connect(&self) -> Result<(), CoreError> {
        if self.core.state().await == ConnectionState::Connected {
            return Ok(());
        }
        self.core.set_state(ConnectionState::Connecting).await;
        let this = self.clone();
        tokio::spawn(this.read_loop());
        self.core.mark_connected().await;
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
        let mut out = self.stdout.lock().await;
        out.write_all(line.as_bytes())
            .await
            .map_err(CoreError::Io)?;
        out.write_all(b"\n").await.map_err(CoreError::Io)?;
        out.flush().await.map_err(CoreError::Io)?;
        Ok(())
    }
}
