//! `stdio-process` transport: spawns a subprocess and speaks JSON-RPC over
//! its stdin/stdout pipes.
//!
//! On connect, the process is given a brief settle interval; if it has
//! already exited by the time that interval elapses, the connect fails with
//! the process's accumulated stderr as diagnostic context (grounded on the
//! reference implementation's `ProcessStdioTransport.connect`, which does the
//! same 0.1s-settle-then-check-returncode dance). The child's environment is
//! the current process's environment merged with the caller's per-session
//! overrides -- an inherit+override contract, not an env wipe.

use crate::error::CoreError;
use crate::transport::{ConnectionState, JsonRpcCore, Transport};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex as AsyncMutex;

const SETTLE_INTERVAL: Duration = Duration::from_millis(100);
const STDERR_TAIL_LINES: usize = 200;
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct StdioProcessTransport {
    core: Arc<JsonRpcCore>,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    child: Arc<AsyncMutex<Option<Child>>>,
    stdin: Arc<AsyncMutex<Option<ChildStdin>>>,
    stderr_tail: Arc<AsyncMutex<VecDeque<String>>>,
}

impl StdioProcessTransport {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: JsonRpcCore::new(name),
            command: command.into(),
            args,
            env,
            cwd,
            child: Arc::new(AsyncMutex::new(None)),
            stdin: Arc::new(AsyncMutex::new(None)),
            stderr_tail: Arc::new(AsyncMutex::new(VecDeque::new())),
        })
    }

    async fn push_stderr_line(&self, line: String) {
        tracing::debug!(target: "transport::stdio_process", "{line}");
        let mut tail = self.stderr_tail.lock().await;
        tail.push_back(line);
        while tail.len() > STDERR_TAIL_LINES {
            tail.pop_front();
        }
    }

    async fn accumulated_stderr(&self) -> String {
        self.stderr_tail
            .lock()
            .await
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn stdout_loop(self, stdout: tokio::process::ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Err(e) = self.handle_incoming(&line).await {
                        tracing::warn!(transport = %self.core.name(), error = %e, "failed to handle inbound frame");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(transport = %self.core.name(), error = %e, "stdout read error");
                    break;
                }
            }
        }
        if self.core.state().await == ConnectionState::Connected {
            let _ = self.disconnect().await;
        }
    }

    async fn stderr_loop(self, stderr: tokio::process::ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            self.push_stderr_line(line).await;
        }
    }
}

#[async_trait::async_trait]
impl Transport for StdioProcessTransport {
    fn core(&self) -> &JsonRpcCore {
        &self.core
    }

    async fn connect(&self) -> Result<(), CoreError> {
        if self.core.state().await == ConnectionState::Connected {
            return Ok(());
        }
        self.core.set_state(ConnectionState::Connecting).await;

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.envs(&self.env); // inherit current env, then apply overrides
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            CoreError::Transport {
                transport: self.core.name().to_string(),
                message: format!("failed to spawn `{}`: {e}", self.command),
            }
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        *self.stdin.lock().await = stdin;
        *self.child.lock().await = Some(child);

        if let Some(stdout) = stdout {
            tokio::spawn(self.clone().stdout_loop(stdout));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(self.clone().stderr_loop(stderr));
        }

        tokio::time::sleep(SETTLE_INTERVAL).await;

        let exited = {
            let mut guard = self.child.lock().await;
            match guard.as_mut() {
                Some(child) => child.try_wait().ok().flatten(),
                None => None,
            }
        };

        if let Some(status) = exited {
            self.core.set_state(ConnectionState::Error).await;
            let stderr_text = self.accumulated_stderr().await;
            return Err(CoreError::Transport {
                transport: self.core.name().to_string(),
                message: format!(
                    "process exited immediately with {status}: {stderr_text}"
                ),
            });
        }

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
        self.core.cancel_all("transport disconnected").await;

        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if child.try_wait().ok().flatten().is_none() {
                #[cfg(unix)]
                if let Some(pid) = child.id() {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
                #[cfg(not(unix))]
                let _ = child.start_kill();

                if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, child.wait())
                    .await
                    .is_err()
                {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        drop(guard);

        self.core.mark_closed().await;
        Ok(())
    }

    async fn send_line(&self, line: String) -> Result<(), CoreError> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(CoreError::Transport {
                transport: self.core.name().to_string(),
                message: "process stdin unavailable (not connected)".to_string(),
            });
        };
        stdin.write_all(line.as_bytes()).await.map_err(CoreError::Io)?;
        stdin.write_all(b"\n").await.map_err(CoreError::Io)?;
        stdin.flush().await.map_err(CoreError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn connect_fails_for_nonexistent_executable() {
        let t = StdioProcessTransport::new(
            "t1",
            "/nonexistent/binary/does/not/exist",
            vec![],
            HashMap::new(),
            None,
        );
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, CoreError::Transport { .. }));
    }

    #[tokio::test]
    async fn echo_round_trip_via_cat() {
        let t = StdioProcessTransport::new("t2", "cat", vec![], HashMap::new(), None);
        if t.connect().await.is_err() {
            return; // `cat` unavailable in this environment
        }

        let core = t.core();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        core.register_handler(
            "ping".to_string(),
            Arc::new(move |_params| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                Box::pin(async { Ok(serde_json::json!({"pong": true})) })
            }),
        )
        .await;

        t.notify("ping", serde_json::json!({})).await.unwrap();
        let _ = tokio::time::timeout(StdDuration::from_secs(2), rx).await;

        t.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let t = StdioProcessTransport::new("t3", "cat", vec![], HashMap::new(), None);
        if t.connect().await.is_err() {
            return;
        }
        t.disconnect().await.unwrap();
        t.disconnect().await.unwrap();
        assert_eq!(t.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn settles_and_surfaces_stderr_on_immediate_exit() {
        let t = StdioProcessTransport::new(
            "t4",
            "sh",
            vec!["-c".into(), "echo boom 1>&2; exit 1".into()],
            HashMap::new(),
            None,
        );
        match t.connect().await {
            Err(CoreError::Transport { message, .. }) => assert!(message.contains("boom")),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(()) => {
                // Some platforms may race the settle window; tolerate but clean up.
                let _ = t.disconnect().await;
            }
        }
    }
}
