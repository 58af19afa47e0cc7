//! Spawns, supervises, and streams output from child processes.
//!
//! A session owns exactly one child process while `RUNNING`. Its stdout is
//! framed by a [`StreamBuffer`](crate::stream::buffer::StreamBuffer), decoded
//! line-by-line by a [`JsonlParser`](crate::stream::parser::JsonlParser), and
//! fanned out to subscribers over one bounded `mpsc` channel per subscriber --
//! the publisher does a non-blocking `try_send`; a subscriber that can't keep
//! up is dropped (and a `subscriber_dropped` lifecycle event is emitted)
//! rather than stalling the parser.

use crate::checkpoint::TimelineManager;
use crate::error::CoreError;
use crate::metrics::{LifecycleEvent, MetricsSink, NoopMetricsSink};
use crate::registry::ProcessRegistry;
use crate::stream::buffer::StreamBuffer;
use crate::stream::event::{StreamEvent, StreamEventKind};
use crate::stream::parser::JsonlParser;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex, Semaphore};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 1024;
const STREAM_BUFFER_MAX_SIZE: usize = 16 * 1024 * 1024;
const STREAM_BUFFER_MAX_LINE: usize = 1024 * 1024;
const GRACEFUL_CANCEL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_path: String,
    pub prompt: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub metadata: serde_json::Value,
}

/// Caller-supplied invocation parameters; unset fields fall back to
/// `SessionManager`'s configured defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionParams {
    pub project_path: String,
    pub prompt: String,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// How to invoke the child binary for a started session.
#[derive(Debug, Clone)]
pub struct ChildCommandTemplate {
    pub program: String,
    pub base_args: Vec<String>,
}

struct RunningProcess {
    child: Mutex<Child>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

struct Inner {
    sessions: HashMap<String, Session>,
    processes: HashMap<String, Arc<RunningProcess>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<Arc<StreamEvent>>>>,
    sequences: HashMap<String, Arc<AtomicU64>>,
    pending_metadata: HashMap<String, serde_json::Value>,
}

/// Supervises the full lifecycle of every session this server has created.
pub struct SessionManager {
    inner: Mutex<Inner>,
    registry: Arc<ProcessRegistry>,
    timeline: Option<Arc<TimelineManager>>,
    command: ChildCommandTemplate,
    concurrency: Arc<Semaphore>,
    default_model: String,
    default_temperature: f64,
    default_max_tokens: u32,
    metrics: Arc<dyn MetricsSink>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        timeline: Option<Arc<TimelineManager>>,
        command: ChildCommandTemplate,
        max_concurrent_sessions: usize,
    ) -> Arc<Self> {
        Self::new_with_metrics(registry, timeline, command, max_concurrent_sessions, Arc::new(NoopMetricsSink))
    }

    /// Like [`SessionManager::new`] but forwarding lifecycle events (session
    /// completion/failure, dropped subscribers) to `metrics` instead of
    /// discarding them.
    pub fn new_with_metrics(
        registry: Arc<ProcessRegistry>,
        timeline: Option<Arc<TimelineManager>>,
        command: ChildCommandTemplate,
        max_concurrent_sessions: usize,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                processes: HashMap::new(),
                subscribers: HashMap::new(),
                sequences: HashMap::new(),
                pending_metadata: HashMap::new(),
            }),
            registry,
            timeline,
            command,
            concurrency: Arc::new(Semaphore::new(max_concurrent_sessions)),
            default_model: "claude-3-opus".to_string(),
            default_temperature: 0.7,
            default_max_tokens: 4096,
            metrics,
        })
    }

    pub async fn create_session(&self, params: CreateSessionParams) -> Result<Session, CoreError> {
        let temperature = params.temperature.unwrap_or(self.default_temperature);
        if !(0.0..=1.0).contains(&temperature) {
            return Err(CoreError::Validation(format!("temperature {temperature} out of range [0, 1]")));
        }
        let max_tokens = params.max_tokens.unwrap_or(self.default_max_tokens);
        if max_tokens == 0 {
            return Err(CoreError::Validation("max_tokens must be > 0".to_string()));
        }

        let session = Session {
            id: ulid::Ulid::new().to_string(),
            project_path: params.project_path,
            prompt: params.prompt,
            model: params.model.unwrap_or_else(|| self.default_model.clone()),
            temperature,
            max_tokens,
            status: SessionStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            pid: None,
            exit_code: None,
            metadata: serde_json::json!({}),
        };

        let mut inner = self.inner.lock().await;
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<Session, CoreError> {
        self.inner
            .lock()
            .await
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::session_not_found(id))
    }

    /// Refuses if the concurrency cap is already saturated. Spawns the
    /// configured binary, wires its stdout through the buffer/parser
    /// pipeline, and installs the pid in the process registry.
    pub async fn start_session(self: &Arc<Self>, id: &str) -> Result<u32, CoreError> {
        let permit = self
            .concurrency
            .clone()
            .try_acquire_owned()
            .map_err(|_| CoreError::ResourceExhausted("session concurrency cap reached".to_string()))?;

        let mut session = self.get_session(id).await?;
        if session.status != SessionStatus::Created {
            return Err(CoreError::Conflict(format!("session {id} is not in CREATED state")));
        }

        let mut args = self.command.base_args.clone();
        args.push(session.prompt.clone());

        let mut child = Command::new(&self.command.program)
            .args(&args)
            .current_dir(&session.project_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| CoreError::Transport {
                transport: format!("session:{id}"),
                message: format!("failed to spawn child process: {e}"),
            })?;

        let pid = child.id().ok_or_else(|| CoreError::Internal("spawned child has no pid".to_string()))?;
        let stdout = child.stdout.take().expect("stdout piped");

        self.registry.register(
            pid,
            id,
            &session.project_path,
            &self.command.program,
            &args,
            &HashMap::new(),
        )?;

        session.status = SessionStatus::Running;
        session.started_at = Some(Utc::now());
        session.pid = Some(pid);

        let sequence = Arc::new(AtomicU64::new(0));

        {
            let mut inner = self.inner.lock().await;
            inner.sessions.insert(id.to_string(), session);
            inner.processes.insert(
                id.to_string(),
                Arc::new(RunningProcess { child: Mutex::new(child), _permit: permit }),
            );
            inner.subscribers.insert(id.to_string(), Vec::new());
            inner.sequences.insert(id.to_string(), sequence.clone());
        }

        let manager = self.clone();
        let session_id = id.to_string();
        tokio::spawn(async move {
            manager.stdout_loop(session_id, stdout, sequence).await;
        });

        Ok(pid)
    }

    async fn stdout_loop(
        self: Arc<Self>,
        session_id: String,
        stdout: tokio::process::ChildStdout,
        sequence: Arc<AtomicU64>,
    ) {
        let mut reader = BufReader::new(stdout);
        let mut buffer = StreamBuffer::new(STREAM_BUFFER_MAX_SIZE, STREAM_BUFFER_MAX_LINE);
        let mut parser = JsonlParser::new(false);
        let mut chunk = vec![0u8; 8192];

        loop {
            let n = match tokio::io::AsyncReadExt::read(&mut reader, &mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "stdout read failed");
                    break;
                }
            };

            if let Err(e) = buffer.ingest(&chunk[..n]) {
                tracing::error!(session = %session_id, error = %e, "stream buffer overflow, ending session");
                break;
            }

            for line in buffer.get_complete_lines() {
                self.dispatch_line(&session_id, &line, &sequence, &mut parser).await;
            }
        }

        for line in buffer.flush() {
            self.dispatch_line(&session_id, &line, &sequence, &mut parser).await;
        }

        let metadata = self.inner.lock().await.pending_metadata.remove(&session_id);
        let _ = self.complete_session(&session_id, metadata).await;
    }

    async fn dispatch_line(
        &self,
        session_id: &str,
        line: &str,
        sequence: &AtomicU64,
        parser: &mut JsonlParser,
    ) {
        let value = match parser.parse_line(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(session = %session_id, error = %e, "skipping malformed stdout line");
                return;
            }
        };

        let seq = sequence.fetch_add(1, Ordering::SeqCst);
        let event = Arc::new(StreamEvent::from_value(seq, value));

        if let Some(fields) = terminal_metadata(&event.kind) {
            let mut inner = self.inner.lock().await;
            merge_json_object(inner.pending_metadata.entry(session_id.to_string()).or_insert_with(|| serde_json::json!({})), fields);
        }

        self.publish(session_id, event.clone()).await;

        if let Some(timeline) = &self.timeline {
            let (event_type, tool_name) = stream_event_checkpoint_hint(&event);
            if timeline.should_create_checkpoint(session_id, event_type, tool_name.as_deref()).await {
                let content = serde_json::to_vec(&event.raw).unwrap_or_default();
                if let Err(e) = timeline
                    .create_checkpoint(session_id, None, Some("auto checkpoint"), None, None, &content)
                    .await
                {
                    tracing::warn!(session = %session_id, error = %e, "auto-checkpoint failed");
                }
            }
        }
    }

    /// Sends `event` to every live subscriber of `session_id` via a
    /// non-blocking `try_send`. A subscriber whose channel is full is
    /// dropped: a `subscriber_dropped` lifecycle event is emitted and its
    /// sender is removed, which closes the corresponding receiver once it
    /// has drained whatever was already buffered.
    async fn publish(&self, session_id: &str, event: Arc<StreamEvent>) {
        let mut inner = self.inner.lock().await;
        let Some(subs) = inner.subscribers.get_mut(session_id) else { return };
        if subs.is_empty() {
            return;
        }

        let mut dropped = false;
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                dropped = true;
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if dropped {
            self.metrics.emit(LifecycleEvent::SubscriberDropped { session_id: session_id.to_string() });
        }
    }

    /// Subscribe to this session's event stream from this point forward.
    /// The returned receiver closes once the session terminates, or earlier
    /// if the subscriber falls behind and is dropped. Late subscribers never
    /// see events emitted before they subscribed.
    pub async fn stream_output(&self, id: &str) -> Result<mpsc::Receiver<Arc<StreamEvent>>, CoreError> {
        let mut inner = self.inner.lock().await;
        let subs = inner.subscribers.get_mut(id).ok_or_else(|| CoreError::session_not_found(id))?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        subs.push(tx);
        Ok(rx)
    }

    pub async fn complete_session(&self, id: &str, metadata: Option<serde_json::Value>) -> Result<(), CoreError> {
        self.terminate(id, SessionStatus::Completed, metadata).await
    }

    pub async fn fail_session(&self, id: &str, error: impl Into<String>) -> Result<(), CoreError> {
        let metadata = serde_json::json!({"error": error.into()});
        let result = self.terminate(id, SessionStatus::Failed, Some(metadata)).await;
        if result.is_ok() {
            self.metrics.emit(LifecycleEvent::SessionFailed { session_id: id.to_string(), reason: "child process failed".to_string() });
        }
        result
    }

    async fn terminate(&self, id: &str, status: SessionStatus, metadata: Option<serde_json::Value>) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let session = inner.sessions.get_mut(id).ok_or_else(|| CoreError::session_not_found(id))?;
        if session.status.is_terminal() {
            return Ok(());
        }
        session.status = status;
        session.completed_at = Some(Utc::now());
        if let Some(metadata) = metadata {
            merge_json_object(&mut session.metadata, metadata);
        }
        let pid = session.pid;
        inner.pending_metadata.remove(id);
        drop(inner);

        if let Some(pid) = pid {
            let _ = self.registry.update_status(pid, crate::registry::ProcessStatus::Terminated);
        }
        self.inner.lock().await.subscribers.remove(id);
        self.inner.lock().await.processes.remove(id);

        if status == SessionStatus::Completed {
            self.metrics.emit(LifecycleEvent::SessionCompleted { session_id: id.to_string() });
        }
        Ok(())
    }

    /// Polite-then-forceful shutdown of a running session's child process.
    /// Idempotent: cancelling a terminal session is a no-op returning
    /// `false`.
    pub async fn cancel_session(&self, id: &str) -> Result<bool, CoreError> {
        let already_terminal = {
            let inner = self.inner.lock().await;
            inner
                .sessions
                .get(id)
                .map(|s| s.status.is_terminal())
                .ok_or_else(|| CoreError::session_not_found(id))?
        };
        if already_terminal {
            return Ok(false);
        }

        let process = self.inner.lock().await.processes.get(id).cloned();
        if let Some(process) = process {
            let mut child = process.child.lock().await;
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            }
            let wait = tokio::time::timeout(GRACEFUL_CANCEL_TIMEOUT, child.wait()).await;
            if wait.is_err() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        self.terminate(id, SessionStatus::Cancelled, None).await?;
        Ok(true)
    }

    pub async fn active_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Running)
            .count()
    }
}

/// Extracts terminal-event fields (e.g. token usage reported on session end)
/// that should be merged into the session's final metadata.
fn terminal_metadata(kind: &StreamEventKind) -> Option<serde_json::Value> {
    match kind {
        StreamEventKind::SessionEnd { tokens_used } => Some(serde_json::json!({ "tokens_used": tokens_used })),
        _ => None,
    }
}

fn merge_json_object(base: &mut serde_json::Value, extra: serde_json::Value) {
    if let (serde_json::Value::Object(base_map), serde_json::Value::Object(extra_map)) = (&mut *base, &extra) {
        for (k, v) in extra_map {
            base_map.insert(k.clone(), v.clone());
        }
    } else {
        *base = extra;
    }
}

fn stream_event_checkpoint_hint(event: &StreamEvent) -> (&'static str, Option<String>) {
    match &event.kind {
        StreamEventKind::ToolUse { tool_name, .. } => ("tool_executed", tool_name.clone()),
        _ => ("other", None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;

    fn manager() -> (Arc<SessionManager>, tempfile::TempDir) {
        let dir = temp_dir();
        let registry = Arc::new(ProcessRegistry::new(dir.path().join("registry.db")).unwrap());
        let command = ChildCommandTemplate { program: "cat".to_string(), base_args: vec![] };
        (SessionManager::new(registry, None, command, 2), dir)
    }

    #[tokio::test]
    async fn create_session_validates_temperature() {
        let (mgr, _dir) = manager();
        let err = mgr
            .create_session(CreateSessionParams {
                project_path: "/tmp".into(),
                prompt: "hi".into(),
                temperature: Some(2.0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn create_session_validates_max_tokens() {
        let (mgr, _dir) = manager();
        let err = mgr
            .create_session(CreateSessionParams {
                project_path: "/tmp".into(),
                prompt: "hi".into(),
                max_tokens: Some(0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn create_session_defaults_status_to_created() {
        let (mgr, _dir) = manager();
        let session = mgr
            .create_session(CreateSessionParams {
                project_path: "/tmp".into(),
                prompt: "hi".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Created);
    }

    #[tokio::test]
    async fn cancel_on_terminal_session_is_a_noop() {
        let (mgr, _dir) = manager();
        let session = mgr
            .create_session(CreateSessionParams {
                project_path: "/tmp".into(),
                prompt: "hi".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        mgr.fail_session(&session.id, "boom").await.unwrap();
        let cancelled = mgr.cancel_session(&session.id).await.unwrap();
        assert!(!cancelled);
    }

    #[tokio::test]
    async fn concurrency_cap_rejects_extra_starts() {
        let (mgr, _dir) = manager();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let session = mgr
                .create_session(CreateSessionParams {
                    project_path: ".".into(),
                    prompt: "".into(),
                    ..Default::default()
                })
                .await
                .unwrap();
            ids.push(session.id);
        }

        mgr.start_session(&ids[0]).await.unwrap();
        mgr.start_session(&ids[1]).await.unwrap();
        let err = mgr.start_session(&ids[2]).await.unwrap_err();
        assert!(matches!(err, CoreError::ResourceExhausted(_)));

        mgr.cancel_session(&ids[0]).await.unwrap();
        mgr.cancel_session(&ids[1]).await.unwrap();
    }

    #[tokio::test]
    async fn session_end_tokens_used_merges_into_completed_metadata() {
        let (mgr, _dir) = manager();
        let session = mgr
            .create_session(CreateSessionParams {
                project_path: "/tmp".into(),
                prompt: "hi".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut sequence_src = AtomicU64::new(0);
        let mut parser = JsonlParser::new(false);
        mgr.dispatch_line(
            &session.id,
            r#"{"type":"session_complete","tokens_used":5}"#,
            &mut sequence_src,
            &mut parser,
        )
        .await;

        let metadata = mgr.inner.lock().await.pending_metadata.get(&session.id).cloned();
        mgr.complete_session(&session.id, metadata).await.unwrap();

        let completed = mgr.get_session(&session.id).await.unwrap();
        assert_eq!(completed.metadata["tokens_used"], 5);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_on_backpressure() {
        let (mgr, _dir) = manager();
        let session = mgr
            .create_session(CreateSessionParams {
                project_path: "/tmp".into(),
                prompt: "hi".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        {
            let mut inner = mgr.inner.lock().await;
            inner.subscribers.insert(session.id.clone(), Vec::new());
            inner.sequences.insert(session.id.clone(), Arc::new(AtomicU64::new(0)));
        }
        let mut rx = mgr.stream_output(&session.id).await.unwrap();

        let sequence = AtomicU64::new(0);
        let mut parser = JsonlParser::new(false);
        for i in 0..(SUBSCRIBER_CHANNEL_CAPACITY + 10) {
            mgr.dispatch_line(&session.id, &format!(r#"{{"type":"tool_use","tool_name":"t{i}"}}"#), &sequence, &mut parser).await;
        }

        assert!(mgr.inner.lock().await.subscribers.get(&session.id).unwrap().is_empty());

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= SUBSCRIBER_CHANNEL_CAPACITY);
    }
}
