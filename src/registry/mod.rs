//! Durable, cross-host catalog of live child processes.
//!
//! Backed by a single SQLite file so multiple instances of this server on
//! the same host (or sharing a mounted data directory across hosts) see a
//! consistent view of what is actually running. Every write commits before
//! the call returns -- there is no in-memory cache to go stale.

use crate::error::CoreError;
use crate::metrics::{LifecycleEvent, MetricsSink, NoopMetricsSink};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lifecycle state of a registered process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessStatus {
    Running,
    Terminated,
    Zombie,
    Stale,
}

impl ProcessStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Terminated => "TERMINATED",
            ProcessStatus::Zombie => "ZOMBIE",
            ProcessStatus::Stale => "STALE",
        }
    }

    fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "RUNNING" => Ok(ProcessStatus::Running),
            "TERMINATED" => Ok(ProcessStatus::Terminated),
            "ZOMBIE" => Ok(ProcessStatus::Zombie),
            "STALE" => Ok(ProcessStatus::Stale),
            other => Err(CoreError::Internal(format!("unknown process status {other:?}"))),
        }
    }
}

/// One row of the process catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub session_id: String,
    pub project_path: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: std::collections::HashMap<String, String>,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub cpu_percent: Option<f64>,
    pub rss_mb: Option<f64>,
    pub open_files: Option<u32>,
    pub threads: Option<u32>,
}

/// A pending inter-session message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: i64,
    pub from_session: String,
    pub to_session: String,
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub delivered: bool,
}

/// Embedded-SQLite-backed process catalog plus inter-session mailbox.
pub struct ProcessRegistry {
    db_path: PathBuf,
    host: String,
    metrics: Arc<dyn MetricsSink>,
}

impl ProcessRegistry {
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        Self::new_with_metrics(db_path, Arc::new(NoopMetricsSink))
    }

    /// Like [`ProcessRegistry::new`] but forwarding lifecycle events (e.g. a
    /// stale row reaped by [`cleanup`](Self::cleanup)) to `metrics`.
    pub fn new_with_metrics(db_path: impl Into<PathBuf>, metrics: Arc<dyn MetricsSink>) -> Result<Self, CoreError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let host = hostname();
        let registry = Self { db_path, host, metrics };
        registry.init()?;
        Ok(registry)
    }

    fn conn(&self) -> Result<Connection, CoreError> {
        Connection::open(&self.db_path).map_err(CoreError::Storage)
    }

    fn init(&self) -> Result<(), CoreError> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS processes (
                pid INTEGER NOT NULL,
                host TEXT NOT NULL,
                session_id TEXT NOT NULL,
                project_path TEXT NOT NULL,
                command TEXT NOT NULL,
                args TEXT NOT NULL,
                env TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                port INTEGER,
                user TEXT NOT NULL,
                cpu_percent REAL,
                rss_mb REAL,
                open_files INTEGER,
                threads INTEGER,
                PRIMARY KEY (pid, host)
            )",
            [],
        )
        .map_err(CoreError::Storage)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_processes_session ON processes(session_id)",
            [],
        )
        .map_err(CoreError::Storage)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS mailbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_session TEXT NOT NULL,
                to_session TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                delivered INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .map_err(CoreError::Storage)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_mailbox_to ON mailbox(to_session, delivered)",
            [],
        )
        .map_err(CoreError::Storage)?;
        Ok(())
    }

    /// Insert or replace a process row, set `RUNNING`, and stamp
    /// `started_at`/`last_seen` as now.
    pub fn register(
        &self,
        pid: u32,
        session_id: &str,
        project_path: &str,
        command: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
    ) -> Result<(), CoreError> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let args_json = serde_json::to_string(args)?;
        let env_json = serde_json::to_string(env)?;
        let user = current_user();
        conn.execute(
            "INSERT OR REPLACE INTO processes
                (pid, host, session_id, project_path, command, args, env, status, started_at, last_seen, port, user, cpu_percent, rss_mb, open_files, threads)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, NULL, ?10, NULL, NULL, NULL, NULL)",
            params![
                pid,
                self.host,
                session_id,
                project_path,
                command,
                args_json,
                env_json,
                ProcessStatus::Running.as_str(),
                now,
                user,
            ],
        )
        .map_err(CoreError::Storage)?;
        Ok(())
    }

    /// Advance `last_seen`; if `status` is terminal, this is the exit time.
    pub fn update_status(&self, pid: u32, status: ProcessStatus) -> Result<(), CoreError> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let changed = conn
            .execute(
                "UPDATE processes SET status = ?1, last_seen = ?2 WHERE pid = ?3 AND host = ?4",
                params![status.as_str(), now, pid, self.host],
            )
            .map_err(CoreError::Storage)?;
        if changed == 0 {
            return Err(CoreError::NotFound { kind: "process", id: pid.to_string() });
        }
        Ok(())
    }

    /// Advance `last_seen` without changing status. Intended to be called by
    /// a background liveness loop.
    pub fn heartbeat(&self, pid: u32) -> Result<(), CoreError> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE processes SET last_seen = ?1 WHERE pid = ?2 AND host = ?3",
            params![now, pid, self.host],
        )
        .map_err(CoreError::Storage)?;
        Ok(())
    }

    /// Record a liveness probe's resource readings for `pid`.
    pub fn record_resource_stats(
        &self,
        pid: u32,
        cpu_percent: f64,
        rss_mb: f64,
        open_files: u32,
        threads: u32,
    ) -> Result<(), CoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE processes SET cpu_percent = ?1, rss_mb = ?2, open_files = ?3, threads = ?4
             WHERE pid = ?5 AND host = ?6",
            params![cpu_percent, rss_mb, open_files, threads, pid, self.host],
        )
        .map_err(CoreError::Storage)?;
        Ok(())
    }

    pub fn get_process(&self, pid: u32) -> Result<Option<ProcessEntry>, CoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT pid, host, session_id, project_path, command, args, env, status, started_at, last_seen, port, user, cpu_percent, rss_mb, open_files, threads
             FROM processes WHERE pid = ?1 AND host = ?2",
            params![pid, self.host],
            row_to_entry,
        )
        .optional()
        .map_err(CoreError::Storage)
    }

    pub fn get_by_session(&self, session_id: &str) -> Result<Vec<ProcessEntry>, CoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT pid, host, session_id, project_path, command, args, env, status, started_at, last_seen, port, user, cpu_percent, rss_mb, open_files, threads
             FROM processes WHERE session_id = ?1",
        )
        .map_err(CoreError::Storage)?;
        let rows = stmt
            .query_map(params![session_id], row_to_entry)
            .map_err(CoreError::Storage)?;
        collect(rows)
    }

    pub fn get_by_status(&self, status: ProcessStatus) -> Result<Vec<ProcessEntry>, CoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT pid, host, session_id, project_path, command, args, env, status, started_at, last_seen, port, user, cpu_percent, rss_mb, open_files, threads
             FROM processes WHERE status = ?1",
        )
        .map_err(CoreError::Storage)?;
        let rows = stmt
            .query_map(params![status.as_str()], row_to_entry)
            .map_err(CoreError::Storage)?;
        collect(rows)
    }

    pub fn get_active(&self) -> Result<Vec<ProcessEntry>, CoreError> {
        self.get_by_status(ProcessStatus::Running)
    }

    pub fn count(&self) -> Result<u64, CoreError> {
        let conn = self.conn()?;
        conn.query_row("SELECT COUNT(*) FROM processes", [], |row| row.get(0))
            .map_err(CoreError::Storage)
    }

    /// Rows whose `last_seen` predates `threshold_minutes` and whose `pid`
    /// is not a live OS process.
    pub fn get_stale(&self, threshold_minutes: i64) -> Result<Vec<ProcessEntry>, CoreError> {
        let cutoff = (Utc::now() - chrono::Duration::minutes(threshold_minutes)).to_rfc3339();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT pid, host, session_id, project_path, command, args, env, status, started_at, last_seen, port, user, cpu_percent, rss_mb, open_files, threads
             FROM processes WHERE last_seen < ?1 AND status != ?2",
        )
        .map_err(CoreError::Storage)?;
        let rows = stmt
            .query_map(params![cutoff, ProcessStatus::Terminated.as_str()], row_to_entry)
            .map_err(CoreError::Storage)?;
        let candidates = collect(rows)?;
        Ok(candidates.into_iter().filter(|e| !is_process_alive(e.pid)).collect())
    }

    /// Unlink every stale row from the registry (does not signal the OS
    /// process -- callers that own the process do that separately). Returns
    /// the number of rows removed.
    pub fn cleanup(&self, threshold_minutes: i64) -> Result<u64, CoreError> {
        let stale = self.get_stale(threshold_minutes)?;
        let conn = self.conn()?;
        let mut removed = 0u64;
        for entry in &stale {
            let changed = conn
                .execute(
                    "DELETE FROM processes WHERE pid = ?1 AND host = ?2",
                    params![entry.pid, self.host],
                )
                .map_err(CoreError::Storage)?;
            removed += changed as u64;
            if changed > 0 {
                self.metrics.emit(LifecycleEvent::ProcessReaped { pid: entry.pid, host: entry.host.clone() });
            }
        }
        Ok(removed)
    }

    /// Append an inter-session message with an optional TTL.
    pub fn send_message(
        &self,
        from_session: &str,
        to_session: &str,
        body: serde_json::Value,
        ttl: Option<chrono::Duration>,
    ) -> Result<(), CoreError> {
        let conn = self.conn()?;
        let now = Utc::now();
        let expires_at = ttl.map(|d| (now + d).to_rfc3339());
        let body_json = serde_json::to_string(&body)?;
        conn.execute(
            "INSERT INTO mailbox (from_session, to_session, body, created_at, expires_at, delivered)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![from_session, to_session, body_json, now.to_rfc3339(), expires_at],
        )
        .map_err(CoreError::Storage)?;
        Ok(())
    }

    /// Undelivered, unexpired messages for `session_id`; marks them
    /// delivered as a side effect.
    pub fn get_messages(&self, session_id: &str) -> Result<Vec<Mailbox>, CoreError> {
        let mut conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let tx = conn.transaction().map_err(CoreError::Storage)?;

        let messages = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, from_session, to_session, body, created_at, expires_at, delivered
                     FROM mailbox
                     WHERE to_session = ?1 AND delivered = 0 AND (expires_at IS NULL OR expires_at > ?2)",
                )
                .map_err(CoreError::Storage)?;
            let rows = stmt
                .query_map(params![session_id, now], row_to_mailbox)
                .map_err(CoreError::Storage)?;
            collect(rows)?
        };

        for m in &messages {
            tx.execute("UPDATE mailbox SET delivered = 1 WHERE id = ?1", params![m.id])
                .map_err(CoreError::Storage)?;
        }
        tx.commit().map_err(CoreError::Storage)?;
        Ok(messages)
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<ProcessEntry> {
    let args_json: String = row.get(5)?;
    let env_json: String = row.get(6)?;
    let status: String = row.get(7)?;
    let started_at: String = row.get(8)?;
    let last_seen: String = row.get(9)?;

    Ok(ProcessEntry {
        pid: row.get(0)?,
        host: row.get(1)?,
        session_id: row.get(2)?,
        project_path: row.get(3)?,
        command: row.get(4)?,
        args: serde_json::from_str(&args_json).unwrap_or_default(),
        env: serde_json::from_str(&env_json).unwrap_or_default(),
        status: ProcessStatus::parse(&status).unwrap_or(ProcessStatus::Running),
        started_at: DateTime::parse_from_rfc3339(&started_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        last_seen: DateTime::parse_from_rfc3339(&last_seen)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        port: row.get(10)?,
        user: row.get(11)?,
        cpu_percent: row.get(12)?,
        rss_mb: row.get(13)?,
        open_files: row.get(14)?,
        threads: row.get(15)?,
    })
}

fn row_to_mailbox(row: &rusqlite::Row) -> rusqlite::Result<Mailbox> {
    let body_json: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let expires_at: Option<String> = row.get(5)?;
    let delivered: i64 = row.get(6)?;

    Ok(Mailbox {
        id: row.get(0)?,
        from_session: row.get(1)?,
        to_session: row.get(2)?,
        body: serde_json::from_str(&body_json).unwrap_or(serde_json::Value::Null),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        expires_at: expires_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
        delivered: delivered != 0,
    })
}

fn collect<T>(rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row) -> rusqlite::Result<T>>) -> Result<Vec<T>, CoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(CoreError::Storage)?);
    }
    Ok(out)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Best-effort liveness check. On Unix, `kill(pid, 0)` probes for existence
/// without sending a signal; anything else is treated as alive to avoid
/// false-positive reaping.
#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

/// Registry-wide paths derived from a base storage directory.
pub fn default_db_path(storage_root: impl AsRef<Path>) -> PathBuf {
    storage_root.as_ref().join("registry.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;
    use std::collections::HashMap;

    fn registry() -> (ProcessRegistry, tempfile::TempDir) {
        let dir = temp_dir();
        let reg = ProcessRegistry::new(dir.path().join("registry.db")).unwrap();
        (reg, dir)
    }

    #[test]
    fn register_then_get_round_trips() {
        let (reg, _dir) = registry();
        reg.register(1234, "s1", "/proj", "claude", &["--session".into(), "s1".into()], &HashMap::new())
            .unwrap();
        let entry = reg.get_process(1234).unwrap().unwrap();
        assert_eq!(entry.session_id, "s1");
        assert_eq!(entry.status, ProcessStatus::Running);
    }

    #[test]
    fn update_status_on_unknown_pid_is_not_found() {
        let (reg, _dir) = registry();
        let err = reg.update_status(9999, ProcessStatus::Terminated).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn get_by_status_filters_correctly() {
        let (reg, _dir) = registry();
        reg.register(1, "s1", "/p", "claude", &[], &HashMap::new()).unwrap();
        reg.register(2, "s2", "/p", "claude", &[], &HashMap::new()).unwrap();
        reg.update_status(2, ProcessStatus::Terminated).unwrap();

        assert_eq!(reg.get_active().unwrap().len(), 1);
        assert_eq!(reg.get_by_status(ProcessStatus::Terminated).unwrap().len(), 1);
    }

    #[test]
    fn stale_rows_require_both_old_last_seen_and_a_dead_pid() {
        let (reg, _dir) = registry();
        // Use a pid astronomically unlikely to exist on the test host.
        reg.register(999_999, "s1", "/p", "claude", &[], &HashMap::new()).unwrap();
        let conn = reg.conn().unwrap();
        conn.execute(
            "UPDATE processes SET last_seen = ?1 WHERE pid = 999999",
            params!["2000-01-01T00:00:00Z"],
        )
        .unwrap();

        let stale = reg.get_stale(60).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].pid, 999_999);
    }

    #[test]
    fn cleanup_removes_stale_rows() {
        let (reg, _dir) = registry();
        reg.register(999_998, "s1", "/p", "claude", &[], &HashMap::new()).unwrap();
        let conn = reg.conn().unwrap();
        conn.execute(
            "UPDATE processes SET last_seen = ?1 WHERE pid = 999998",
            params!["2000-01-01T00:00:00Z"],
        )
        .unwrap();

        let removed = reg.cleanup(60).unwrap();
        assert_eq!(removed, 1);
        assert!(reg.get_process(999_998).unwrap().is_none());
    }

    #[test]
    fn cleanup_emits_a_lifecycle_event_per_reaped_row() {
        let dir = temp_dir();
        let (sink, mut rx) = crate::metrics::ChannelMetricsSink::new(4);
        let reg = ProcessRegistry::new_with_metrics(dir.path().join("registry.db"), sink).unwrap();
        reg.register(999_997, "s1", "/p", "claude", &[], &HashMap::new()).unwrap();
        let conn = reg.conn().unwrap();
        conn.execute(
            "UPDATE processes SET last_seen = ?1 WHERE pid = 999997",
            params!["2000-01-01T00:00:00Z"],
        )
        .unwrap();

        reg.cleanup(60).unwrap();

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, LifecycleEvent::ProcessReaped { pid: 999_997, .. }));
    }

    #[test]
    fn mailbox_round_trips_and_marks_delivered() {
        let (reg, _dir) = registry();
        reg.send_message("s1", "s2", serde_json::json!({"hello": true}), None).unwrap();

        let msgs = reg.get_messages("s2").unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body["hello"], true);

        // Already marked delivered -- a second fetch sees nothing.
        assert!(reg.get_messages("s2").unwrap().is_empty());
    }

    #[test]
    fn expired_messages_are_not_returned() {
        let (reg, _dir) = registry();
        reg.send_message("s1", "s2", serde_json::json!({}), Some(chrono::Duration::seconds(-1)))
            .unwrap();
        assert!(reg.get_messages("s2").unwrap().is_empty());
    }
}
