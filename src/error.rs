//! Error taxonomy for the session-orchestration core
//!
//! One variant per error *kind*, matching the taxonomy table in the design
//! document's error handling section. Call sites that need to match on a
//! specific kind use [`CoreError`] directly; call sites that just need to
//! propagate with added context use the crate-level [`Result`] alias, which
//! mirrors the upstream convention of leaning on `anyhow` at API boundaries
//! while keeping the underlying enum reachable via `downcast_ref`.

use thiserror::Error;

/// Crate-wide error type, one variant per taxonomy kind.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad input to a `create`/`register`-style operation. No state changes.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A descriptor is missing a required field (e.g. stdio server with no `command`).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connect failure, I/O error, or framing error on a transport.
    #[error("transport error on {transport}: {message}")]
    Transport {
        /// Name of the transport the error occurred on.
        transport: String,
        /// Human-readable detail.
        message: String,
    },

    /// An elapsed deadline on a request, connect, or probe.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// An explicit cancellation or shutdown. Not a failure.
    #[error("operation cancelled: {0}")]
    Cancellation(String),

    /// A malformed JSONL line. Caller logs with excerpt and continues.
    #[error("parse error at line {line}: {message} (excerpt: {excerpt:?})")]
    Parse {
        /// 1-based line number within the batch/stream.
        line: usize,
        /// Description of the failure.
        message: String,
        /// First 100 characters of the offending line.
        excerpt: String,
    },

    /// An unknown session, server, digest, checkpoint, or connection id.
    #[error("not found: {kind} {id}")]
    NotFound {
        /// What kind of entity was missing (`"session"`, `"server"`, `"digest"`, ...).
        kind: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// A duplicate id or a concurrency cap violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A buffer overflow, or too many pending requests/subscribers.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An invariant failure that should never happen in correct operation.
    #[error("internal error: {0}")]
    Internal(String),

    /// Underlying I/O failure not otherwise classified above.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML (de)serialization failure (configuration loading).
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Embedded relational store failure (Process Registry).
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Embedded KV store failure (Checkpoint timeline persistence).
    #[error("timeline store error: {0}")]
    Sled(#[from] sled::Error),

    /// HTTP client failure (sse/http transport, MCP discovery manifest fetch).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CoreError {
    /// Build a [`CoreError::NotFound`] for a missing session.
    pub fn session_not_found(id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind: "session",
            id: id.into(),
        }
    }

    /// Build a [`CoreError::NotFound`] for a missing MCP server descriptor.
    pub fn server_not_found(id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind: "server",
            id: id.into(),
        }
    }

    /// Build a [`CoreError::NotFound`] for a missing CAS digest.
    pub fn digest_not_found(id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind: "digest",
            id: id.into(),
        }
    }

    /// Build a [`CoreError::NotFound`] for a missing checkpoint.
    pub fn checkpoint_not_found(id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind: "checkpoint",
            id: id.into(),
        }
    }

    /// True if this error represents a cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CoreError::Cancellation(_))
    }

    /// True if this error represents a timeout rather than a transport failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::Timeout(_))
    }
}

/// Crate-wide result alias, matching the upstream convention of chaining
/// context with `anyhow` at API boundaries.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(
            CoreError::Validation("temperature out of range".into()).to_string(),
            "validation failed: temperature out of range"
        );
        assert_eq!(
            CoreError::Timeout(std::time::Duration::from_secs(5)).to_string(),
            "timed out after 5s"
        );
        assert_eq!(
            CoreError::session_not_found("abc").to_string(),
            "not found: session abc"
        );
    }

    #[test]
    fn kind_predicates() {
        assert!(CoreError::Cancellation("shutdown".into()).is_cancellation());
        assert!(!CoreError::Cancellation("shutdown".into()).is_timeout());
        assert!(CoreError::Timeout(std::time::Duration::from_secs(1)).is_timeout());
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CoreError = io_err.into();
        assert!(matches!(err, CoreError::Io(_)));
    }
}
