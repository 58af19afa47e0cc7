//! Session-orchestration server core library.
//!
//! Runs and supervises external agent processes, streams their JSONL output
//! to subscribers, checkpoints their workspace state, tracks them in a
//! cross-host process registry, and exposes an MCP server control plane for
//! tool servers those processes depend on.
//!
//! # Architecture
//!
//! - `session`: session lifecycle -- spawn, stream, checkpoint hook, cancel
//! - `stream`: line-buffered JSONL parsing of a process's stdout
//! - `transport`: JSON-RPC transport abstraction (stdio, SSE) and its manager
//! - `cas`: content-addressed blob store backing checkpoints
//! - `checkpoint`: structural checkpoint timeline built on the CAS
//! - `registry`: cross-host process registry and inter-session mailbox
//! - `mcp_control`: MCP server descriptors, connections, health checks, discovery
//! - `metrics`: lifecycle event bus forwarded to an external metrics sink
//! - `config`: configuration loading and validation
//! - `error`: error types and result aliases
//! - `cli`: command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use shannon_core::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(std::path::Path::new("config.yaml"))?;
//!     config.validate()?;
//!     Ok(())
//! }
//! ```

pub mod cas;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod mcp_control;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod stream;
pub mod transport;

pub use error::{CoreError, Result};

#[cfg(test)]
pub mod test_utils;
