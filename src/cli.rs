//! Command-line interface for the session-orchestration server.

use clap::Parser;
use std::path::PathBuf;

/// Session-orchestration server.
#[derive(Parser, Debug, Clone)]
#[command(name = "shannon-core")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config/shannon.yaml")]
    pub config: PathBuf,

    /// Log level filter (trace, debug, info, warn, error), overriding
    /// RUST_LOG when set.
    #[arg(short, long)]
    pub log_level: Option<String>,
}
