//! Session-orchestration server entry point.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shannon_core::cas::CasStorage;
use shannon_core::checkpoint::{TimelineManager, TimelineStore};
use shannon_core::cli::Cli;
use shannon_core::config::Config;
use shannon_core::mcp_control::{Discovery, McpControlPlane};
use shannon_core::metrics::ChannelMetricsSink;
use shannon_core::registry::ProcessRegistry;
use shannon_core::session::{ChildCommandTemplate, SessionManager};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = Config::load(&cli.config)?;
    tracing::info!(config = %cli.config.display(), "configuration loaded");

    let (metrics_sink, mut metrics_rx) = ChannelMetricsSink::new(256);
    tokio::spawn(async move {
        while let Some(event) = metrics_rx.recv().await {
            tracing::info!(?event, "lifecycle event");
        }
    });

    let cas = Arc::new(CasStorage::new(
        config.storage.cas_root.clone(),
        config.cas.compression_enabled,
        config.cas.compression_level,
        config.cas.deduplication_enabled,
    )?);

    let registry = Arc::new(ProcessRegistry::new_with_metrics(
        config.storage.registry_db_path.clone(),
        metrics_sink.clone(),
    )?);

    let timeline_store = TimelineStore::new(config.storage.timeline_dir.clone())?;
    let timeline = TimelineManager::new_with_store(cas.clone(), timeline_store);
    let mcp = McpControlPlane::new_with_metrics(metrics_sink.clone());

    let discovery = Discovery::new(
        config.mcp.discovery_dirs.clone(),
        config.mcp.binary_prefixes.clone(),
    );
    for server in discovery.discover_local().servers {
        if let Err(e) = mcp.add_server(server.clone()).await {
            tracing::warn!(server = %server.id, error = %e, "failed to register discovered server");
        }
    }
    if let Some(path) = &config.mcp.discovery_config_path {
        match discovery.discover_from_config(path) {
            Ok(found) => {
                for server in found.servers {
                    if let Err(e) = mcp.add_server(server.clone()).await {
                        tracing::warn!(server = %server.id, error = %e, "failed to register configured server");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "mcp discovery config could not be read"),
        }
    }

    let command = ChildCommandTemplate {
        program: "claude".to_string(),
        base_args: vec!["--output-format".to_string(), "stream-json".to_string()],
    };
    let _sessions = SessionManager::new_with_metrics(
        registry.clone(),
        Some(timeline.clone()),
        command,
        config.concurrency.max_concurrent_sessions,
        metrics_sink,
    );

    tracing::info!("server ready, awaiting shutdown signal");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping");

    mcp.stop(config.timeouts.request_timeout()).await;

    Ok(())
}

fn init_tracing(log_level: Option<&str>) {
    let env_filter = match log_level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shannon_core=info")),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
