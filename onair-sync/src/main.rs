//! onair-sync - Main entry point
//!
//! Legacy store mirror and live event service for the OnAir station backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use onair_common::config::resolve_config_path;
use onair_sync::api::{self, AppContext};
use onair_sync::broadcast::EventBroadcaster;
use onair_sync::mirror::{CommandExecutor, MySqlExecutor};
use onair_sync::tunnel::{DirectConnector, SshTunnelConnector, TunnelledConnectionManager};
use onair_sync::SyncConfig;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long shutdown waits for the mirror worker to go idle
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Command-line arguments for onair-sync
#[derive(Parser, Debug)]
#[command(name = "onair-sync")]
#[command(about = "Legacy store mirror and live event service for OnAir")]
#[command(version)]
struct Args {
    /// Configuration file (TOML); also read from ONAIR_CONFIG
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "ONAIR_SYNC_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref(), "ONAIR_CONFIG", "sync.toml");
    let mut config =
        SyncConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }

    let default_filter = format!(
        "onair_sync={level},onair_common={level},tower_http={level}",
        level = config.log_level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting onair-sync v{} ({} built {}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    match &config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: compiled defaults"),
    }
    config
        .prepare_dirs()
        .context("Failed to prepare fatal snapshot directory")?;
    info!("Fatal snapshots go to {}", config.fatal_log_dir.display());

    let executor = legacy_executor(&config);
    let ctx = AppContext::new(config, executor);

    let shutdown = shutdown_signal(ctx.broadcaster.clone());
    api::run(ctx.clone(), shutdown)
        .await
        .context("HTTP server error")?;

    // A worker mid-backoff may take a while; don't hold shutdown on it
    let worker = match tokio::time::timeout(WORKER_DRAIN_TIMEOUT, ctx.queue.wait_idle()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                "Mirror worker still busy after {:?}, not waiting further",
                WORKER_DRAIN_TIMEOUT
            );
            Ok(())
        }
    };

    let state = ctx.queue.get_state();
    if state.depth > 0 {
        warn!("Exiting with {} mirror commands still queued", state.depth);
    }
    ctx.queue.shutdown().await;

    if let Err(e) = worker {
        error!("Mirror queue stopped abnormally: {}", e);
        return Err(e).context("Mirror queue failure");
    }
    if state.snapshot_persisted == Some(false) {
        anyhow::bail!("Mirror queue died and its fatal snapshot was not written");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Executor for the configured legacy store route
fn legacy_executor(config: &SyncConfig) -> Arc<dyn CommandExecutor> {
    let legacy = &config.legacy;
    match &legacy.tunnel {
        Some(tunnel) => {
            info!("Legacy store reached via SSH bastion {}", tunnel.ssh_host);
            let connector = SshTunnelConnector::new(legacy, tunnel.clone());
            Arc::new(MySqlExecutor::new(TunnelledConnectionManager::new(
                connector,
                config.idle_timeout(),
            )))
        }
        None => {
            info!("Legacy store reached directly");
            let connector = DirectConnector::new(legacy);
            Arc::new(MySqlExecutor::new(TunnelledConnectionManager::new(
                connector,
                config.idle_timeout(),
            )))
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM, after closing every event stream
///
/// Open SSE responses would otherwise hold graceful shutdown open forever.
async fn shutdown_signal(broadcaster: EventBroadcaster) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }

    broadcaster.disconnect_all("server shutdown").await;
}
