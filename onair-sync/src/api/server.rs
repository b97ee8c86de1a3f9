//! HTTP server setup and routing

use crate::bridge::MirrorEventBridge;
use crate::broadcast::EventBroadcaster;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::mirror::{CommandExecutor, MirrorCommandQueue, QueueOptions};
use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application context passed to all handlers
#[derive(Clone)]
pub struct AppContext {
    pub queue: MirrorCommandQueue,
    pub broadcaster: EventBroadcaster,
    pub config: Arc<SyncConfig>,
}

impl AppContext {
    /// Wire queue, broadcaster and bridge together
    ///
    /// Spawns the bridge task, so this must run inside a Tokio runtime.
    pub fn new(config: SyncConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        let queue = MirrorCommandQueue::new(QueueOptions::from_config(&config), executor);
        let broadcaster =
            EventBroadcaster::new(config.topics.iter().cloned(), config.inactivity_timeout());

        MirrorEventBridge::new(broadcaster.clone()).spawn(queue.subscribe());

        Self {
            queue,
            broadcaster,
            config: Arc::new(config),
        }
    }
}

/// Build the application router
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(super::handlers::health))
        .route("/build_info", get(super::handlers::build_info))
        // Live events
        .route("/events", get(super::sse::event_stream))
        .route("/events/subscribe", post(super::handlers::subscribe))
        .route("/events/unsubscribe", post(super::handlers::unsubscribe))
        // Mirror queue
        .route("/mirror/enqueue", post(super::handlers::enqueue))
        .route("/mirror/state", get(super::handlers::mirror_state))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve until `shutdown` resolves
pub async fn run<F>(ctx: AppContext, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], ctx.config.port));
    let app = build_router(ctx);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Http(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Http(format!("Server error: {}", e)))?;

    info!("HTTP server stopped");
    Ok(())
}
