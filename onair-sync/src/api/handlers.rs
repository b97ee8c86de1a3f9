//! HTTP request handlers

use super::server::AppContext;
use crate::error::{Error, Result};
use crate::mirror::{MirrorCommand, MirrorStatement, QueueState};
use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

// ============================================================================
// Service info
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
    pub clients: usize,
    pub mirror_alive: bool,
    /// `false` means the queue died and its fatal snapshot was lost
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_persisted: Option<bool>,
}

/// GET /health
///
/// Reports "degraded" once the mirror queue has stopped, and whether the
/// fatal snapshot reached disk.
pub async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    let state = ctx.queue.get_state();
    let mirror_alive = state.alive;
    Json(HealthResponse {
        status: if mirror_alive { "ok" } else { "degraded" }.to_string(),
        module: "onair-sync".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        clients: ctx.broadcaster.client_count(),
        mirror_alive,
        snapshot_persisted: state.snapshot_persisted,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfoResponse {
    pub version: String,
    pub git_hash: String,
    pub build_timestamp: String,
    pub build_profile: String,
}

/// GET /build_info
pub async fn build_info() -> Json<BuildInfoResponse> {
    Json(BuildInfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("GIT_HASH").to_string(),
        build_timestamp: env!("BUILD_TIMESTAMP").to_string(),
        build_profile: env!("BUILD_PROFILE").to_string(),
    })
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicsRequest {
    pub client_id: Uuid,
    pub topics: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub subscribed: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnsubscribeResponse {
    pub unsubscribed: Vec<String>,
}

/// POST /events/subscribe
pub async fn subscribe(
    State(ctx): State<AppContext>,
    Json(req): Json<TopicsRequest>,
) -> Result<Json<SubscribeResponse>> {
    let subscribed = ctx.broadcaster.subscribe(&req.topics, req.client_id).await?;
    Ok(Json(SubscribeResponse { subscribed }))
}

/// POST /events/unsubscribe
pub async fn unsubscribe(
    State(ctx): State<AppContext>,
    Json(req): Json<TopicsRequest>,
) -> Result<Json<UnsubscribeResponse>> {
    let unsubscribed = ctx.broadcaster.unsubscribe(&req.topics, req.client_id)?;
    Ok(Json(UnsubscribeResponse { unsubscribed }))
}

// ============================================================================
// Mirror queue
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub commands: Vec<MirrorStatement>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub commands: Vec<MirrorCommand>,
}

/// POST /mirror/enqueue
///
/// Accepted commands are applied asynchronously; failures surface on the
/// `mirror` topic, never in this response.
pub async fn enqueue(
    State(ctx): State<AppContext>,
    Json(req): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>)> {
    match ctx.queue.enqueue(req.commands) {
        Some(commands) => {
            info!("Accepted {} mirror commands", commands.len());
            Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { commands })))
        }
        None => {
            warn!("Rejected mirror commands: queue is stopped");
            Err(Error::QueueStopped)
        }
    }
}

/// GET /mirror/state
pub async fn mirror_state(State(ctx): State<AppContext>) -> Json<QueueState> {
    Json(ctx.queue.get_state())
}
