//! Server-Sent Events (SSE) utilities
//!
//! Shared SSE helpers for OnAir services.

use crate::events::EventFrame;
use axum::response::sse::{Event, KeepAlive};
use std::time::Duration;
use tracing::warn;

/// Interval between keep-alive comments on idle streams
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Convert a frame into an axum SSE event
///
/// The `event:` field carries the frame type and `data:` the full frame JSON, so
/// clients can either dispatch on the SSE event name or parse the body alone.
pub fn to_sse_event(frame: &EventFrame) -> Event {
    match Event::default().event(&frame.event_type).json_data(frame) {
        Ok(event) => event,
        Err(e) => {
            warn!("Failed to serialize SSE frame {}: {}", frame.event_type, e);
            Event::default().comment("serialization error")
        }
    }
}

/// Keep-alive configuration shared by all event streams
pub fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(KEEP_ALIVE_INTERVAL)
        .text("keep-alive")
}
