//! Mirror queue lifecycle events
//!
//! The queue publishes these on a `tokio::sync::broadcast` channel. Consumers
//! (the broadcast bridge, tests, log shippers) subscribe independently; the
//! queue neither knows nor waits for them.

use super::command::MirrorCommand;
use super::fatal::FatalInfo;
use serde::Serialize;
use std::path::PathBuf;

/// Queue lifecycle event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum QueueEvent {
    /// Command accepted (status pending)
    Enqueued { command: MirrorCommand },

    /// Attempt begun (status in_progress, attempts already incremented)
    Started { command: MirrorCommand },

    /// Command applied (status completed)
    Succeeded { command: MirrorCommand },

    /// Attempt failed; the command will be retried after `retry_in_ms`
    #[serde(rename_all = "camelCase")]
    FailedAttempt {
        command: MirrorCommand,
        retry_in_ms: u64,
    },

    /// Attempts exhausted; the queue is dead
    Fatal { info: FatalInfo },

    /// Fatal snapshot written to disk
    Persisted { path: PathBuf },

    /// Fatal snapshot could NOT be written; the lost work has no audit trail
    PersistFailed { path: PathBuf, message: String },
}

impl QueueEvent {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::Enqueued { .. } => "enqueued",
            QueueEvent::Started { .. } => "started",
            QueueEvent::Succeeded { .. } => "succeeded",
            QueueEvent::FailedAttempt { .. } => "failedAttempt",
            QueueEvent::Fatal { .. } => "fatal",
            QueueEvent::Persisted { .. } => "persisted",
            QueueEvent::PersistFailed { .. } => "persistFailed",
        }
    }
}
