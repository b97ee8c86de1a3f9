//! Mirror queue → broadcaster bridge
//!
//! Forwards every [`QueueEvent`] to the `mirror` topic so dashboards see
//! replication health live. The queue knows nothing about clients or frames;
//! this is the only place the two meet.
//!
//! | queue event     | frame type     |
//! |-----------------|----------------|
//! | `enqueued`      | `syncStarted`  |
//! | `started`       | `syncProgress` |
//! | `succeeded`     | `syncComplete` |
//! | `failedAttempt` | `syncRetry`    |
//! | `fatal`         | `syncError`    |
//! | `persisted`     | `syncError`    |
//! | `persistFailed` | `syncError`    |

use crate::broadcast::EventBroadcaster;
use crate::mirror::QueueEvent;
use onair_common::events::MIRROR_TOPIC;
use onair_common::{EventFrame, SyncEventType};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Frame type for a queue event
pub fn sync_event_type(event: &QueueEvent) -> SyncEventType {
    match event {
        QueueEvent::Enqueued { .. } => SyncEventType::SyncStarted,
        QueueEvent::Started { .. } => SyncEventType::SyncProgress,
        QueueEvent::Succeeded { .. } => SyncEventType::SyncComplete,
        QueueEvent::FailedAttempt { .. } => SyncEventType::SyncRetry,
        QueueEvent::Fatal { .. }
        | QueueEvent::Persisted { .. }
        | QueueEvent::PersistFailed { .. } => SyncEventType::SyncError,
    }
}

/// Build the frame broadcast for a queue event
///
/// The payload is the event itself (with its `kind` tag), so clients can tell
/// `fatal`, `persisted` and `persistFailed` apart even though all three arrive
/// as `syncError`.
pub fn map_queue_event(event: &QueueEvent) -> EventFrame {
    let payload = serde_json::to_value(event).unwrap_or_else(|e| {
        warn!("Failed to encode {} event: {}", event.name(), e);
        json!({ "kind": event.name() })
    });
    EventFrame::now(sync_event_type(event).as_str(), payload)
}

/// Forwards queue lifecycle events to the mirror topic
#[derive(Clone)]
pub struct MirrorEventBridge {
    broadcaster: EventBroadcaster,
}

impl MirrorEventBridge {
    pub fn new(broadcaster: EventBroadcaster) -> Self {
        Self { broadcaster }
    }

    /// Broadcast one event; returns how many clients received it
    pub async fn forward(&self, event: &QueueEvent) -> usize {
        let frame = map_queue_event(event);
        self.broadcaster.broadcast(MIRROR_TOPIC, frame).await
    }

    /// Run the bridge in a background task until the queue's sender is gone
    pub fn spawn(self, events: broadcast::Receiver<QueueEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    async fn run(self, mut events: broadcast::Receiver<QueueEvent>) {
        debug!("Mirror event bridge started");

        loop {
            match events.recv().await {
                Ok(event) => {
                    let delivered = self.forward(&event).await;
                    debug!("Mirror {} event reached {} clients", event.name(), delivered);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Mirror event bridge lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Mirror queue dropped its event sender");
                    break;
                }
            }
        }

        debug!("Mirror event bridge stopped");
    }
}

/// `kind` tag of a bridged frame
pub fn event_kind(frame: &EventFrame) -> Option<&str> {
    frame.payload.get("kind").and_then(Value::as_str)
}
