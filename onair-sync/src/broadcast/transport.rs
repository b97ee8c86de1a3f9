//! Client transports

use crate::error::{Error, Result};
use async_trait::async_trait;
use onair_common::EventFrame;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Write side of one long-lived client connection
#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    /// Deliver one frame; an error means the client is unreachable
    async fn send(&self, frame: &EventFrame) -> Result<()>;

    /// End the connection from the server side
    async fn close(&self);

    /// Resolves once the remote side has gone away
    async fn closed(&self);
}

/// Transport backed by an mpsc channel
///
/// The receiver feeds the HTTP response stream; dropping it (client hung up)
/// resolves [`ClientTransport::closed`].
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::Sender<EventFrame>>>,
    send_timeout: Duration,
}

impl ChannelTransport {
    /// Create a transport and the receiver to stream from
    ///
    /// A send waits at most `send_timeout` for buffer space; a client that
    /// stays that far behind is treated as gone.
    pub fn channel(capacity: usize, send_timeout: Duration) -> (Self, mpsc::Receiver<EventFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx: Mutex::new(Some(tx)),
                send_timeout,
            },
            rx,
        )
    }

    fn sender(&self) -> Option<mpsc::Sender<EventFrame>> {
        self.tx.lock().clone()
    }
}

#[async_trait]
impl ClientTransport for ChannelTransport {
    async fn send(&self, frame: &EventFrame) -> Result<()> {
        let tx = self
            .sender()
            .ok_or_else(|| Error::TransportClosed("transport already closed".to_string()))?;
        tx.send_timeout(frame.clone(), self.send_timeout)
            .await
            .map_err(|e| Error::TransportClosed(e.to_string()))
    }

    async fn close(&self) {
        self.tx.lock().take();
    }

    async fn closed(&self) {
        if let Some(tx) = self.sender() {
            tx.closed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_then_close() {
        let (transport, mut rx) = ChannelTransport::channel(4, Duration::from_secs(1));

        transport
            .send(&EventFrame::new("syncProgress", json!({})))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().event_type, "syncProgress");

        transport.close().await;
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            transport.send(&EventFrame::new("late", json!({}))).await,
            Err(Error::TransportClosed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_times_out() {
        let (transport, _rx) = ChannelTransport::channel(1, Duration::from_millis(200));
        let frame = EventFrame::new("syncProgress", json!({}));

        transport.send(&frame).await.unwrap();
        assert!(transport.send(&frame).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_resolves_when_receiver_dropped() {
        let (transport, rx) = ChannelTransport::channel(1, Duration::from_secs(1));
        drop(rx);
        transport.closed().await;
        assert!(transport
            .send(&EventFrame::new("syncProgress", json!({})))
            .await
            .is_err());
    }
}
