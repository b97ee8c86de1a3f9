//! Server-Sent Events stream
//!
//! Each open stream is one broadcaster client. The client learns its id from
//! the `connected` handshake frame and uses it with `/events/subscribe`.

use super::server::AppContext;
use crate::broadcast::ChannelTransport;
use crate::error::Result;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::{Stream, StreamExt};
use onair_common::sse::{keep_alive, to_sse_event};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Frames buffered per client before sends start waiting
const STREAM_BUFFER: usize = 64;

/// How long a send may wait on a full buffer before the client counts as gone
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// GET /events
pub async fn event_stream(
    State(ctx): State<AppContext>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let (transport, rx) = ChannelTransport::channel(STREAM_BUFFER, SEND_TIMEOUT);
    let client = ctx.broadcaster.register_client(Arc::new(transport)).await?;
    debug!("SSE stream opened for client {}", client.id);

    let stream = ReceiverStream::new(rx).map(|frame| Ok(to_sse_event(&frame)));
    Ok(Sse::new(stream).keep_alive(keep_alive()))
}
