//! Server-Sent Events streaming endpoint.
//!
//! `GET /ws` turns an event-bus subscription into an SSE stream:
//!
//! ```text
//! event: agent.spawned
//! data: {"id":"ab12cd34","name":"alpha",...}
//! ```
//!
//! The first frame is always `connected` with the current agent counts.
//! Back-pressure is inherited from the bus: a client that stops reading has
//! events dropped silently while every other subscriber keeps receiving.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures_util::stream::{self, Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;

use crate::hub::Hub;

/// SSE handler for `GET /ws`.
pub async fn events(
    State(hub): State<Arc<Hub>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = hub.events.subscribe();
    log::debug!("[stream] subscriber {} connected", subscription.id);

    let connected = SseEvent::default().event("connected").data(
        serde_json::json!({
            "agents_total": hub.manager.count(),
            "agents_running": hub.manager.count_running(),
        })
        .to_string(),
    );

    let live = ReceiverStream::new(subscription.rx).map(|event| {
        let frame = SseEvent::default()
            .event(event.event_type.as_str())
            .data(event.data.to_string());
        Ok(frame)
    });

    let stream = stream::once(async move { Ok(connected) }).chain(live);
    Sse::new(stream).keep_alive(KeepAlive::default())
}
