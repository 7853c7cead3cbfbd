//! SSE (Server-Sent Events) streaming of serving events.
//!
//! Each `ServingEvent` becomes one SSE event named after its type, with the
//! JSON-encoded event as data. A subscriber that falls behind the broadcast
//! buffer receives a `lagged` event counting what it missed.

use axum::response::sse::Event;
use futures::stream::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::events::ServingEvent;

/// Convert an event-bus subscription into an SSE stream.
pub fn events_to_sse_stream(
    rx: broadcast::Receiver<ServingEvent>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    BroadcastStream::new(rx).map(|item| {
        let event = match item {
            Ok(event) => {
                let data = serde_json::to_string(&event).unwrap_or_default();
                Event::default().event(event.kind.to_string()).data(data)
            }
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                Event::default().event("lagged").data(missed.to_string())
            }
        };
        Ok(event)
    })
}
