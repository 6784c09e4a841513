use axum::http::{HeaderValue, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use genapply_core::{EventSink, ProgressEvent};
use genapply_observe::Observer;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// Forwards progress events of one request into its SSE channel and the
/// observe log. Dropping the last handle ends the stream.
pub struct ChannelSink {
    tx: UnboundedSender<ProgressEvent>,
    observer: Arc<Observer>,
    request_id: Uuid,
}

impl ChannelSink {
    pub fn channel(
        observer: Arc<Observer>,
        request_id: Uuid,
    ) -> (Self, UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                observer,
                request_id,
            },
            rx,
        )
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        if let Err(err) = self.observer.record_event(self.request_id, &event) {
            tracing::warn!(request_id = %self.request_id, error = %err, "observe log write failed");
        }
        // The caller may be gone; the send error carries nothing to act on.
        let _ = self.tx.send(event);
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// `text/event-stream` of `data: <json>` frames, one per event.
pub fn event_stream(rx: UnboundedReceiver<ProgressEvent>) -> Response {
    let stream = UnboundedReceiverStream::new(rx).map(|event| Event::default().json_data(event));
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}
