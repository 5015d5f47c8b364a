//! Server-sent events for one job.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use serde_json::json;

use crate::core::{EventStream, JobEvent};

pub const MESSAGE_EVENT: &str = "message";
pub const ERROR_EVENT: &str = "backend-error";
pub const COMPLETE_EVENT: &str = "backend-complete";

/// Wire form of a job event.
///
/// Progress and log lines are `message` events carrying `{progress}` or
/// `{log}`; the terminal events are `backend-error` with `{status, detail,
/// kind}` and `backend-complete` with an empty object. An event without a
/// `data:` line is never dispatched by SSE consumers.
pub fn to_sse_event(event: &JobEvent) -> Event {
    match event {
        JobEvent::Progress(progress) => Event::default()
            .event(MESSAGE_EVENT)
            .data(json!({ "progress": progress }).to_string()),
        JobEvent::Log(entry) => Event::default()
            .event(MESSAGE_EVENT)
            .data(json!({ "log": entry }).to_string()),
        JobEvent::Error {
            status,
            kind,
            detail,
        } => Event::default().event(ERROR_EVENT).data(
            json!({ "status": status, "detail": detail, "kind": kind }).to_string(),
        ),
        JobEvent::Complete => Event::default().event(COMPLETE_EVENT).data("{}"),
    }
}

/// The response ends when the job's stream does, which is right after its
/// terminal event.
pub fn sse_response(
    events: EventStream,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let stream = events
        .into_stream()
        .map(|event| Ok::<_, Infallible>(to_sse_event(&event)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}
