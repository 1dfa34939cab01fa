//! Server-sent event stream for the UI and repair agents

use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::AppState;

/// Repair progress (`repair`) and agent work orders (`repair_request`)
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let repairs = BroadcastStream::new(state.repair.subscribe())
        .filter_map(|event| event.ok())
        .filter_map(|event| Event::default().event("repair").json_data(event).ok());

    let requests = BroadcastStream::new(state.agent.subscribe())
        .filter_map(|request| request.ok())
        .filter_map(|request| {
            Event::default()
                .event("repair_request")
                .json_data(request)
                .ok()
        });

    Sse::new(repairs.merge(requests).map(Ok)).keep_alive(KeepAlive::default())
}
