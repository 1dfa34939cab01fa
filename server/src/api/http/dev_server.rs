//! Dev server HTTP handlers

use std::convert::Infallible;
use std::path::PathBuf;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::domain::dev_server::{DevServerProcess, StartOutcome};
use crate::service::dev_server::project_key;
use crate::{AppState, Result};

/// Start request. Without `command` the project's plan is resolved.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub cwd: PathBuf,
    pub command: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProjectRequest {
    pub cwd: PathBuf,
}

/// Start response: the outcome plus a UI-facing status label
#[derive(Debug, Serialize)]
pub struct StartResponse {
    #[serde(flatten)]
    pub outcome: StartOutcome,
    pub status: &'static str,
}

impl From<StartOutcome> for StartResponse {
    fn from(outcome: StartOutcome) -> Self {
        let status = match &outcome {
            StartOutcome::Started { url: Some(_), .. } => "running",
            // Up, but it never printed a URL we recognize
            StartOutcome::Started { url: None, .. } => "unknown",
            StartOutcome::NeedsConfirmation { .. } => "needs_confirmation",
            StartOutcome::Failed { .. } => "error",
        };
        Self { outcome, status }
    }
}

/// Start a project's dev server
pub async fn start_dev_server(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<StartResponse>> {
    // A user-driven start re-arms automatic repair
    state.repair.clear_halt(&project_key(&req.cwd)?);

    let outcome = state
        .dev_servers
        .start(&req.cwd, req.command.as_deref())
        .await?;
    Ok(Json(outcome.into()))
}

/// Stop a project's dev server
pub async fn stop_dev_server(
    State(state): State<AppState>,
    Json(req): Json<ProjectRequest>,
) -> Result<Json<serde_json::Value>> {
    state.dev_servers.stop(&req.cwd).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Status of one project's dev server
pub async fn dev_server_status(
    State(state): State<AppState>,
    Query(query): Query<ProjectRequest>,
) -> Result<Json<DevServerProcess>> {
    Ok(Json(state.dev_servers.status(&query.cwd)?))
}

/// Every known dev server
pub async fn list_dev_servers(State(state): State<AppState>) -> Json<Vec<DevServerProcess>> {
    Json(state.dev_servers.list())
}

/// Status changes and output of one project (SSE)
pub async fn dev_server_events(
    State(state): State<AppState>,
    Query(query): Query<ProjectRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let events = state.dev_servers.subscribe(&query.cwd)?;

    let stream = BroadcastStream::new(events)
        .filter_map(|event| event.ok())
        .filter_map(|event| Event::default().json_data(event).ok())
        .map(Ok);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
