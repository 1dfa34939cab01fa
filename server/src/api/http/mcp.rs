//! MCP bridge session handlers

use std::path::PathBuf;

use axum::{
    extract::{Path, Request, State},
    middleware::Next,
    response::Response,
    Json,
};
use serde::Deserialize;
use tracing::debug;

use crate::domain::mcp::McpSession;
use crate::service::dev_server::project_key;
use crate::{AppState, Error, Result};

/// Header naming the MCP session a request belongs to
pub const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Debug, Deserialize)]
pub struct OpenSessionRequest {
    pub project_path: PathBuf,
}

/// Refresh the idle timer of the session named in the request headers
pub async fn refresh_session_header(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(id) = request
        .headers()
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        if !state.mcp_sessions.touch(id) {
            debug!("Request names unknown MCP session {}", id);
        }
    }
    next.run(request).await
}

/// Open a session for a project
pub async fn open_session(
    State(state): State<AppState>,
    Json(req): Json<OpenSessionRequest>,
) -> Result<Json<McpSession>> {
    let key = project_key(&req.project_path)?;
    Ok(Json(state.mcp_sessions.open(&key)))
}

/// List open sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<McpSession>> {
    Json(state.mcp_sessions.list())
}

/// Any request on a session keeps it alive
pub async fn touch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<McpSession>> {
    if !state.mcp_sessions.touch(&id) {
        return Err(Error::McpSessionNotFound(id));
    }
    Ok(Json(state.mcp_sessions.get(&id)?))
}

/// Close a session
pub async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<McpSession>> {
    Ok(Json(state.mcp_sessions.close(&id)?))
}
