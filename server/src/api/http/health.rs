//! Health check handler

use axum::{extract::State, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub pty_sessions: usize,
    pub dev_servers: usize,
    pub active_repairs: usize,
    pub mcp_sessions: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        pty_sessions: state.ptys.len(),
        dev_servers: state
            .dev_servers
            .list()
            .iter()
            .filter(|p| p.status.is_live())
            .count(),
        active_repairs: state.repair.list_active().len(),
        mcp_sessions: state.mcp_sessions.len(),
    })
}
