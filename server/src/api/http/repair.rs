//! Repair loop HTTP handlers

use std::path::PathBuf;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::domain::repair::{AgentSignal, RepairEvent, RepairSession};
use crate::service::dev_server::project_key;
use crate::{AppState, Result};

#[derive(Debug, Deserialize)]
pub struct RepairQuery {
    pub project: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct AbortRequest {
    pub project: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct RepairOverview {
    pub active: Vec<RepairSession>,
    pub history: Vec<RepairSession>,
    /// Crash log of a project waiting for a human
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted_log: Option<PathBuf>,
}

/// Repairs of one project, or every open repair
pub async fn list_repairs(
    State(state): State<AppState>,
    Query(query): Query<RepairQuery>,
) -> Result<Json<RepairOverview>> {
    let Some(project) = query.project else {
        return Ok(Json(RepairOverview {
            active: state.repair.list_active(),
            history: Vec::new(),
            halted_log: None,
        }));
    };

    let key = project_key(&project)?;
    Ok(Json(RepairOverview {
        active: state.repair.active(&key).into_iter().collect(),
        history: state.repair.history(&key),
        halted_log: state.repair.halted(&key),
    }))
}

/// Event log of one repair
pub async fn repair_events(
    State(state): State<AppState>,
    Path(repair_id): Path<String>,
) -> Result<Json<Vec<RepairEvent>>> {
    Ok(Json(state.repair.events(&repair_id)?))
}

/// Progress report from the repair agent
pub async fn agent_signal(
    State(state): State<AppState>,
    Path(repair_id): Path<String>,
    Json(signal): Json<AgentSignal>,
) -> Result<Json<serde_json::Value>> {
    state.agent.signal(&repair_id, signal).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Abort a project's open repair
pub async fn abort_repair(
    State(state): State<AppState>,
    Json(req): Json<AbortRequest>,
) -> Result<Json<RepairSession>> {
    let key = project_key(&req.project)?;
    Ok(Json(state.repair.abort(&key)?))
}
