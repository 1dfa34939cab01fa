//! Process tracker handler

use axum::{extract::State, Json};

use crate::domain::types::TrackedProcess;
use crate::{AppState, Error, Result};

/// Supervised processes with CPU and memory usage
pub async fn list_processes(State(state): State<AppState>) -> Result<Json<Vec<TrackedProcess>>> {
    let tracker = state.tracker.clone();
    let processes = tokio::task::spawn_blocking(move || tracker.snapshot())
        .await
        .map_err(|e| Error::Internal(format!("process sampling failed: {}", e)))?;
    Ok(Json(processes))
}
