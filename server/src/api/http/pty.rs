//! PTY HTTP handlers

use std::path::PathBuf;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::domain::pty::{PtyEvent, PtySession, SpawnOptions};
use crate::{AppState, Error, Result};

/// Terminal input request
#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub data: String,
}

/// Resize PTY request
#[derive(Debug, Deserialize)]
pub struct ResizePtyRequest {
    pub cols: u16,
    pub rows: u16,
}

/// Working directory update
#[derive(Debug, Deserialize)]
pub struct SetCwdRequest {
    pub cwd: PathBuf,
}

/// Spawn a new PTY
pub async fn create_pty(
    State(state): State<AppState>,
    Json(opts): Json<SpawnOptions>,
) -> Result<Json<PtySession>> {
    let session = state.ptys.spawn(opts).await?;
    Ok(Json(session))
}

/// List PTY sessions
pub async fn list_ptys(State(state): State<AppState>) -> Json<Vec<PtySession>> {
    Json(state.ptys.list())
}

/// Get one PTY session
pub async fn get_pty(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PtySession>> {
    state
        .ptys
        .get(&id)
        .map(Json)
        .ok_or(Error::PtyNotFound(id))
}

/// Write input to a PTY
pub async fn write_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> Result<Json<serde_json::Value>> {
    state.ptys.write(&id, req.data.as_bytes()).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Resize a PTY
pub async fn resize_pty(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizePtyRequest>,
) -> Result<Json<serde_json::Value>> {
    state.ptys.resize(&id, req.cols, req.rows).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Record the shell's working directory
pub async fn set_cwd(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetCwdRequest>,
) -> Result<Json<serde_json::Value>> {
    state.ptys.set_cwd(&id, req.cwd)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Kill a PTY
pub async fn kill_pty(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.ptys.kill(&id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// WebSocket handler for PTY
pub async fn pty_websocket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    if state.ptys.get(&id).is_none() {
        return Err(Error::PtyNotFound(id));
    }
    Ok(ws.on_upgrade(move |socket| handle_pty_socket(socket, state, id)))
}

async fn handle_pty_socket(socket: WebSocket, state: AppState, id: String) {
    let Some(mut events) = state.ptys.subscribe(&id) else {
        debug!("PTY {} exited before the socket attached", id);
        return;
    };
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(PtyEvent::Data(bytes)) => {
                    if sender.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Ok(PtyEvent::Exit { code }) => {
                    let exit = serde_json::json!({ "type": "exit", "code": code }).to_string();
                    let _ = sender.send(Message::Text(exit.into())).await;
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("PTY {} socket fell behind by {} chunks", id, missed);
                }
                Err(RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = state.ptys.write(&id, text.as_bytes()).await {
                        tracing::error!("Failed to send PTY input: {}", e);
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = state.ptys.write(&id, &data).await {
                        tracing::error!("Failed to send PTY input: {}", e);
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("PTY {} socket closed", id);
}
