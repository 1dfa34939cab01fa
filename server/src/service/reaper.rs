//! MCP bridge sessions with a sliding idle TTL

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::mcp::McpSession;
use crate::error::{Error, Result};

/// Session store
#[derive(Default)]
pub struct McpSessionStore {
    sessions: DashMap<String, McpSession>,
}

impl McpSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session bound to a project
    pub fn open(&self, project_path: &str) -> McpSession {
        let session = McpSession::new(Uuid::new_v4().to_string(), project_path.to_string());
        info!(
            "Opened MCP session {} for {}",
            session.session_id, session.project_path
        );
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        session
    }

    /// Refresh the idle timer. Returns false for unknown sessions.
    pub fn touch(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, session_id: &str) -> Result<McpSession> {
        self.sessions
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::McpSessionNotFound(session_id.to_string()))
    }

    pub fn list(&self) -> Vec<McpSession> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn close(&self, session_id: &str) -> Result<McpSession> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| Error::McpSessionNotFound(session_id.to_string()))?;
        info!("Closed MCP session {}", session_id);
        Ok(session)
    }

    /// Close every session idle for longer than `ttl` as of `now`
    pub fn sweep_at(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> Vec<String> {
        let mut closed = Vec::new();
        self.sessions.retain(|id, session| {
            let expired = session.is_expired(now, ttl);
            if expired {
                closed.push(id.clone());
            }
            !expired
        });

        for id in &closed {
            info!("Reaped idle MCP session {}", id);
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Sweep `store` every `interval` until `shutdown` flips to true
pub fn spawn_reaper(
    store: Arc<McpSessionStore>,
    interval: Duration,
    ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let ttl = match chrono::Duration::from_std(ttl) {
        Ok(ttl) => ttl,
        Err(e) => {
            warn!("MCP session TTL {:?} out of range ({}), using 30 minutes", ttl, e);
            chrono::Duration::minutes(30)
        }
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let closed = store.sweep_at(Utc::now(), ttl);
                    debug!("MCP sweep closed {} session(s), {} open", closed.len(), store.len());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("MCP session reaper stopped");
    })
}
