//! MCP bridge session domain model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A long-lived MCP bridge session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpSession {
    pub session_id: String,
    pub project_path: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl McpSession {
    pub fn new(session_id: String, project_path: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            project_path,
            created_at: now,
            last_activity: now,
        }
    }

    /// Record inbound activity
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Idle for longer than `ttl` as of `now`
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.last_activity) > ttl
    }
}
