//! Dev server domain model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::command::{DevServerPlan, SafeCommand};

/// Dev server status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevServerStatus {
    /// No process is running
    Stopped,
    /// Process launched, no URL seen yet
    Starting,
    /// Process printed a local URL
    Running,
    /// Process exited unexpectedly
    Error,
}

impl DevServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DevServerStatus::Stopped => "stopped",
            DevServerStatus::Starting => "starting",
            DevServerStatus::Running => "running",
            DevServerStatus::Error => "error",
        }
    }

    /// Whether a child process is alive in this status
    pub fn is_live(&self) -> bool {
        matches!(self, DevServerStatus::Starting | DevServerStatus::Running)
    }
}

/// Supervised dev server for one project path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevServerProcess {
    /// Project path (registry key)
    pub project_path: String,

    pub pid: Option<u32>,

    pub status: DevServerStatus,

    /// Local URL printed by the server
    pub url: Option<String>,

    /// Command last launched for this project
    pub command: Option<SafeCommand>,

    pub started_at: Option<DateTime<Utc>>,

    pub last_exit_code: Option<i32>,

    pub last_error: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl DevServerProcess {
    /// Create a stopped entry for a project
    pub fn new(project_path: String) -> Self {
        Self {
            project_path,
            pid: None,
            status: DevServerStatus::Stopped,
            url: None,
            command: None,
            started_at: None,
            last_exit_code: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Transition to a new status
    pub fn transition_to(&mut self, new_status: DevServerStatus) -> bool {
        let valid_transition = match (self.status, new_status) {
            // From Stopped
            (DevServerStatus::Stopped, DevServerStatus::Starting) => true,
            // From Starting
            (DevServerStatus::Starting, DevServerStatus::Running) => true,
            (DevServerStatus::Starting, DevServerStatus::Stopped) => true,
            (DevServerStatus::Starting, DevServerStatus::Error) => true,
            // From Running
            (DevServerStatus::Running, DevServerStatus::Stopped) => true,
            (DevServerStatus::Running, DevServerStatus::Error) => true,
            // From Error
            (DevServerStatus::Error, DevServerStatus::Stopped) => true,
            _ => false,
        };

        if valid_transition {
            self.status = new_status;
            self.updated_at = Utc::now();
        }

        valid_transition
    }
}

/// Per-project notifications
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DevServerEvent {
    Status { process: DevServerProcess },
    Output { line: String },
}

/// Emitted when a supervised process exits unexpectedly
#[derive(Debug, Clone, Serialize)]
pub struct CrashEvent {
    pub project_path: String,
    pub pid: u32,
    pub exit_code: Option<i32>,
    pub command: SafeCommand,
    /// Most recent output lines, oldest first
    pub output_tail: Vec<String>,
    pub at: DateTime<Utc>,
}

/// Result of a start request
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StartOutcome {
    /// The process is up. `url` is `None` when no local URL was printed
    /// before the startup timeout.
    Started { pid: u32, url: Option<String> },
    /// The resolved plan is too uncertain to run without the user
    NeedsConfirmation { plan: DevServerPlan },
    /// The process exited before it came up
    Failed { error: String },
}
