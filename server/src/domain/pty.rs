//! PTY session domain model

use std::path::PathBuf;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An interactive shell session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtySession {
    /// Unguessable session id (random v4 UUID)
    pub id: String,

    /// OS process id of the shell
    pub pid: u32,

    /// Shell program
    pub shell: String,

    /// Current working directory as last reported by the UI
    pub cwd: PathBuf,

    /// UI tab this session belongs to
    pub tab_id: Option<String>,

    pub cols: u16,
    pub rows: u16,

    pub started_at: DateTime<Utc>,
}

/// Options for spawning a PTY session
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpawnOptions {
    pub shell: Option<String>,
    pub cwd: Option<PathBuf>,
    pub tab_id: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// Events emitted per PTY session
#[derive(Debug, Clone)]
pub enum PtyEvent {
    /// Raw terminal output
    Data(Bytes),
    /// The shell exited; `None` when the exit status is unknown
    Exit { code: Option<i32> },
}
