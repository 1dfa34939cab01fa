//! Common domain types

use serde::{Deserialize, Serialize};

/// Which registry a tracked process belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Pty,
    DevServer,
}

/// Registry entry enriched with live resource usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedProcess {
    pub kind: ProcessKind,
    /// PTY session id or dev server project path
    pub key: String,
    pub pid: u32,
    /// Free-form status label (`running`, `starting`, ... or `open` for PTYs)
    pub status: String,
    /// CPU usage in percent of one core, `None` until measurable
    pub cpu_percent: Option<f32>,
    /// Resident set size in bytes
    pub rss_bytes: Option<u64>,
}
