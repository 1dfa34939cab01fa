//! Command and dev server plan domain model

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A process invocation: an allowlisted binary plus its arguments.
///
/// Values are only ever read after construction. Whether a value is safe to
/// launch is decided by `service::validator::validate_command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeCommand {
    bin: String,
    args: Vec<String>,
}

impl SafeCommand {
    pub fn new(bin: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            bin: bin.into(),
            args,
        }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// How sure the plan resolver is about a detected command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

/// A resolved plan for launching a project's dev server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevServerPlan {
    /// Project directory (must be absolute)
    pub cwd: PathBuf,

    /// Package manager that owns the project (npm, pnpm, ...)
    pub manager: String,

    /// Command to launch
    pub command: SafeCommand,

    /// Expected port. Kept wider than u16 so out-of-range values survive
    /// deserialization and are rejected by validation instead.
    #[serde(default)]
    pub port: Option<u32>,

    pub confidence: Confidence,

    /// Human-readable reasons the resolver picked this plan
    #[serde(default)]
    pub reasons: Vec<String>,

    /// Resolver-specific detection details
    #[serde(default)]
    pub detection: HashMap<String, serde_json::Value>,
}
