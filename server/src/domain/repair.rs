//! Repair session domain model

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Phase of a repair incident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairPhase {
    CrashDetected,
    RepairStarted,
    AwaitingAgent,
    AgentStarted,
    AgentReadingLog,
    AgentApplyingFix,
    AgentWroteFiles,
    ReadyToRestart,
    Restarting,
    VerifyingFix,
    Recovered,
    Cooldown,
    FailedRequiresHuman,
    Aborted,
}

impl RepairPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairPhase::CrashDetected => "crash_detected",
            RepairPhase::RepairStarted => "repair_started",
            RepairPhase::AwaitingAgent => "awaiting_agent",
            RepairPhase::AgentStarted => "agent_started",
            RepairPhase::AgentReadingLog => "agent_reading_log",
            RepairPhase::AgentApplyingFix => "agent_applying_fix",
            RepairPhase::AgentWroteFiles => "agent_wrote_files",
            RepairPhase::ReadyToRestart => "ready_to_restart",
            RepairPhase::Restarting => "restarting",
            RepairPhase::VerifyingFix => "verifying_fix",
            RepairPhase::Recovered => "recovered",
            RepairPhase::Cooldown => "cooldown",
            RepairPhase::FailedRequiresHuman => "failed_requires_human",
            RepairPhase::Aborted => "aborted",
        }
    }

    /// Terminal phases end the incident
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RepairPhase::Recovered | RepairPhase::FailedRequiresHuman | RepairPhase::Aborted
        )
    }

    /// Position among the agent-driven phases, used to keep agent
    /// progress moving forward only.
    fn agent_rank(&self) -> Option<u8> {
        match self {
            RepairPhase::AwaitingAgent => Some(0),
            RepairPhase::AgentStarted => Some(1),
            RepairPhase::AgentReadingLog => Some(2),
            RepairPhase::AgentApplyingFix => Some(3),
            RepairPhase::AgentWroteFiles => Some(4),
            _ => None,
        }
    }

    /// Whether `self -> to` is an edge of the phase graph
    pub fn can_transition_to(&self, to: RepairPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == RepairPhase::Aborted {
            return true;
        }

        if let (Some(from_rank), Some(to_rank)) = (self.agent_rank(), to.agent_rank()) {
            return to_rank > from_rank;
        }

        match (self, to) {
            (RepairPhase::CrashDetected, RepairPhase::RepairStarted) => true,
            (RepairPhase::RepairStarted, RepairPhase::AwaitingAgent) => true,
            (
                RepairPhase::AwaitingAgent
                | RepairPhase::AgentStarted
                | RepairPhase::AgentReadingLog
                | RepairPhase::AgentApplyingFix
                | RepairPhase::AgentWroteFiles,
                RepairPhase::ReadyToRestart
                | RepairPhase::Cooldown
                | RepairPhase::FailedRequiresHuman,
            ) => true,
            (RepairPhase::ReadyToRestart, RepairPhase::Restarting) => true,
            (RepairPhase::Restarting, RepairPhase::VerifyingFix | RepairPhase::Cooldown) => true,
            (RepairPhase::VerifyingFix, RepairPhase::Recovered | RepairPhase::Cooldown) => true,
            (RepairPhase::Cooldown, RepairPhase::RepairStarted) => true,
            (RepairPhase::Cooldown, RepairPhase::FailedRequiresHuman) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RepairPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One crash-to-resolution cycle for a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairSession {
    pub repair_id: String,
    pub project_path: String,
    pub phase: RepairPhase,
    /// 1-based attempt counter, never above `max_iterations`
    pub iteration: u32,
    pub max_iterations: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Crash log shared with the repair agent and the user
    pub log_path: PathBuf,
    /// Crashes folded into this incident instead of starting a new one
    pub coalesced_crashes: u32,
}

impl RepairSession {
    /// Create a session for a freshly detected crash
    pub fn new(
        repair_id: String,
        project_path: String,
        max_iterations: u32,
        log_path: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            repair_id,
            project_path,
            phase: RepairPhase::CrashDetected,
            iteration: 1,
            max_iterations: max_iterations.max(1),
            started_at: now,
            updated_at: now,
            log_path,
            coalesced_crashes: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Whether another full attempt is allowed after this one
    pub fn has_iterations_left(&self) -> bool {
        self.iteration < self.max_iterations
    }

    /// Move to `to`, bumping the iteration when a new attempt starts
    pub fn transition_to(&mut self, to: RepairPhase) -> Result<()> {
        let starts_new_attempt =
            self.phase == RepairPhase::Cooldown && to == RepairPhase::RepairStarted;

        if !self.phase.can_transition_to(to) || (starts_new_attempt && !self.has_iterations_left())
        {
            return Err(Error::InvalidPhaseTransition {
                from: self.phase,
                to,
            });
        }

        if starts_new_attempt {
            self.iteration += 1;
        }
        self.phase = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Build the event describing the current phase
    pub fn event(&self, message: impl Into<String>, error: Option<String>) -> RepairEvent {
        RepairEvent {
            run_id: self.repair_id.clone(),
            project_path: self.project_path.clone(),
            phase: self.phase,
            iteration: self.iteration,
            max_iterations: self.max_iterations,
            message: message.into(),
            error,
            at: Utc::now(),
        }
    }
}

/// Progress notification for a repair incident
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairEvent {
    pub run_id: String,
    pub project_path: String,
    pub phase: RepairPhase,
    pub iteration: u32,
    pub max_iterations: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Work order handed to the repair agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRequest {
    pub repair_id: String,
    pub project_path: String,
    pub log_path: PathBuf,
    pub crash_summary: String,
    pub iteration: u32,
    pub max_iterations: u32,
}

/// Progress reported back by the repair agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum AgentSignal {
    Started,
    ReadingLog,
    ApplyingFix,
    WroteFiles {
        #[serde(default)]
        files: Vec<String>,
    },
    FixApplied,
    Failed {
        reason: String,
    },
}
