//! Self-healing repair loop
//!
//! Crash events from the dev server supervisor open a repair incident per
//! project. An incident walks the phase graph in [`RepairPhase`]: it writes a
//! crash log, hands the crash to a [`RepairAgent`], restarts the server with
//! the last command once the agent reports a fix, and watches for a repeat
//! crash during a verification window. Failed attempts cool down with an
//! exponential backoff until `max_iterations` is used up, at which point the
//! project is halted until a user starts it again.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::dev_server::{CrashEvent, StartOutcome};
use crate::domain::repair::{AgentSignal, RepairEvent, RepairPhase, RepairRequest, RepairSession};
use crate::error::{Error, Result};
use crate::infra::crash_log::{append_crash, crash_log_path, crash_summary};
use crate::service::dev_server::Restarter;
use crate::service::validator::command_to_string;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const SIGNAL_CHANNEL_CAPACITY: usize = 16;
/// Finished sessions kept per project
const HISTORY_LIMIT: usize = 20;

/// Repair loop settings
#[derive(Debug, Clone)]
pub struct RepairConfig {
    pub max_iterations: u32,
    /// Quiet period after a restart before declaring the fix good
    pub verify_window: Duration,
    /// Longest silence tolerated from the repair agent
    pub agent_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Where crash logs go; the project directory when unset
    pub crash_log_dir: Option<PathBuf>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            verify_window: Duration::from_secs(15),
            agent_timeout: Duration::from_secs(600),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            crash_log_dir: None,
        }
    }
}

/// External fixer invoked while a session is `awaiting_agent`
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepairAgent: Send + Sync {
    /// Hand a crash to the agent. Progress is reported on `signals`.
    async fn dispatch(
        &self,
        request: RepairRequest,
        signals: mpsc::Sender<AgentSignal>,
    ) -> Result<()>;

    /// Stop routing signals for `repair_id`
    fn release(&self, repair_id: &str);
}

enum AgentOutcome {
    FixApplied,
    Failed(String),
    TimedOut,
}

struct Incident {
    session: RepairSession,
    inbox: mpsc::UnboundedSender<CrashEvent>,
    /// Dropped when the incident finishes, which cancels the driving task
    _cancel: oneshot::Sender<()>,
}

/// Repair loop service
pub struct RepairLoop {
    config: RepairConfig,
    agent: Arc<dyn RepairAgent>,
    restarter: Arc<dyn Restarter>,
    /// Open incidents by project path
    active: DashMap<String, Incident>,
    /// Finished sessions by project path, oldest first
    history: DashMap<String, Vec<RepairSession>>,
    /// Event log by repair id
    event_log: DashMap<String, Vec<RepairEvent>>,
    /// Projects that need a human, with their crash log
    halted: DashMap<String, PathBuf>,
    events: broadcast::Sender<RepairEvent>,
}

impl RepairLoop {
    /// Create a new repair loop
    pub fn new(
        config: RepairConfig,
        agent: Arc<dyn RepairAgent>,
        restarter: Arc<dyn Restarter>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            agent,
            restarter,
            active: DashMap::new(),
            history: DashMap::new(),
            event_log: DashMap::new(),
            halted: DashMap::new(),
            events,
        }
    }

    /// Consume crash events until the supervisor goes away
    pub async fn run(self: Arc<Self>, mut crashes: broadcast::Receiver<CrashEvent>) {
        info!("Repair loop started");
        loop {
            match crashes.recv().await {
                Ok(crash) => self.on_crash(crash),
                Err(RecvError::Lagged(missed)) => {
                    warn!("Repair loop missed {} crash events", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("Repair loop stopped");
    }

    /// Abort the open incident of a project
    pub fn abort(&self, project: &str) -> Result<RepairSession> {
        let repair_id = self
            .active
            .get(project)
            .map(|incident| incident.session.repair_id.clone())
            .ok_or_else(|| Error::RepairNotFound(project.to_string()))?;

        info!("Aborting repair {} for {}", repair_id, project);
        self.advance(&repair_id, project, RepairPhase::Aborted, "aborted by user", None)
    }

    /// Open incident of a project
    pub fn active(&self, project: &str) -> Option<RepairSession> {
        self.active
            .get(project)
            .map(|incident| incident.session.clone())
    }

    /// Every open incident
    pub fn list_active(&self) -> Vec<RepairSession> {
        self.active
            .iter()
            .map(|entry| entry.value().session.clone())
            .collect()
    }

    /// Finished sessions of a project followed by the open one, if any
    pub fn history(&self, project: &str) -> Vec<RepairSession> {
        let mut sessions = self
            .history
            .get(project)
            .map(|h| h.value().clone())
            .unwrap_or_default();
        sessions.extend(self.active(project));
        sessions
    }

    /// Event log of one session
    pub fn events(&self, repair_id: &str) -> Result<Vec<RepairEvent>> {
        self.event_log
            .get(repair_id)
            .map(|log| log.value().clone())
            .ok_or_else(|| Error::RepairNotFound(repair_id.to_string()))
    }

    /// Subscribe to every repair event
    pub fn subscribe(&self) -> broadcast::Receiver<RepairEvent> {
        self.events.subscribe()
    }

    /// Crash log of a halted project
    pub fn halted(&self, project: &str) -> Option<PathBuf> {
        self.halted.get(project).map(|path| path.value().clone())
    }

    /// Re-arm automatic repair after a user-driven start
    pub fn clear_halt(&self, project: &str) -> bool {
        let cleared = self.halted.remove(project).is_some();
        if cleared {
            info!("Repair re-enabled for {}", project);
        }
        cleared
    }

    fn on_crash(self: &Arc<Self>, crash: CrashEvent) {
        let project = crash.project_path.clone();

        if self.halted.contains_key(&project) {
            info!(
                "Ignoring crash of {} (pid {}): project needs a human",
                project, crash.pid
            );
            return;
        }

        let inbox = self
            .active
            .get(&project)
            .map(|incident| incident.inbox.clone());
        let crash = match inbox {
            Some(inbox) => match inbox.send(crash) {
                Ok(()) => return,
                Err(mpsc::error::SendError(crash)) => crash,
            },
            None => crash,
        };

        self.open_incident(crash);
    }

    fn open_incident(self: &Arc<Self>, crash: CrashEvent) {
        let project = crash.project_path.clone();
        let repair_id = Uuid::new_v4().to_string();
        let log_dir = self
            .config
            .crash_log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&project));
        let session = RepairSession::new(
            repair_id.clone(),
            project.clone(),
            self.config.max_iterations,
            crash_log_path(&log_dir, &repair_id),
        );

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let event = session.event(
            "crash detected",
            Some(Error::from(&crash).to_string()),
        );

        self.active.insert(
            project.clone(),
            Incident {
                session,
                inbox: inbox_tx,
                _cancel: cancel_tx,
            },
        );
        self.record(event);

        tokio::spawn(self.clone().run_incident(repair_id, project, crash, inbox_rx, cancel_rx));
    }

    async fn run_incident(
        self: Arc<Self>,
        repair_id: String,
        project: String,
        crash: CrashEvent,
        mut inbox: mpsc::UnboundedReceiver<CrashEvent>,
        cancel: oneshot::Receiver<()>,
    ) {
        let result = tokio::select! {
            result = self.drive(&repair_id, &project, crash, &mut inbox) => result,
            _ = cancel => Ok(()),
        };

        if let Err(e) = result {
            debug!("Repair {} for {} ended early: {}", repair_id, project, e);
        }
        self.agent.release(&repair_id);
    }

    async fn drive(
        &self,
        repair_id: &str,
        project: &str,
        mut crash: CrashEvent,
        inbox: &mut mpsc::UnboundedReceiver<CrashEvent>,
    ) -> Result<()> {
        let log_path = self.session(repair_id, project)?.log_path;
        self.write_crash_log(&log_path, "crash detected", &crash).await;

        let mut backoff = self.config.backoff_initial;
        loop {
            let session = self.advance(
                repair_id,
                project,
                RepairPhase::RepairStarted,
                "repair attempt started",
                None,
            )?;
            self.advance(
                repair_id,
                project,
                RepairPhase::AwaitingAgent,
                "waiting for repair agent",
                None,
            )?;

            let outcome = self.run_agent(&session, &crash, inbox).await;
            self.agent.release(repair_id);

            let cooldown_reason = match outcome? {
                AgentOutcome::TimedOut => {
                    return self.give_up(
                        repair_id,
                        project,
                        &log_path,
                        format!("repair agent went silent; see {}", log_path.display()),
                        Some(Error::Timeout("repair agent".to_string()).to_string()),
                    );
                }
                AgentOutcome::Failed(reason) => reason,
                AgentOutcome::FixApplied => {
                    self.advance(
                        repair_id,
                        project,
                        RepairPhase::ReadyToRestart,
                        "fix applied",
                        None,
                    )?;
                    // Anything queued so far predates the fix
                    while let Ok(stale) = inbox.try_recv() {
                        self.coalesce(repair_id, project, stale).await;
                    }

                    match self.restart_and_verify(repair_id, project, &crash, inbox).await? {
                        None => return Ok(()),
                        Some((reason, new_crash)) => {
                            if let Some(new_crash) = new_crash {
                                self.write_crash_log(&log_path, "crash during verification", &new_crash)
                                    .await;
                                crash = new_crash;
                            }
                            reason
                        }
                    }
                }
            };

            let session = self.advance(
                repair_id,
                project,
                RepairPhase::Cooldown,
                "attempt failed",
                Some(cooldown_reason),
            )?;

            if !session.has_iterations_left() {
                return self.give_up(
                    repair_id,
                    project,
                    &log_path,
                    format!(
                        "giving up after {} attempts; see {}",
                        session.iteration,
                        log_path.display()
                    ),
                    None,
                );
            }

            debug!("Repair {} cooling down for {:?}", repair_id, backoff);
            let deadline = Instant::now() + backoff;
            loop {
                tokio::select! {
                    _ = sleep_until(deadline) => break,
                    Some(extra) = inbox.recv() => {
                        self.coalesce(repair_id, project, extra.clone()).await;
                        // The next attempt works from the newest crash
                        crash = extra;
                    }
                }
            }
            backoff = (backoff * 2).min(self.config.backoff_max);
        }
    }

    /// Wait for the agent to finish, following its progress signals
    async fn run_agent(
        &self,
        session: &RepairSession,
        crash: &CrashEvent,
        inbox: &mut mpsc::UnboundedReceiver<CrashEvent>,
    ) -> Result<AgentOutcome> {
        let repair_id = session.repair_id.as_str();
        let project = session.project_path.as_str();

        let (signals_tx, mut signals) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let request = RepairRequest {
            repair_id: session.repair_id.clone(),
            project_path: session.project_path.clone(),
            log_path: session.log_path.clone(),
            crash_summary: crash_summary(crash),
            iteration: session.iteration,
            max_iterations: session.max_iterations,
        };
        if let Err(e) = self.agent.dispatch(request, signals_tx).await {
            warn!("Failed to dispatch repair {}: {}", repair_id, e);
            return Ok(AgentOutcome::Failed(e.to_string()));
        }

        let mut deadline = Instant::now() + self.config.agent_timeout;
        loop {
            tokio::select! {
                signal = signals.recv() => {
                    let (phase, message) = match signal {
                        Some(AgentSignal::Started) => (RepairPhase::AgentStarted, "agent started".to_string()),
                        Some(AgentSignal::ReadingLog) => (RepairPhase::AgentReadingLog, "agent reading crash log".to_string()),
                        Some(AgentSignal::ApplyingFix) => (RepairPhase::AgentApplyingFix, "agent applying fix".to_string()),
                        Some(AgentSignal::WroteFiles { files }) => (
                            RepairPhase::AgentWroteFiles,
                            format!("agent wrote {} file(s)", files.len()),
                        ),
                        Some(AgentSignal::FixApplied) => return Ok(AgentOutcome::FixApplied),
                        Some(AgentSignal::Failed { reason }) => return Ok(AgentOutcome::Failed(reason)),
                        None => return Ok(AgentOutcome::Failed("repair agent disconnected".to_string())),
                    };
                    match self.advance(repair_id, project, phase, message, None) {
                        Ok(_) => {}
                        Err(Error::InvalidPhaseTransition { from, to }) => {
                            debug!("Ignoring out of order agent signal for {}: {} -> {}", repair_id, from, to);
                        }
                        Err(e) => return Err(e),
                    }
                    deadline = Instant::now() + self.config.agent_timeout;
                }
                Some(extra) = inbox.recv() => self.coalesce(repair_id, project, extra).await,
                _ = sleep_until(deadline) => {
                    warn!("Repair agent silent for {:?} on {}", self.config.agent_timeout, repair_id);
                    return Ok(AgentOutcome::TimedOut);
                }
            }
        }
    }

    /// `Ok(None)` when the fix held, otherwise the cooldown reason and the
    /// crash that disproved the fix
    async fn restart_and_verify(
        &self,
        repair_id: &str,
        project: &str,
        crash: &CrashEvent,
        inbox: &mut mpsc::UnboundedReceiver<CrashEvent>,
    ) -> Result<Option<(String, Option<CrashEvent>)>> {
        self.advance(
            repair_id,
            project,
            RepairPhase::Restarting,
            format!("restarting `{}`", command_to_string(&crash.command)),
            None,
        )?;

        match self.restarter.restart(project, &crash.command).await {
            Ok(StartOutcome::Started { .. }) => {}
            Ok(StartOutcome::Failed { error }) => {
                return Ok(Some((format!("restart failed: {}", error), None)));
            }
            Ok(StartOutcome::NeedsConfirmation { .. }) => {
                return Ok(Some(("restart needs confirmation".to_string(), None)));
            }
            Err(e) => return Ok(Some((format!("restart failed: {}", e), None))),
        }

        self.advance(
            repair_id,
            project,
            RepairPhase::VerifyingFix,
            format!("watching for crashes for {:?}", self.config.verify_window),
            None,
        )?;

        match timeout(self.config.verify_window, inbox.recv()).await {
            Err(_) => {
                self.advance(
                    repair_id,
                    project,
                    RepairPhase::Recovered,
                    "no crash during verification",
                    None,
                )?;
                Ok(None)
            }
            Ok(Some(new_crash)) => Ok(Some((
                format!("crashed again: {}", crash_summary(&new_crash)),
                Some(new_crash),
            ))),
            Ok(None) => Err(Error::Internal("repair inbox closed".to_string())),
        }
    }

    /// Validate and apply a phase change, then log and broadcast it
    fn advance(
        &self,
        repair_id: &str,
        project: &str,
        to: RepairPhase,
        message: impl Into<String>,
        error: Option<String>,
    ) -> Result<RepairSession> {
        let (event, snapshot) = {
            let mut incident = self
                .active
                .get_mut(project)
                .filter(|incident| incident.session.repair_id == repair_id)
                .ok_or_else(|| Error::RepairNotFound(repair_id.to_string()))?;
            incident.session.transition_to(to)?;
            (incident.session.event(message, error), incident.session.clone())
        };

        self.record(event);
        if to.is_terminal() {
            self.finish(repair_id, project);
        }
        Ok(snapshot)
    }

    fn record(&self, event: RepairEvent) {
        match &event.error {
            Some(error) => warn!(
                "Repair {} [{}/{}] {}: {} ({})",
                event.run_id, event.iteration, event.max_iterations, event.phase, event.message, error
            ),
            None => info!(
                "Repair {} [{}/{}] {}: {}",
                event.run_id, event.iteration, event.max_iterations, event.phase, event.message
            ),
        }

        self.event_log
            .entry(event.run_id.clone())
            .or_default()
            .push(event.clone());
        let _ = self.events.send(event);
    }

    fn finish(&self, repair_id: &str, project: &str) {
        let Some((_, incident)) = self
            .active
            .remove_if(project, |_, incident| incident.session.repair_id == repair_id)
        else {
            return;
        };

        let mut history = self.history.entry(project.to_string()).or_default();
        history.push(incident.session);
        if history.len() > HISTORY_LIMIT {
            let evicted = history.remove(0);
            self.event_log.remove(&evicted.repair_id);
        }
    }

    fn session(&self, repair_id: &str, project: &str) -> Result<RepairSession> {
        self.active(project)
            .filter(|session| session.repair_id == repair_id)
            .ok_or_else(|| Error::RepairNotFound(repair_id.to_string()))
    }

    /// End the incident in `failed_requires_human`. The halt is in place
    /// before the incident leaves `active`, so no crash slips in between.
    fn give_up(
        &self,
        repair_id: &str,
        project: &str,
        log_path: &std::path::Path,
        message: String,
        error: Option<String>,
    ) -> Result<()> {
        self.halt(project, log_path);
        if let Err(e) = self.advance(
            repair_id,
            project,
            RepairPhase::FailedRequiresHuman,
            message,
            error,
        ) {
            self.halted.remove(project);
            return Err(e);
        }
        Ok(())
    }

    fn halt(&self, project: &str, log_path: &std::path::Path) {
        warn!(
            "Halting automatic repair for {}; crash log at {}",
            project,
            log_path.display()
        );
        self.halted.insert(project.to_string(), log_path.to_path_buf());
    }

    async fn coalesce(&self, repair_id: &str, project: &str, crash: CrashEvent) {
        let log_path = {
            let Some(mut incident) = self
                .active
                .get_mut(project)
                .filter(|incident| incident.session.repair_id == repair_id)
            else {
                return;
            };
            incident.session.coalesced_crashes += 1;
            incident.session.log_path.clone()
        };

        info!(
            "Folding crash of pid {} into repair {} for {}",
            crash.pid, repair_id, project
        );
        self.write_crash_log(&log_path, "additional crash", &crash)
            .await;
    }

    async fn write_crash_log(&self, path: &std::path::Path, heading: &str, crash: &CrashEvent) {
        if let Err(e) = append_crash(path, heading, crash).await {
            warn!("Failed to write crash log {}: {}", path.display(), e);
        }
    }
}
