//! Dev server process supervisor
//!
//! Each project path is owned by one actor task. Start, stop, output and exit
//! handling for a project all run on that task, so transitions for one
//! project are totally ordered and a second `start` while a process is alive
//! returns the existing pid instead of spawning another. Callers only ever
//! see snapshots published through a `watch` channel.

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use regex::Regex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::domain::command::{Confidence, SafeCommand};
use crate::domain::dev_server::{
    CrashEvent, DevServerEvent, DevServerProcess, DevServerStatus, StartOutcome,
};
use crate::error::{Error, Result};
use crate::infra::process::{ProcessLauncher, ProcessOutput};
use crate::infra::signal::{terminate_with_grace, SignalTarget, Signaller};
use crate::service::resolver::PlanResolver;
use crate::service::validator::{
    command_to_string, parse_command_string, validate_command, validate_cwd, validate_plan,
};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 512;
const CRASH_CHANNEL_CAPACITY: usize = 64;

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)")
        .expect("ANSI escape pattern is valid")
});

static LOCAL_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bhttps?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1\])(?::\d{1,5})?(?:/[^\s'"<>]*)?"#)
        .expect("local URL pattern is valid")
});

/// Supervisor settings
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Wait between SIGTERM and SIGKILL on `stop`
    pub stop_grace: Duration,
    /// Wait between SIGTERM and SIGKILL on `stop_all`
    pub shutdown_grace: Duration,
    /// How long `start` waits for a local URL before reporting unknown
    pub startup_timeout: Duration,
    /// Output lines kept for crash reports
    pub output_tail_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(1),
            startup_timeout: Duration::from_secs(30),
            output_tail_lines: 200,
        }
    }
}

/// Restarts a project with a known command. Implemented by the supervisor
/// and used by the repair loop.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Restarter: Send + Sync {
    async fn restart(&self, project_path: &str, command: &SafeCommand) -> Result<StartOutcome>;
}

enum ProjectCommand {
    Start {
        command: SafeCommand,
        reply: oneshot::Sender<Result<u32>>,
    },
    Stop {
        grace: Duration,
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
struct ProjectHandle {
    commands: mpsc::Sender<ProjectCommand>,
    state: watch::Receiver<DevServerProcess>,
}

/// Owns every dev server process, keyed by project path
pub struct DevServerSupervisor {
    projects: DashMap<String, ProjectHandle>,
    /// Per-project event channels, created on first subscribe or start
    channels: DashMap<String, broadcast::Sender<DevServerEvent>>,
    launcher: Arc<dyn ProcessLauncher>,
    resolver: Arc<dyn PlanResolver>,
    signaller: Arc<dyn Signaller>,
    crashes: broadcast::Sender<CrashEvent>,
    config: SupervisorConfig,
}

impl DevServerSupervisor {
    /// Create a new supervisor
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        resolver: Arc<dyn PlanResolver>,
        signaller: Arc<dyn Signaller>,
        config: SupervisorConfig,
    ) -> Self {
        let (crashes, _) = broadcast::channel(CRASH_CHANNEL_CAPACITY);
        Self {
            projects: DashMap::new(),
            channels: DashMap::new(),
            launcher,
            resolver,
            signaller,
            crashes,
            config,
        }
    }

    /// Start the dev server for `cwd`.
    ///
    /// With no explicit command the plan resolver is consulted; low
    /// confidence plans are returned for confirmation and never launched.
    pub async fn start(&self, cwd: &Path, command: Option<&str>) -> Result<StartOutcome> {
        project_key(cwd)?;

        let command = match command {
            Some(line) => parse_command_string(line).ok_or_else(|| {
                Error::Validation(format!("command rejected: {:?}", line))
            })?,
            None => {
                let plan = self
                    .resolver
                    .resolve(cwd)
                    .await?
                    .ok_or_else(|| Error::PlanNotFound(cwd.display().to_string()))?;
                validate_plan(&plan)?;

                if plan.confidence == Confidence::Low {
                    info!(
                        "Plan for {} is low confidence (`{}`), asking the user",
                        cwd.display(),
                        command_to_string(&plan.command)
                    );
                    return Ok(StartOutcome::NeedsConfirmation { plan });
                }
                plan.command
            }
        };

        self.start_command(cwd, command).await
    }

    /// Start the dev server for `cwd` with a specific command
    pub async fn start_command(&self, cwd: &Path, command: SafeCommand) -> Result<StartOutcome> {
        let key = project_key(cwd)?;
        validate_cwd(Path::new(&key))?;
        validate_command(&command)?;

        let handle = self.handle(&key);
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .commands
            .send(ProjectCommand::Start {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Internal(format!("supervisor for {} is gone", key)))?;

        let pid = reply_rx
            .await
            .map_err(|_| Error::Internal(format!("supervisor for {} dropped start", key)))??;

        Ok(self.await_startup(&key, handle.state, pid).await)
    }

    /// Stop the dev server for `cwd`. Stopping a stopped project is a no-op.
    pub async fn stop(&self, cwd: &Path) -> Result<()> {
        let key = project_key(cwd)?;
        let Some(handle) = self.projects.get(&key).map(|h| h.value().clone()) else {
            debug!("Ignoring stop for unknown project {}", key);
            return Ok(());
        };
        send_stop(&handle, self.config.stop_grace).await;
        Ok(())
    }

    /// Stop every dev server using the shutdown grace window
    pub async fn stop_all(&self) {
        let handles: Vec<ProjectHandle> =
            self.projects.iter().map(|e| e.value().clone()).collect();
        let grace = self.config.shutdown_grace;
        join_all(handles.iter().map(|handle| send_stop(handle, grace))).await;
    }

    /// Snapshot of a project's dev server
    pub fn status(&self, cwd: &Path) -> Result<DevServerProcess> {
        let key = project_key(cwd)?;
        Ok(self
            .projects
            .get(&key)
            .map(|handle| handle.state.borrow().clone())
            .unwrap_or_else(|| DevServerProcess::new(key)))
    }

    /// Snapshot of every known project
    pub fn list(&self) -> Vec<DevServerProcess> {
        self.projects
            .iter()
            .map(|entry| entry.value().state.borrow().clone())
            .collect()
    }

    /// Subscribe to status and output events for one project.
    ///
    /// The project need not be started yet; events flow once it is.
    pub fn subscribe(&self, cwd: &Path) -> Result<broadcast::Receiver<DevServerEvent>> {
        let key = project_key(cwd)?;
        validate_cwd(Path::new(&key))?;
        self.prune_channels();
        Ok(self.channel(&key).subscribe())
    }

    /// Subscribe to crash events of every project
    pub fn crash_events(&self) -> broadcast::Receiver<CrashEvent> {
        self.crashes.subscribe()
    }

    fn handle(&self, key: &str) -> ProjectHandle {
        if let Some(handle) = self.projects.get(key) {
            return handle.value().clone();
        }

        // Channel lock is never taken while a projects entry is held.
        // The receiver pins the channel against pruning until the actor is registered.
        let events = self.channel(key);
        let _pin = events.subscribe();
        self.projects
            .entry(key.to_string())
            .or_insert_with(|| self.spawn_actor(key, events))
            .value()
            .clone()
    }

    fn channel(&self, key: &str) -> broadcast::Sender<DevServerEvent> {
        self.channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .value()
            .clone()
    }

    /// Forget channels with no listeners for projects that never started
    fn prune_channels(&self) {
        self.channels
            .retain(|key, events| events.receiver_count() > 0 || self.projects.contains_key(key));
    }

    fn spawn_actor(&self, key: &str, events: broadcast::Sender<DevServerEvent>) -> ProjectHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(DevServerProcess::new(key.to_string()));

        let actor = ProjectActor {
            key: key.to_string(),
            cwd: PathBuf::from(key),
            state: state_tx,
            events,
            crashes: self.crashes.clone(),
            launcher: self.launcher.clone(),
            signaller: self.signaller.clone(),
            child: None,
            tail: VecDeque::new(),
            tail_limit: self.config.output_tail_lines.max(1),
        };
        tokio::spawn(actor.run(commands_rx));

        ProjectHandle {
            commands: commands_tx,
            state: state_rx,
        }
    }

    async fn await_startup(
        &self,
        key: &str,
        mut state: watch::Receiver<DevServerProcess>,
        pid: u32,
    ) -> StartOutcome {
        let settled = timeout(
            self.config.startup_timeout,
            state.wait_for(|p| p.pid != Some(pid) || p.status != DevServerStatus::Starting),
        )
        .await
        .map(|result| result.is_ok());

        if settled.is_err() {
            info!(
                "No local URL from {} (pid {}) within {:?}, status unknown",
                key, pid, self.config.startup_timeout
            );
            return StartOutcome::Started { pid, url: None };
        }

        let snapshot = state.borrow().clone();
        match snapshot.status {
            DevServerStatus::Running if snapshot.pid == Some(pid) => StartOutcome::Started {
                pid,
                url: snapshot.url,
            },
            DevServerStatus::Error => StartOutcome::Failed {
                error: snapshot
                    .last_error
                    .unwrap_or_else(|| "dev server crashed".to_string()),
            },
            _ => StartOutcome::Failed {
                error: format!(
                    "dev server exited with {:?} before serving",
                    snapshot.last_exit_code
                ),
            },
        }
    }
}

#[async_trait]
impl Restarter for DevServerSupervisor {
    async fn restart(&self, project_path: &str, command: &SafeCommand) -> Result<StartOutcome> {
        self.start_command(Path::new(project_path), command.clone())
            .await
    }
}

async fn send_stop(handle: &ProjectHandle, grace: Duration) {
    let (reply_tx, reply_rx) = oneshot::channel();
    if handle
        .commands
        .send(ProjectCommand::Stop {
            grace,
            reply: reply_tx,
        })
        .await
        .is_ok()
    {
        let _ = reply_rx.await;
    }
}

/// Normalized registry key for a project directory.
///
/// `.` and `..` are resolved lexically; symlinks are not followed.
pub fn project_key(cwd: &Path) -> Result<String> {
    if !cwd.is_absolute() {
        return Err(Error::Validation(format!(
            "project path must be absolute: {}",
            cwd.display()
        )));
    }
    let mut normalized = PathBuf::new();
    for component in cwd.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized.to_string_lossy().into_owned())
}

/// Remove terminal color and control sequences
pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE.replace_all(line, "").into_owned()
}

/// First localhost URL in a line of output
pub fn detect_local_url(line: &str) -> Option<String> {
    LOCAL_URL
        .find(line)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ')', ';']).to_string())
}

struct RunningChild {
    pid: u32,
    command: SafeCommand,
    output: mpsc::Receiver<ProcessOutput>,
}

/// Single owner of one project's dev server state
struct ProjectActor {
    key: String,
    cwd: PathBuf,
    state: watch::Sender<DevServerProcess>,
    events: broadcast::Sender<DevServerEvent>,
    crashes: broadcast::Sender<CrashEvent>,
    launcher: Arc<dyn ProcessLauncher>,
    signaller: Arc<dyn Signaller>,
    child: Option<RunningChild>,
    tail: VecDeque<String>,
    tail_limit: usize,
}

impl ProjectActor {
    async fn run(mut self, mut commands: mpsc::Receiver<ProjectCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ProjectCommand::Start { command, reply }) => {
                        let result = self.start(command).await;
                        let _ = reply.send(result);
                    }
                    Some(ProjectCommand::Stop { grace, reply }) => {
                        self.stop(grace).await;
                        let _ = reply.send(());
                    }
                    None => break,
                },
                output = next_output(&mut self.child) => self.on_output(output),
            }
        }
        debug!("Supervisor for {} shut down", self.key);
    }

    fn status(&self) -> DevServerStatus {
        self.state.borrow().status
    }

    /// Apply a mutation and publish the new snapshot
    fn update(&self, mutate: impl FnOnce(&mut DevServerProcess)) {
        self.state.send_modify(mutate);
        let process = self.state.borrow().clone();
        let _ = self.events.send(DevServerEvent::Status { process });
    }

    async fn start(&mut self, command: SafeCommand) -> Result<u32> {
        if let Some(child) = &self.child {
            debug!(
                "Dev server for {} already {} (pid {})",
                self.key,
                self.status().as_str(),
                child.pid
            );
            return Ok(child.pid);
        }

        // Re-check right before the launch call
        validate_command(&command)?;

        if self.status() == DevServerStatus::Error {
            self.update(|p| {
                p.transition_to(DevServerStatus::Stopped);
            });
        }

        let launched = match self.launcher.launch(&command, &self.cwd).await {
            Ok(launched) => launched,
            Err(e) => {
                warn!("Failed to launch dev server for {}: {}", self.key, e);
                let message = e.to_string();
                self.update(|p| p.last_error = Some(message));
                return Err(e);
            }
        };

        let pid = launched.pid;
        info!(
            "Dev server for {} starting: `{}` (pid {})",
            self.key,
            command_to_string(&command),
            pid
        );

        self.tail.clear();
        let launched_command = command.clone();
        self.update(move |p| {
            p.transition_to(DevServerStatus::Starting);
            p.pid = Some(pid);
            p.url = None;
            p.command = Some(launched_command);
            p.started_at = Some(Utc::now());
            p.last_exit_code = None;
            p.last_error = None;
        });

        self.child = Some(RunningChild {
            pid,
            command,
            output: launched.output,
        });
        Ok(pid)
    }

    async fn stop(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            if self.status() == DevServerStatus::Error {
                self.update(|p| {
                    p.transition_to(DevServerStatus::Stopped);
                });
            }
            debug!("Dev server for {} already stopped", self.key);
            return;
        };

        let pid = child.pid;
        info!("Stopping dev server for {} (pid {})", self.key, pid);

        let mut exit_code = None;
        let exited = async {
            while let Some(output) = child.output.recv().await {
                if let ProcessOutput::Exit(code) = output {
                    exit_code = code;
                    break;
                }
            }
        };
        let outcome = terminate_with_grace(
            self.signaller.as_ref(),
            SignalTarget::Group(pid),
            exited,
            grace,
        )
        .await;
        debug!("Dev server for {} stop outcome: {:?}", self.key, outcome);

        self.update(|p| {
            p.transition_to(DevServerStatus::Stopped);
            p.pid = None;
            p.url = None;
            p.last_exit_code = exit_code;
        });
    }

    fn on_output(&mut self, output: ProcessOutput) {
        match output {
            ProcessOutput::Stdout(line) | ProcessOutput::Stderr(line) => self.on_line(line),
            ProcessOutput::Exit(code) => self.on_exit(code),
        }
    }

    fn on_line(&mut self, line: String) {
        let line = strip_ansi(&line);

        if self.status() == DevServerStatus::Starting {
            if let Some(url) = detect_local_url(&line) {
                info!("Dev server for {} is serving {}", self.key, url);
                self.update(|p| {
                    p.transition_to(DevServerStatus::Running);
                    p.url = Some(url);
                });
            }
        }

        if self.tail.len() == self.tail_limit {
            self.tail.pop_front();
        }
        self.tail.push_back(line.clone());
        let _ = self.events.send(DevServerEvent::Output { line });
    }

    fn on_exit(&mut self, code: Option<i32>) {
        let Some(child) = self.child.take() else {
            return;
        };

        match code {
            Some(code) if code != 0 => {
                warn!(
                    "Dev server for {} (pid {}) crashed with exit code {}",
                    self.key, child.pid, code
                );
                self.update(|p| {
                    p.transition_to(DevServerStatus::Error);
                    p.pid = None;
                    p.last_exit_code = Some(code);
                    p.last_error = Some(format!("exited with code {}", code));
                });

                let crash = CrashEvent {
                    project_path: self.key.clone(),
                    pid: child.pid,
                    exit_code: Some(code),
                    command: child.command,
                    output_tail: self.tail.iter().cloned().collect(),
                    at: Utc::now(),
                };
                if self.crashes.send(crash).is_err() {
                    debug!("No crash listeners for {}", self.key);
                }
            }
            _ => {
                info!(
                    "Dev server for {} (pid {}) exited with {:?}",
                    self.key, child.pid, code
                );
                self.update(|p| {
                    p.transition_to(DevServerStatus::Stopped);
                    p.pid = None;
                    p.url = None;
                    p.last_exit_code = code;
                });
            }
        }
    }
}

/// Next output from the running child; pending forever when there is none
async fn next_output(child: &mut Option<RunningChild>) -> ProcessOutput {
    match child {
        Some(child) => child
            .output
            .recv()
            .await
            .unwrap_or(ProcessOutput::Exit(None)),
        None => std::future::pending().await,
    }
}
