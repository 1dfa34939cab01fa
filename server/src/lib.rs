//! devshell supervisor
//!
//! Local process supervision for an IDE shell: PTY sessions, per-project dev
//! servers, a self-healing repair loop for crashed dev servers, MCP bridge
//! sessions with an idle TTL, and an HTTP bridge exposing all of it.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod service;

pub use crate::config::Config;
pub use error::{Error, Result};

use infra::process::NativeLauncher;
use infra::pty_host::NativePtyHost;
use infra::signal::NixSignaller;
use service::agent_bridge::BridgeRepairAgent;
use service::dev_server::DevServerSupervisor;
use service::pty::PtyRegistry;
use service::reaper::{spawn_reaper, McpSessionStore};
use service::repair::RepairLoop;
use service::resolver::PackageJsonResolver;
use service::tracker::ProcessTracker;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ptys: Arc<PtyRegistry>,
    pub dev_servers: Arc<DevServerSupervisor>,
    pub repair: Arc<RepairLoop>,
    pub agent: Arc<BridgeRepairAgent>,
    pub mcp_sessions: Arc<McpSessionStore>,
    pub tracker: Arc<ProcessTracker>,
}

impl AppState {
    /// Wire the native backends
    pub fn build(config: Config) -> Self {
        let config = Arc::new(config);
        let signaller = Arc::new(NixSignaller);

        let ptys = Arc::new(PtyRegistry::new(
            Arc::new(NativePtyHost),
            signaller.clone(),
            config.pty_config(),
        ));

        let dev_servers = Arc::new(DevServerSupervisor::new(
            Arc::new(NativeLauncher),
            Arc::new(PackageJsonResolver),
            signaller,
            config.supervisor_config(),
        ));

        let agent = Arc::new(BridgeRepairAgent::new());
        let repair = Arc::new(RepairLoop::new(
            config.repair_config(),
            agent.clone(),
            dev_servers.clone(),
        ));

        let tracker = Arc::new(ProcessTracker::new(ptys.clone(), dev_servers.clone()));

        Self {
            config,
            ptys,
            dev_servers,
            repair,
            agent,
            mcp_sessions: Arc::new(McpSessionStore::new()),
            tracker,
        }
    }

    /// Start the repair loop and the MCP session reaper
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let repair = tokio::spawn(
            self.repair
                .clone()
                .run(self.dev_servers.crash_events()),
        );

        let reaper = spawn_reaper(
            self.mcp_sessions.clone(),
            self.config.mcp_sweep_interval(),
            self.config.mcp_ttl(),
            shutdown,
        );

        vec![repair, reaper]
    }

    /// Terminate every supervised process
    pub async fn shutdown(&self) {
        info!("Terminating supervised processes");
        tokio::join!(self.ptys.kill_all(), self.dev_servers.stop_all());
    }
}
