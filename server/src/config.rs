//! Server configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::service::dev_server::SupervisorConfig;
use crate::service::pty::PtyConfig;
use crate::service::repair::RepairConfig;

/// Optional config file read from the working directory
pub const CONFIG_FILE: &str = "devshell.toml";

/// Prefix of environment overrides, e.g. `DEVSHELL_HTTP_PORT`
pub const ENV_PREFIX: &str = "DEVSHELL";

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP bridge host
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// HTTP bridge port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Browser origins allowed to call the bridge. Requests carrying any
    /// other `Origin` header are refused; clients that send none are served.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Shell used when a PTY request names none
    #[serde(default = "default_shell")]
    pub default_shell: String,

    /// Starting directory for PTYs; the home directory when unset
    #[serde(default)]
    pub default_cwd: Option<String>,

    #[serde(default = "default_max_pty_sessions")]
    pub max_pty_sessions: usize,

    /// SIGTERM to SIGKILL window for user-initiated kills, in milliseconds
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// SIGTERM to SIGKILL window during shutdown, in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// How long a dev server start waits for a local URL, in seconds
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: u64,

    #[serde(default = "default_output_tail_lines")]
    pub output_tail_lines: usize,

    /// Repair attempts per incident
    #[serde(default = "default_repair_max_iterations")]
    pub repair_max_iterations: u32,

    /// Crash-free period that confirms a fix, in seconds
    #[serde(default = "default_verify_window")]
    pub verify_window: u64,

    /// Repair agent silence before giving up, in seconds
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout: u64,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Crash log directory; each project's own directory when unset
    #[serde(default)]
    pub crash_log_dir: Option<String>,

    /// MCP session idle TTL in seconds
    #[serde(default = "default_mcp_ttl")]
    pub mcp_ttl: u64,

    /// MCP reaper sweep interval in seconds
    #[serde(default = "default_mcp_sweep_interval")]
    pub mcp_sweep_interval: u64,
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    7878
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_max_pty_sessions() -> usize {
    32
}

fn default_kill_grace_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_ms() -> u64 {
    1_000
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_output_tail_lines() -> usize {
    200
}

fn default_repair_max_iterations() -> u32 {
    3
}

fn default_verify_window() -> u64 {
    15
}

fn default_agent_timeout() -> u64 {
    600 // 10 minutes
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_mcp_ttl() -> u64 {
    1_800 // 30 minutes
}

fn default_mcp_sweep_interval() -> u64 {
    300 // 5 minutes
}

impl Config {
    /// Load `devshell.toml` (if present) overridden by `DEVSHELL_*` variables
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Load from a specific file, which may be missing
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("allowed_origins"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn pty_config(&self) -> PtyConfig {
        PtyConfig {
            default_shell: self.default_shell.clone(),
            default_cwd: self.default_cwd.as_ref().map(PathBuf::from),
            max_sessions: self.max_pty_sessions,
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            ..PtyConfig::default()
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            stop_grace: Duration::from_millis(self.kill_grace_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            startup_timeout: Duration::from_secs(self.startup_timeout),
            output_tail_lines: self.output_tail_lines,
        }
    }

    pub fn repair_config(&self) -> RepairConfig {
        RepairConfig {
            max_iterations: self.repair_max_iterations,
            verify_window: Duration::from_secs(self.verify_window),
            agent_timeout: Duration::from_secs(self.agent_timeout),
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            crash_log_dir: self.crash_log_dir.as_ref().map(PathBuf::from),
        }
    }

    pub fn mcp_ttl(&self) -> Duration {
        Duration::from_secs(self.mcp_ttl)
    }

    pub fn mcp_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.mcp_sweep_interval)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_host: default_http_host(),
            http_port: default_http_port(),
            allowed_origins: Vec::new(),
            default_shell: default_shell(),
            default_cwd: None,
            max_pty_sessions: default_max_pty_sessions(),
            kill_grace_ms: default_kill_grace_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            startup_timeout: default_startup_timeout(),
            output_tail_lines: default_output_tail_lines(),
            repair_max_iterations: default_repair_max_iterations(),
            verify_window: default_verify_window(),
            agent_timeout: default_agent_timeout(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            crash_log_dir: None,
            mcp_ttl: default_mcp_ttl(),
            mcp_sweep_interval: default_mcp_sweep_interval(),
        }
    }
}
