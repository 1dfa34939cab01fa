//! Test harness for the devshell HTTP bridge
//!
//! Each test boots its own server on an ephemeral port.

use std::path::Path;

use devshell_server::api::http::create_router;
use devshell_server::{AppState, Config};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Fast timeouts and `/bin/sh` PTYs opening in `workdir`
pub fn test_config(workdir: &Path) -> Config {
    Config {
        default_shell: "/bin/sh".to_string(),
        default_cwd: Some(workdir.to_string_lossy().into_owned()),
        kill_grace_ms: 500,
        shutdown_grace_ms: 100,
        startup_timeout: 2,
        ..Config::default()
    }
}

/// A running server plus an HTTP client pointed at it
pub struct TestServer {
    pub client: reqwest::Client,
    pub state: AppState,
    addr: std::net::SocketAddr,
    _shutdown: watch::Sender<bool>,
}

impl TestServer {
    /// Start a server whose PTYs open in `workdir`
    pub async fn start(workdir: &Path) -> Self {
        Self::with_config(test_config(workdir)).await
    }

    pub async fn with_config(config: Config) -> Self {
        let state = AppState::build(config);
        let (shutdown, shutdown_rx) = watch::channel(false);
        state.spawn_background(shutdown_rx);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("Failed to read local address");

        let app = create_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .await
                .expect("Test server failed");
        });

        Self {
            client: reqwest::Client::new(),
            state,
            addr,
            _shutdown: shutdown,
        }
    }

    /// Get full API URL
    pub fn api_url(&self, path: &str) -> String {
        format!("http://{}/api/v1{}", self.addr, path)
    }

    /// Get WebSocket URL
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}/api/v1{}", self.addr, path)
    }
}

/// Health check response
#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub pty_sessions: usize,
}

/// Error response
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
}

/// PTY session
#[derive(Debug, Deserialize)]
pub struct PtyResponse {
    pub id: String,
    pub pid: u32,
    pub shell: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
}

/// MCP session
#[derive(Debug, Deserialize)]
pub struct McpSessionResponse {
    pub session_id: String,
    pub project_path: String,
    pub last_activity: String,
}

/// Dev server status
#[derive(Debug, Deserialize)]
pub struct DevServerResponse {
    pub project_path: String,
    pub status: String,
    pub pid: Option<u32>,
}
