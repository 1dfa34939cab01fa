//! Child process launcher

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::command::SafeCommand;
use crate::error::{Error, Result};
use crate::service::validator::{command_to_string, validate_command};

/// Output capacity per child before readers apply backpressure
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Process output event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    Stdout(String),
    Stderr(String),
    /// Final event. `None` when the process was terminated by a signal.
    Exit(Option<i32>),
}

/// A running child and its output stream
#[derive(Debug)]
pub struct LaunchedProcess {
    /// Process id, also the process group id
    pub pid: u32,
    pub output: mpsc::Receiver<ProcessOutput>,
}

/// Launches validated commands as OS processes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, command: &SafeCommand, cwd: &Path) -> Result<LaunchedProcess>;
}

/// Launcher that spawns real child processes, each in its own process group
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLauncher;

#[async_trait]
impl ProcessLauncher for NativeLauncher {
    async fn launch(&self, command: &SafeCommand, cwd: &Path) -> Result<LaunchedProcess> {
        // Last gate before the OS sees the command.
        validate_command(command)?;

        let mut cmd = Command::new(command.bin());
        cmd.args(command.args())
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Spawn(format!("{}: {}", command_to_string(command), e))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Spawn("process exited before reporting a pid".to_string()))?;

        info!(
            "Launched `{}` in {} (pid {})",
            command_to_string(command),
            cwd.display(),
            pid
        );

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        let stdout_handle = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, tx.clone(), ProcessOutput::Stdout)));
        let stderr_handle = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, tx.clone(), ProcessOutput::Stderr)));

        tokio::spawn(async move {
            let status = child.wait().await;

            // Drain remaining output before reporting the exit
            if let Some(handle) = stdout_handle {
                let _ = handle.await;
            }
            if let Some(handle) = stderr_handle {
                let _ = handle.await;
            }

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait for pid {}: {}", pid, e);
                    None
                }
            };
            debug!("pid {} exited with {:?}", pid, code);
            let _ = tx.send(ProcessOutput::Exit(code)).await;
        });

        Ok(LaunchedProcess { pid, output: rx })
    }
}

async fn forward_lines<R>(
    reader: R,
    tx: mpsc::Sender<ProcessOutput>,
    wrap: fn(String) -> ProcessOutput,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(wrap(line)).await.is_err() {
            break;
        }
    }
}
