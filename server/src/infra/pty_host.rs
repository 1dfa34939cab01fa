//! Native pseudo-terminal spawning

use std::io::{Read, Write};
use std::path::Path;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Resizes the terminal behind a session
pub trait PtyResizer: Send {
    fn resize(&self, size: TermSize) -> Result<()>;
}

impl PtyResizer for Box<dyn MasterPty + Send> {
    fn resize(&self, size: TermSize) -> Result<()> {
        MasterPty::resize(&**self, size.into())
            .map_err(|e| Error::Internal(format!("PTY resize failed: {}", e)))
    }
}

/// A freshly spawned shell and its terminal handles
pub struct SpawnedPty {
    pub pid: u32,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub resizer: Box<dyn PtyResizer>,
    /// Resolves with the exit code once the shell exits
    pub exit: oneshot::Receiver<Option<i32>>,
}

/// Allocates pseudo-terminals. Implementations may block.
#[cfg_attr(test, mockall::automock)]
pub trait PtyHost: Send + Sync {
    fn spawn(&self, shell: &str, cwd: &Path, size: TermSize) -> Result<SpawnedPty>;
}

/// Host backed by the platform PTY implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyHost;

impl PtyHost for NativePtyHost {
    fn spawn(&self, shell: &str, cwd: &Path, size: TermSize) -> Result<SpawnedPty> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(size.into())
            .map_err(|e| Error::Spawn(format!("openpty failed: {}", e)))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::Spawn(format!("{}: {}", shell, e)))?;
        // The child holds its own copy of the slave side
        drop(pair.slave);

        let pid = child
            .process_id()
            .ok_or_else(|| Error::Spawn("shell exited before reporting a pid".to_string()))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::Spawn(format!("PTY reader unavailable: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::Spawn(format!("PTY writer unavailable: {}", e)))?;

        let (exit_tx, exit_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name(format!("pty-wait-{}", pid))
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => i32::try_from(status.exit_code()).ok(),
                    Err(e) => {
                        warn!("Failed to wait for shell {}: {}", pid, e);
                        None
                    }
                };
                debug!("Shell {} exited with {:?}", pid, code);
                let _ = exit_tx.send(code);
            })
            .map_err(|e| Error::Spawn(format!("failed to start PTY waiter: {}", e)))?;

        Ok(SpawnedPty {
            pid,
            reader,
            writer,
            resizer: Box::new(pair.master),
            exit: exit_rx,
        })
    }
}
