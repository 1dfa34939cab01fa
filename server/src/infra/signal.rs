//! Signal delivery and graceful-then-forceful termination

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Signals the supervisor sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

/// What a signal is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    /// A single process
    Process(u32),
    /// Every process in the group led by this pid
    Group(u32),
}

impl SignalTarget {
    pub fn pid(&self) -> u32 {
        match self {
            SignalTarget::Process(pid) | SignalTarget::Group(pid) => *pid,
        }
    }
}

/// Result of a delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The target no longer exists
    NoSuchProcess,
}

/// How a termination ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// Exited within the grace window
    Graceful,
    /// Needed SIGKILL
    Forced,
    /// Was already gone when SIGTERM was sent
    AlreadyExited,
}

/// Sends OS signals
#[cfg_attr(test, mockall::automock)]
pub trait Signaller: Send + Sync {
    fn send(&self, target: SignalTarget, signal: Signal) -> Result<Delivery>;
}

/// Signaller backed by `kill(2)`
#[derive(Debug, Default, Clone, Copy)]
pub struct NixSignaller;

impl Signaller for NixSignaller {
    #[cfg(unix)]
    fn send(&self, target: SignalTarget, signal: Signal) -> Result<Delivery> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, killpg, Signal as NixSignal};
        use nix::unistd::Pid;

        let sig = match signal {
            Signal::Terminate => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
        };

        let pid = i32::try_from(target.pid())
            .map_err(|_| Error::InvalidParameter(format!("pid out of range: {}", target.pid())))?;

        let result = match target {
            SignalTarget::Process(_) => kill(Pid::from_raw(pid), sig),
            SignalTarget::Group(_) => killpg(Pid::from_raw(pid), sig),
        };

        match result {
            Ok(()) => Ok(Delivery::Delivered),
            Err(Errno::ESRCH) => Ok(Delivery::NoSuchProcess),
            Err(e) => Err(Error::Internal(format!(
                "failed to send {:?} to {:?}: {}",
                signal, target, e
            ))),
        }
    }

    #[cfg(not(unix))]
    fn send(&self, _target: SignalTarget, _signal: Signal) -> Result<Delivery> {
        Err(Error::Internal(
            "Process signalling not supported on this platform".to_string(),
        ))
    }
}

/// Send SIGTERM, wait up to `grace` for `exited` to resolve, then SIGKILL.
///
/// SIGKILL is sent at most once, and only when the grace window elapses.
pub async fn terminate_with_grace<F>(
    signaller: &dyn Signaller,
    target: SignalTarget,
    exited: F,
    grace: Duration,
) -> KillOutcome
where
    F: Future<Output = ()>,
{
    match signaller.send(target, Signal::Terminate) {
        Ok(Delivery::Delivered) => {}
        Ok(Delivery::NoSuchProcess) => {
            debug!("{:?} already exited before SIGTERM", target);
            return KillOutcome::AlreadyExited;
        }
        Err(e) => warn!("SIGTERM to {:?} failed: {}", target, e),
    }

    if timeout(grace, exited).await.is_ok() {
        return KillOutcome::Graceful;
    }

    warn!(
        "{:?} did not exit within {:?}, sending SIGKILL",
        target, grace
    );
    if let Err(e) = signaller.send(target, Signal::Kill) {
        warn!("SIGKILL to {:?} failed: {}", target, e);
    }
    KillOutcome::Forced
}
