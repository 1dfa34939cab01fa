//! Infrastructure layer

pub mod crash_log;
pub mod process;
pub mod pty_host;
pub mod signal;
