//! Crash log files shared with the repair agent and the user

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::domain::dev_server::CrashEvent;
use crate::error::{Error, Result};
use crate::service::validator::command_to_string;

/// Characters of the repair id used in the file name
const REPAIR_ID_PREFIX_LEN: usize = 8;

/// Path of the crash log for a repair: `<dir>/.dev-crash.<id prefix>.log`
pub fn crash_log_path(dir: &Path, repair_id: &str) -> PathBuf {
    let prefix: String = repair_id.chars().take(REPAIR_ID_PREFIX_LEN).collect();
    dir.join(format!(".dev-crash.{}.log", prefix))
}

/// Append a crash report to `path`, creating the file if needed
pub async fn append_crash(path: &Path, heading: &str, crash: &CrashEvent) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    file.write_all(render_crash(heading, crash).as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

impl From<&CrashEvent> for Error {
    fn from(crash: &CrashEvent) -> Self {
        Error::Crash {
            exit_code: crash.exit_code,
            message: crash_summary(crash),
        }
    }
}

/// One-line summary handed to the repair agent
pub fn crash_summary(crash: &CrashEvent) -> String {
    let last_line = crash
        .output_tail
        .iter()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(String::as_str)
        .unwrap_or("<no output>");

    format!(
        "`{}` exited with code {} in {}: {}",
        command_to_string(&crash.command),
        exit_code_label(crash.exit_code),
        crash.project_path,
        last_line
    )
}

fn exit_code_label(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn render_crash(heading: &str, crash: &CrashEvent) -> String {
    let mut out = String::new();
    out.push_str(&format!("==== {} ====\n", heading));
    out.push_str(&format!("time:      {}\n", crash.at.to_rfc3339()));
    out.push_str(&format!("project:   {}\n", crash.project_path));
    out.push_str(&format!("command:   {}\n", command_to_string(&crash.command)));
    out.push_str(&format!("pid:       {}\n", crash.pid));
    out.push_str(&format!("exit code: {}\n", exit_code_label(crash.exit_code)));
    out.push_str("---- output (most recent last) ----\n");
    for line in &crash.output_tail {
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}
