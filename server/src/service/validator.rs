//! Command validation
//!
//! Every command that reaches an OS launcher goes through this module.
//! Binaries are checked against a closed allowlist and every argument is
//! filtered for shell metacharacters and smuggled dangerous binaries. Nothing
//! here ever builds a shell string.

use std::path::Path;

use crate::domain::command::{DevServerPlan, SafeCommand};
use crate::error::{Error, Result};

/// Binaries a dev server command may start with
const ALLOWED_BINS: &[&str] = &["npm", "pnpm", "yarn", "bun", "bunx", "node", "npx", "deno"];

/// Words rejected as standalone arguments
const DANGEROUS_WORDS: &[&str] = &[
    "bash", "sh", "zsh", "curl", "wget", "python", "python3", "ruby", "perl", "sudo", "rm",
    "eval", "exec",
];

/// Characters that must never appear in an argument
const FORBIDDEN_CHARS: &[char] = &[
    ';', '|', '&', '$', '<', '>', '`', '(', ')', '\n', '\r', '\0',
];

/// Shells a PTY session may run
const ALLOWED_SHELLS: &[&str] = &[
    "/bin/bash",
    "/bin/zsh",
    "/bin/sh",
    "/bin/fish",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/fish",
    "/usr/local/bin/zsh",
    "/usr/local/bin/fish",
    "/opt/homebrew/bin/zsh",
    "/opt/homebrew/bin/fish",
];

/// Check a binary name against the allowlist
pub fn is_allowed_bin(bin: &str) -> bool {
    ALLOWED_BINS.contains(&bin)
}

/// Check a single argument
pub fn is_clean_arg(arg: &str) -> bool {
    !arg.is_empty()
        && !arg.contains(FORBIDDEN_CHARS)
        && !DANGEROUS_WORDS.contains(&arg.to_ascii_lowercase().as_str())
}

/// Validate a command before it is launched
pub fn validate_command(cmd: &SafeCommand) -> Result<()> {
    if !is_allowed_bin(cmd.bin()) {
        return Err(Error::Validation(format!(
            "binary not allowed: {}",
            cmd.bin()
        )));
    }

    if let Some(arg) = cmd.args().iter().find(|arg| !is_clean_arg(arg)) {
        return Err(Error::Validation(format!(
            "argument rejected: {:?}",
            arg
        )));
    }

    Ok(())
}

/// Validate a resolved dev server plan, including its embedded command
pub fn validate_plan(plan: &DevServerPlan) -> Result<()> {
    if !plan.cwd.is_absolute() {
        return Err(Error::Validation(format!(
            "plan cwd must be absolute: {}",
            plan.cwd.display()
        )));
    }

    if let Some(port) = plan.port {
        if !(1..=65535).contains(&port) {
            return Err(Error::Validation(format!("port out of range: {}", port)));
        }
    }

    validate_command(&plan.command)
}

/// Parse a whitespace-separated command line.
///
/// Returns `None` when the string is empty, starts with a binary outside the
/// allowlist, or contains any argument that fails [`is_clean_arg`].
pub fn parse_command_string(s: &str) -> Option<SafeCommand> {
    let mut tokens = s.split_whitespace();
    let bin = tokens.next()?;
    if !is_allowed_bin(bin) {
        return None;
    }

    let args: Vec<String> = tokens.map(str::to_string).collect();
    if !args.iter().all(|arg| is_clean_arg(arg)) {
        return None;
    }

    Some(SafeCommand::new(bin, args))
}

/// Render a command for display and logs
pub fn command_to_string(cmd: &SafeCommand) -> String {
    std::iter::once(cmd.bin())
        .chain(cmd.args().iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Validate the program a PTY session runs
pub fn validate_shell(shell: &str) -> Result<()> {
    if ALLOWED_SHELLS.contains(&shell) {
        Ok(())
    } else {
        Err(Error::Validation(format!("shell not allowed: {}", shell)))
    }
}

/// Validate a working directory for a new process
pub fn validate_cwd(cwd: &Path) -> Result<()> {
    if !cwd.is_absolute() {
        return Err(Error::Validation(format!(
            "working directory must be absolute: {}",
            cwd.display()
        )));
    }
    if !cwd.is_dir() {
        return Err(Error::Validation(format!(
            "working directory does not exist: {}",
            cwd.display()
        )));
    }
    Ok(())
}
