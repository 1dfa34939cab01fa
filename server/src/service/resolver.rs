//! Dev server plan resolution
//!
//! Framework detection lives outside the supervisor. The supervisor only
//! sees the [`PlanResolver`] trait and treats whatever comes back as
//! untrusted input. [`PackageJsonResolver`] is a small default that reads
//! `package.json` scripts and lockfiles.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::domain::command::{Confidence, DevServerPlan, SafeCommand};
use crate::error::Result;

/// Resolves how to start a project's dev server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlanResolver: Send + Sync {
    /// `Ok(None)` means the project type is unknown
    async fn resolve(&self, project: &Path) -> Result<Option<DevServerPlan>>;
}

/// Lockfiles in priority order
const LOCKFILES: &[(&str, &str)] = &[
    ("pnpm-lock.yaml", "pnpm"),
    ("yarn.lock", "yarn"),
    ("bun.lockb", "bun"),
    ("bun.lock", "bun"),
    ("package-lock.json", "npm"),
];

/// Scripts that start a dev server, preferred first
const DEV_SCRIPTS: &[&str] = &["dev", "start", "serve"];

#[derive(Debug, Default, Deserialize)]
struct PackageJson {
    #[serde(default)]
    scripts: HashMap<String, String>,
}

/// Resolver that inspects `package.json`
#[derive(Debug, Default, Clone, Copy)]
pub struct PackageJsonResolver;

#[async_trait]
impl PlanResolver for PackageJsonResolver {
    async fn resolve(&self, project: &Path) -> Result<Option<DevServerPlan>> {
        let manifest = project.join("package.json");
        let contents = match tokio::fs::read_to_string(&manifest).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No package.json in {}", project.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let package: PackageJson = match serde_json::from_str(&contents) {
            Ok(package) => package,
            Err(e) => {
                debug!("Unreadable package.json in {}: {}", project.display(), e);
                return Ok(None);
            }
        };

        let mut reasons = Vec::new();
        let mut detection = HashMap::new();

        let lockfile = LOCKFILES
            .iter()
            .find(|(file, _)| project.join(file).is_file());
        let manager = match lockfile {
            Some((file, manager)) => {
                reasons.push(format!("found {}", file));
                detection.insert("lockfile".to_string(), serde_json::json!(file));
                manager.to_string()
            }
            None => {
                reasons.push("no lockfile, assuming npm".to_string());
                "npm".to_string()
            }
        };

        let Some((script_name, script_body)) = DEV_SCRIPTS
            .iter()
            .find_map(|name| package.scripts.get(*name).map(|body| (*name, body)))
        else {
            debug!("No dev script in {}", manifest.display());
            return Ok(None);
        };
        reasons.push(format!("script `{}`: {}", script_name, script_body));
        detection.insert("script".to_string(), serde_json::json!(script_name));

        let confidence = match (lockfile.is_some(), script_name == "dev") {
            (true, true) => Confidence::High,
            (false, false) => Confidence::Low,
            _ => Confidence::Medium,
        };

        let args = if manager == "npm" || script_name != "dev" {
            vec!["run".to_string(), script_name.to_string()]
        } else {
            vec![script_name.to_string()]
        };

        Ok(Some(DevServerPlan {
            cwd: project.to_path_buf(),
            manager: manager.clone(),
            command: SafeCommand::new(manager, args),
            port: parse_port(script_body),
            confidence,
            reasons,
            detection,
        }))
    }
}

/// Extract `--port N`, `--port=N` or `-p N` from a script body
fn parse_port(script: &str) -> Option<u32> {
    let mut tokens = script.split_whitespace();
    while let Some(token) = tokens.next() {
        if let Some(value) = token.strip_prefix("--port=") {
            return value.parse().ok();
        }
        if token == "--port" || token == "-p" {
            return tokens.next().and_then(|value| value.parse().ok());
        }
    }
    None
}
