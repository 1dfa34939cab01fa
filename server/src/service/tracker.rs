//! Live resource usage for supervised processes

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

use crate::domain::types::{ProcessKind, TrackedProcess};
use crate::service::dev_server::DevServerSupervisor;
use crate::service::pty::PtyRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Usage {
    cpu_percent: Option<f32>,
    rss_bytes: Option<u64>,
}

/// Keeps one `System` so CPU usage is a delta between refreshes
struct Sampler {
    system: System,
    /// Pids refreshed at least once; CPU is meaningless before that
    seen: HashSet<u32>,
}

impl Sampler {
    fn new() -> Self {
        Self {
            system: System::new(),
            seen: HashSet::new(),
        }
    }

    fn sample(&mut self, pids: &[u32]) -> HashMap<u32, Usage> {
        let targets: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&targets),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );

        let mut usage = HashMap::new();
        for pid in pids {
            let entry = match self.system.process(Pid::from_u32(*pid)) {
                Some(process) => Usage {
                    cpu_percent: self.seen.contains(pid).then(|| process.cpu_usage()),
                    rss_bytes: Some(process.memory()),
                },
                None => {
                    debug!("Process {} not found while sampling", pid);
                    Usage::default()
                }
            };
            usage.insert(*pid, entry);
        }

        self.seen.retain(|pid| usage.get(pid).is_some_and(|u| u.rss_bytes.is_some()));
        self.seen.extend(
            usage
                .iter()
                .filter(|(_, u)| u.rss_bytes.is_some())
                .map(|(pid, _)| *pid),
        );
        usage
    }
}

/// Joins the PTY and dev server registries with OS metrics
pub struct ProcessTracker {
    ptys: Arc<PtyRegistry>,
    dev_servers: Arc<DevServerSupervisor>,
    sampler: Mutex<Sampler>,
}

impl ProcessTracker {
    pub fn new(ptys: Arc<PtyRegistry>, dev_servers: Arc<DevServerSupervisor>) -> Self {
        Self {
            ptys,
            dev_servers,
            sampler: Mutex::new(Sampler::new()),
        }
    }

    /// Every supervised process with its current usage. Blocking.
    pub fn snapshot(&self) -> Vec<TrackedProcess> {
        let mut tracked: Vec<TrackedProcess> = self
            .ptys
            .list()
            .into_iter()
            .map(|session| TrackedProcess {
                kind: ProcessKind::Pty,
                key: session.id,
                pid: session.pid,
                status: "open".to_string(),
                cpu_percent: None,
                rss_bytes: None,
            })
            .collect();

        tracked.extend(self.dev_servers.list().into_iter().filter_map(|process| {
            Some(TrackedProcess {
                kind: ProcessKind::DevServer,
                pid: process.pid?,
                status: process.status.as_str().to_string(),
                key: process.project_path,
                cpu_percent: None,
                rss_bytes: None,
            })
        }));

        let pids: Vec<u32> = tracked.iter().map(|p| p.pid).collect();
        let usage = {
            let mut sampler = match self.sampler.lock() {
                Ok(sampler) => sampler,
                Err(poisoned) => poisoned.into_inner(),
            };
            sampler.sample(&pids)
        };

        for process in &mut tracked {
            if let Some(u) = usage.get(&process.pid) {
                process.cpu_percent = u.cpu_percent;
                process.rss_bytes = u.rss_bytes;
            }
        }
        tracked
    }
}
