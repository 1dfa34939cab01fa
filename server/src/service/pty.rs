//! PTY session registry

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::pty::{PtyEvent, PtySession, SpawnOptions};
use crate::error::{Error, Result};
use crate::infra::pty_host::{PtyHost, PtyResizer, TermSize};
use crate::infra::signal::{terminate_with_grace, Signal, SignalTarget, Signaller};
use crate::service::validator::{validate_cwd, validate_shell};

/// Buffered events per session before slow subscribers start lagging
const EVENT_CHANNEL_CAPACITY: usize = 1024;
const READ_BUFFER_SIZE: usize = 4096;

/// PTY registry settings
#[derive(Debug, Clone)]
pub struct PtyConfig {
    pub default_shell: String,
    pub default_cwd: Option<PathBuf>,
    pub max_sessions: usize,
    pub default_cols: u16,
    pub default_rows: u16,
    /// Wait between SIGTERM and SIGKILL on `kill`
    pub kill_grace: Duration,
    /// Wait between SIGTERM and SIGKILL on `kill_all`
    pub shutdown_grace: Duration,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            default_shell: "/bin/bash".to_string(),
            default_cwd: None,
            max_sessions: 32,
            default_cols: 80,
            default_rows: 24,
            kill_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Live session state
struct PtyInstance {
    session: std::sync::Mutex<PtySession>,
    writer: Mutex<Box<dyn Write + Send>>,
    resizer: Mutex<Box<dyn PtyResizer>>,
    events: broadcast::Sender<PtyEvent>,
    exited: watch::Receiver<bool>,
    killing: AtomicBool,
}

impl PtyInstance {
    fn snapshot(&self) -> PtySession {
        match self.session.lock() {
            Ok(session) => session.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn pid(&self) -> u32 {
        self.snapshot().pid
    }
}

/// Live plus in-flight sessions, bounded by `max_sessions`
struct Slots {
    used: AtomicUsize,
    max: usize,
}

impl Slots {
    fn reserve(self: &Arc<Self>) -> Option<Reservation> {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.max).then_some(used + 1)
            })
            .ok()
            .map(|_| Reservation {
                slots: self.clone(),
                committed: false,
            })
    }

    fn release(&self) {
        self.used.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A slot held by a spawn in progress; returned on drop unless committed
struct Reservation {
    slots: Arc<Slots>,
    committed: bool,
}

impl Reservation {
    /// The slot now belongs to a registered session
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.slots.release();
        }
    }
}

/// Owns every interactive shell session
pub struct PtyRegistry {
    sessions: Arc<DashMap<String, Arc<PtyInstance>>>,
    slots: Arc<Slots>,
    host: Arc<dyn PtyHost>,
    signaller: Arc<dyn Signaller>,
    config: PtyConfig,
}

impl PtyRegistry {
    /// Create a new PTY registry
    pub fn new(host: Arc<dyn PtyHost>, signaller: Arc<dyn Signaller>, config: PtyConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            slots: Arc::new(Slots {
                used: AtomicUsize::new(0),
                max: config.max_sessions,
            }),
            host,
            signaller,
            config,
        }
    }

    /// Spawn a shell on a new pseudo-terminal
    pub async fn spawn(&self, opts: SpawnOptions) -> Result<PtySession> {
        let shell = opts
            .shell
            .unwrap_or_else(|| self.config.default_shell.clone());
        validate_shell(&shell)?;

        let cwd = opts
            .cwd
            .or_else(|| self.config.default_cwd.clone())
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"));
        validate_cwd(&cwd)?;

        let reservation = self.slots.reserve().ok_or(Error::PtyLimitExceeded)?;

        let size = TermSize {
            cols: opts.cols.unwrap_or(self.config.default_cols),
            rows: opts.rows.unwrap_or(self.config.default_rows),
        };

        let host = self.host.clone();
        let spawn_shell = shell.clone();
        let spawn_cwd = cwd.clone();
        let spawned = tokio::task::spawn_blocking(move || host.spawn(&spawn_shell, &spawn_cwd, size))
            .await
            .map_err(|e| Error::Spawn(format!("PTY spawn task failed: {}", e)))??;

        let id = Uuid::new_v4().to_string();
        let session = PtySession {
            id: id.clone(),
            pid: spawned.pid,
            shell,
            cwd,
            tab_id: opts.tab_id,
            cols: size.cols,
            rows: size.rows,
            started_at: Utc::now(),
        };

        info!(
            "Spawned PTY {} (pid {}, {}x{}) in {}",
            id,
            session.pid,
            size.cols,
            size.rows,
            session.cwd.display()
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (exited_tx, exited_rx) = watch::channel(false);

        if let Err(e) = spawn_reader(id.clone(), spawned.reader, events.clone()) {
            // Nothing would ever drain this terminal
            if let Err(kill_err) = self
                .signaller
                .send(SignalTarget::Process(spawned.pid), Signal::Kill)
            {
                warn!("Failed to kill unread PTY shell {}: {}", spawned.pid, kill_err);
            }
            return Err(e);
        }

        let instance = Arc::new(PtyInstance {
            session: std::sync::Mutex::new(session.clone()),
            writer: Mutex::new(spawned.writer),
            resizer: Mutex::new(spawned.resizer),
            events: events.clone(),
            exited: exited_rx,
            killing: AtomicBool::new(false),
        });
        self.sessions.insert(id.clone(), instance);
        reservation.commit();

        let sessions = self.sessions.clone();
        let slots = self.slots.clone();
        let exit = spawned.exit;
        tokio::spawn(async move {
            let code = exit.await.ok().flatten();
            let _ = exited_tx.send(true);
            let _ = events.send(PtyEvent::Exit { code });
            if sessions.remove(&id).is_some() {
                slots.release();
                info!("PTY {} exited with {:?}", id, code);
            }
        });

        Ok(session)
    }

    /// Write input to a session
    pub async fn write(&self, id: &str, data: &[u8]) -> Result<()> {
        let Some(instance) = self.instance(id) else {
            debug!("Ignoring write to unknown PTY {}", id);
            return Ok(());
        };

        let mut writer = instance.writer.lock().await;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| Error::Internal(format!("PTY write failed: {}", e)))
    }

    /// Resize a session's terminal
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(Error::InvalidParameter(format!(
                "terminal size must be non-zero, got {}x{}",
                cols, rows
            )));
        }

        let Some(instance) = self.instance(id) else {
            debug!("Ignoring resize of unknown PTY {}", id);
            return Ok(());
        };

        instance
            .resizer
            .lock()
            .await
            .resize(TermSize { cols, rows })?;

        if let Ok(mut session) = instance.session.lock() {
            session.cols = cols;
            session.rows = rows;
        }
        Ok(())
    }

    /// Record the working directory the shell reported
    pub fn set_cwd(&self, id: &str, cwd: PathBuf) -> Result<()> {
        if !cwd.is_absolute() {
            return Err(Error::InvalidParameter(format!(
                "cwd must be absolute: {}",
                cwd.display()
            )));
        }

        let Some(instance) = self.instance(id) else {
            debug!("Ignoring cwd update for unknown PTY {}", id);
            return Ok(());
        };

        if let Ok(mut session) = instance.session.lock() {
            session.cwd = cwd;
        }
        Ok(())
    }

    /// Terminate a session: SIGTERM, then SIGKILL after the grace window
    pub async fn kill(&self, id: &str) -> Result<()> {
        self.terminate(id, self.config.kill_grace).await;
        Ok(())
    }

    /// Terminate every session with the shutdown grace window
    pub async fn kill_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            return;
        }

        info!("Terminating {} PTY sessions", ids.len());
        let grace = self.config.shutdown_grace;
        join_all(ids.iter().map(|id| self.terminate(id, grace))).await;
    }

    /// Snapshot of one session
    pub fn get(&self, id: &str) -> Option<PtySession> {
        self.instance(id).map(|instance| instance.snapshot())
    }

    /// Snapshot of every session
    pub fn list(&self) -> Vec<PtySession> {
        self.sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Subscribe to one session's output and exit
    pub fn subscribe(&self, id: &str) -> Option<broadcast::Receiver<PtyEvent>> {
        self.instance(id).map(|instance| instance.events.subscribe())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn instance(&self, id: &str) -> Option<Arc<PtyInstance>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    async fn terminate(&self, id: &str, grace: Duration) {
        let Some(instance) = self.instance(id) else {
            debug!("Ignoring kill of unknown PTY {}", id);
            return;
        };

        if instance.killing.swap(true, Ordering::SeqCst) {
            debug!("PTY {} is already being killed", id);
            return;
        }

        let pid = instance.pid();
        let mut exited = instance.exited.clone();
        let outcome = terminate_with_grace(
            self.signaller.as_ref(),
            SignalTarget::Process(pid),
            async move {
                let _ = exited.wait_for(|done| *done).await;
            },
            grace,
        )
        .await;

        if self.sessions.remove(id).is_some() {
            self.slots.release();
        }
        info!("Killed PTY {} (pid {}): {:?}", id, pid, outcome);
    }
}

/// Pump terminal output into the session's event channel on a blocking thread
fn spawn_reader(
    id: String,
    mut reader: Box<dyn Read + Send>,
    events: broadcast::Sender<PtyEvent>,
) -> Result<()> {
    std::thread::Builder::new()
        .name(format!("pty-read-{}", &id[..8]))
        .spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        // No subscribers is fine; output is dropped
                        let _ = events.send(PtyEvent::Data(Bytes::copy_from_slice(&buf[..n])));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("PTY {} reader stopped: {}", id, e);
                        break;
                    }
                }
            }
        })
        .map(|_| ())
        .map_err(|e| {
            warn!("Failed to start PTY reader: {}", e);
            Error::Spawn(format!("failed to start PTY reader: {}", e))
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::sync::Mutex as StdMutex;

    use mockall::predicate::eq;
    use tokio::sync::oneshot;

    use super::*;
    use crate::infra::pty_host::{MockPtyHost, SpawnedPty};
    use crate::infra::signal::{Delivery, MockSignaller, Signal};

    const FAKE_PID: u32 = 31337;

    struct NoopResizer;

    impl PtyResizer for NoopResizer {
        fn resize(&self, _size: TermSize) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<StdMutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Host whose shells never exit on their own. Exit senders are parked in
    /// `exits` so tests decide when (or whether) a shell exits.
    fn fake_host(
        output: &'static [u8],
        sink: SharedSink,
        exits: Arc<StdMutex<Vec<oneshot::Sender<Option<i32>>>>>,
    ) -> MockPtyHost {
        let mut host = MockPtyHost::new();
        host.expect_spawn().returning(move |_, _, _| {
            let (tx, rx) = oneshot::channel();
            exits.lock().unwrap().push(tx);
            Ok(SpawnedPty {
                pid: FAKE_PID,
                reader: Box::new(Cursor::new(output)),
                writer: Box::new(sink.clone()),
                resizer: Box::new(NoopResizer),
                exit: rx,
            })
        });
        host
    }

    fn test_config() -> PtyConfig {
        PtyConfig {
            default_shell: "/bin/sh".to_string(),
            default_cwd: Some(std::env::temp_dir()),
            max_sessions: 4,
            kill_grace: Duration::from_millis(50),
            shutdown_grace: Duration::from_millis(20),
            ..PtyConfig::default()
        }
    }

    fn registry_with(host: MockPtyHost, signaller: MockSignaller) -> PtyRegistry {
        PtyRegistry::new(Arc::new(host), Arc::new(signaller), test_config())
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_unpredictable() {
        let exits = Arc::new(StdMutex::new(Vec::new()));
        let mut config = test_config();
        config.max_sessions = 2000;
        let registry = PtyRegistry::new(
            Arc::new(fake_host(b"", SharedSink::default(), exits.clone())),
            Arc::new(MockSignaller::new()),
            config,
        );

        let mut ids = Vec::new();
        for _ in 0..1000 {
            ids.push(registry.spawn(SpawnOptions::default()).await.unwrap().id);
        }

        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());

        // Consecutive ids must not differ by a constant stride
        let numeric: Vec<u128> = ids
            .iter()
            .map(|id| Uuid::parse_str(id).unwrap().as_u128())
            .collect();
        let strides: HashSet<u128> = numeric
            .windows(2)
            .map(|w| w[1].wrapping_sub(w[0]))
            .collect();
        assert!(strides.len() > 990);
        assert!(strides.iter().all(|d| *d > 1_000_000));
    }

    #[tokio::test]
    async fn test_spawn_rejects_unlisted_shell() {
        let registry = registry_with(MockPtyHost::new(), MockSignaller::new());
        let err = registry
            .spawn(SpawnOptions {
                shell: Some("/usr/bin/python3".to_string()),
                ..SpawnOptions::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_surfaces_host_failure() {
        let mut host = MockPtyHost::new();
        host.expect_spawn()
            .returning(|_, _, _| Err(Error::Spawn("openpty failed: no ptys".to_string())));
        let registry = registry_with(host, MockSignaller::new());

        let err = registry.spawn(SpawnOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }

    #[tokio::test]
    async fn test_spawn_respects_limit() {
        let exits = Arc::new(StdMutex::new(Vec::new()));
        let registry = registry_with(
            fake_host(b"", SharedSink::default(), exits),
            MockSignaller::new(),
        );
        for _ in 0..4 {
            registry.spawn(SpawnOptions::default()).await.unwrap();
        }
        let err = registry.spawn(SpawnOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::PtyLimitExceeded));
    }

    #[tokio::test]
    async fn test_concurrent_spawns_respect_limit() {
        let exits = Arc::new(StdMutex::new(Vec::new()));
        let registry = registry_with(
            fake_host(b"", SharedSink::default(), exits),
            MockSignaller::new(),
        );

        let results = join_all((0..8).map(|_| registry.spawn(SpawnOptions::default()))).await;
        let spawned = results.iter().filter(|r| r.is_ok()).count();
        let refused = results
            .iter()
            .filter(|r| matches!(r, Err(Error::PtyLimitExceeded)))
            .count();

        assert_eq!(spawned, 4);
        assert_eq!(refused, 4);
        assert_eq!(registry.len(), 4);
    }

    #[tokio::test]
    async fn test_slots_return_after_exit_and_failure() {
        let exits = Arc::new(StdMutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut host = MockPtyHost::new();
        {
            let exits = exits.clone();
            let calls = calls.clone();
            host.expect_spawn().returning(move |_, _, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(Error::Spawn("openpty failed: no ptys".to_string()));
                }
                let (tx, rx) = oneshot::channel();
                exits.lock().unwrap().push(tx);
                Ok(SpawnedPty {
                    pid: FAKE_PID,
                    reader: Box::new(Cursor::new(&b""[..])),
                    writer: Box::new(SharedSink::default()),
                    resizer: Box::new(NoopResizer),
                    exit: rx,
                })
            });
        }
        let registry = registry_with(host, MockSignaller::new());

        // A failed spawn registers nothing and keeps no slot
        assert!(registry.spawn(SpawnOptions::default()).await.is_err());
        assert!(registry.is_empty());

        let mut sessions = Vec::new();
        for _ in 0..4 {
            sessions.push(registry.spawn(SpawnOptions::default()).await.unwrap());
        }
        assert!(matches!(
            registry.spawn(SpawnOptions::default()).await,
            Err(Error::PtyLimitExceeded)
        ));

        let mut events = registry.subscribe(&sessions[0].id).unwrap();
        exits.lock().unwrap().remove(0).send(Some(0)).unwrap();
        while !matches!(events.recv().await.unwrap(), PtyEvent::Exit { .. }) {}

        wait_for_free_slot(&registry).await;
        registry.spawn(SpawnOptions::default()).await.unwrap();
        assert_eq!(registry.len(), 4);
    }

    async fn wait_for_free_slot(registry: &PtyRegistry) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.len() == 4 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_write_reaches_terminal() {
        let sink = SharedSink::default();
        let exits = Arc::new(StdMutex::new(Vec::new()));
        let registry = registry_with(fake_host(b"", sink.clone(), exits), MockSignaller::new());

        let session = registry.spawn(SpawnOptions::default()).await.unwrap();
        registry.write(&session.id, b"ls -la\n").await.unwrap();
        assert_eq!(sink.0.lock().unwrap().as_slice(), b"ls -la\n");
    }

    #[tokio::test]
    async fn test_unknown_id_operations_are_noops() {
        let registry = registry_with(MockPtyHost::new(), MockSignaller::new());
        registry.write("missing", b"x").await.unwrap();
        registry.resize("missing", 100, 40).await.unwrap();
        registry.set_cwd("missing", PathBuf::from("/tmp")).unwrap();
        registry.kill("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_and_set_cwd_update_snapshot() {
        let exits = Arc::new(StdMutex::new(Vec::new()));
        let registry = registry_with(
            fake_host(b"", SharedSink::default(), exits),
            MockSignaller::new(),
        );
        let session = registry.spawn(SpawnOptions::default()).await.unwrap();

        registry.resize(&session.id, 132, 43).await.unwrap();
        registry.set_cwd(&session.id, PathBuf::from("/srv/app")).unwrap();

        let snapshot = registry.get(&session.id).unwrap();
        assert_eq!((snapshot.cols, snapshot.rows), (132, 43));
        assert_eq!(snapshot.cwd, PathBuf::from("/srv/app"));
        assert!(registry.resize(&session.id, 0, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_exit_removes_session_and_notifies() {
        let exits = Arc::new(StdMutex::new(Vec::new()));
        let registry = registry_with(
            fake_host(b"", SharedSink::default(), exits.clone()),
            MockSignaller::new(),
        );
        let session = registry.spawn(SpawnOptions::default()).await.unwrap();
        let mut events = registry.subscribe(&session.id).unwrap();

        let exit_tx = exits.lock().unwrap().pop().unwrap();
        exit_tx.send(Some(0)).unwrap();

        loop {
            match events.recv().await.unwrap() {
                PtyEvent::Exit { code } => {
                    assert_eq!(code, Some(0));
                    break;
                }
                PtyEvent::Data(_) => continue,
            }
        }
        tokio::task::yield_now().await;
        assert!(registry.get(&session.id).is_none());
    }

    #[tokio::test]
    async fn test_kill_graceful_exit_sends_no_sigkill() {
        let exits = Arc::new(StdMutex::new(Vec::new()));
        let host = fake_host(b"", SharedSink::default(), exits.clone());

        let mut signaller = MockSignaller::new();
        let exits_on_term = exits.clone();
        signaller
            .expect_send()
            .with(eq(SignalTarget::Process(FAKE_PID)), eq(Signal::Terminate))
            .times(1)
            .returning(move |_, _| {
                // The shell honours SIGTERM
                if let Some(tx) = exits_on_term.lock().unwrap().pop() {
                    let _ = tx.send(None);
                }
                Ok(Delivery::Delivered)
            });
        signaller
            .expect_send()
            .with(eq(SignalTarget::Process(FAKE_PID)), eq(Signal::Kill))
            .times(0);

        let registry = registry_with(host, signaller);
        let session = registry.spawn(SpawnOptions::default()).await.unwrap();
        registry.kill(&session.id).await.unwrap();
        assert!(registry.get(&session.id).is_none());
    }

    #[tokio::test]
    async fn test_kill_escalates_exactly_once() {
        let exits = Arc::new(StdMutex::new(Vec::new()));
        let host = fake_host(b"", SharedSink::default(), exits.clone());

        let mut signaller = MockSignaller::new();
        signaller
            .expect_send()
            .with(eq(SignalTarget::Process(FAKE_PID)), eq(Signal::Terminate))
            .times(1)
            .returning(|_, _| Ok(Delivery::Delivered));
        signaller
            .expect_send()
            .with(eq(SignalTarget::Process(FAKE_PID)), eq(Signal::Kill))
            .times(1)
            .returning(|_, _| Ok(Delivery::Delivered));

        let registry = registry_with(host, signaller);
        let session = registry.spawn(SpawnOptions::default()).await.unwrap();

        // Two racing kills: only one escalation
        let (a, b) = tokio::join!(registry.kill(&session.id), registry.kill(&session.id));
        a.unwrap();
        b.unwrap();

        assert!(registry.get(&session.id).is_none());
        registry.kill(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_all_is_bounded() {
        let exits = Arc::new(StdMutex::new(Vec::new()));
        let host = fake_host(b"", SharedSink::default(), exits.clone());

        let mut signaller = MockSignaller::new();
        signaller
            .expect_send()
            .with(eq(SignalTarget::Process(FAKE_PID)), eq(Signal::Terminate))
            .times(3)
            .returning(|_, _| Ok(Delivery::Delivered));
        signaller
            .expect_send()
            .with(eq(SignalTarget::Process(FAKE_PID)), eq(Signal::Kill))
            .times(3)
            .returning(|_, _| Ok(Delivery::Delivered));

        let registry = registry_with(host, signaller);
        for _ in 0..3 {
            registry.spawn(SpawnOptions::default()).await.unwrap();
        }

        let started = std::time::Instant::now();
        registry.kill_all().await;
        assert!(registry.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_output_is_broadcast() {
        let exits = Arc::new(StdMutex::new(Vec::new()));
        let mut host = MockPtyHost::new();
        let exits_for_host = exits.clone();
        // Reader blocks until the test releases it, so the subscription is
        // in place before any output is produced.
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Arc::new(StdMutex::new(Some(release_rx)));
        host.expect_spawn().returning(move |_, _, _| {
            let (tx, rx) = oneshot::channel();
            exits_for_host.lock().unwrap().push(tx);
            let gate = release_rx.lock().unwrap().take().unwrap();
            Ok(SpawnedPty {
                pid: FAKE_PID,
                reader: Box::new(GatedReader {
                    gate: Some(gate),
                    data: Cursor::new(b"$ hello\r\n".to_vec()),
                }),
                writer: Box::new(SharedSink::default()),
                resizer: Box::new(NoopResizer),
                exit: rx,
            })
        });

        let registry = registry_with(host, MockSignaller::new());
        let session = registry.spawn(SpawnOptions::default()).await.unwrap();
        let mut events = registry.subscribe(&session.id).unwrap();
        release_tx.send(()).unwrap();

        match events.recv().await.unwrap() {
            PtyEvent::Data(data) => assert_eq!(&data[..], b"$ hello\r\n"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    struct GatedReader {
        gate: Option<std::sync::mpsc::Receiver<()>>,
        data: Cursor<Vec<u8>>,
    }

    impl Read for GatedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if let Some(gate) = self.gate.take() {
                let _ = gate.recv();
            }
            self.data.read(buf)
        }
    }
}
