//! The process supervisor state machine.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use globset::GlobSet;
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};

use kiln_types::{BuildEvent, EventEmitter, KilnError, Result};

use crate::retry::{with_start_retry, BackoffPolicy};
use crate::terminate::terminate;

/// What to run. Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: cwd.into(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a stopping process gets between SIGTERM and SIGKILL.
    pub grace: Duration,
    pub start_attempts: usize,
    pub backoff: BackoffPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            start_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Restarting,
}

struct LiveProcess {
    child: Child,
    pid: Option<u32>,
    started_at: Instant,
}

#[derive(Default)]
struct Inner {
    spec: Option<ProcessSpec>,
    live: Option<LiveProcess>,
}

/// Owns the dev server child process. At most one instance is alive at any time.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    inner: tokio::sync::Mutex<Inner>,
    state: watch::Sender<SupervisorState>,
    events: EventEmitter,
    /// Restart tickets handed out / the highest ticket a finished restart covered.
    requested: AtomicU64,
    completed: AtomicU64,
    restart_serial: tokio::sync::Mutex<()>,
    spawns: AtomicUsize,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, events: EventEmitter) -> Self {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        Self {
            config,
            inner: tokio::sync::Mutex::new(Inner::default()),
            state,
            events,
            requested: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            restart_serial: tokio::sync::Mutex::new(()),
            spawns: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Number of processes spawned over the supervisor's lifetime.
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.lock().await.live.as_ref().and_then(|l| l.pid)
    }

    pub async fn started_at(&self) -> Option<Instant> {
        self.inner.lock().await.live.as_ref().map(|l| l.started_at)
    }

    /// True if a child is held and has not exited. Reaps and reports a child
    /// that exited on its own.
    pub async fn is_alive(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let exited = match inner.live.as_mut() {
            None => return false,
            Some(live) => match live.child.try_wait() {
                Ok(None) => return true,
                Ok(Some(status)) => Some(status),
                Err(_) => None,
            },
        };
        if let Some(live) = inner.live.take() {
            tracing::warn!(pid = ?live.pid, status = ?exited, "Server process exited");
            self.events.emit(BuildEvent::ProcessExited {
                pid: live.pid,
                code: exited.and_then(|s| s.code()),
            });
        }
        self.set_state(SupervisorState::Stopped);
        false
    }

    /// Launch `spec` if nothing is running.
    pub async fn start(&self, spec: ProcessSpec) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(live) = inner.live.as_mut() {
            if live.child.try_wait()?.is_none() {
                return Err(KilnError::AlreadyRunning {
                    command: spec.command,
                });
            }
            inner.live = None;
        }

        self.set_state(SupervisorState::Starting);
        match self.spawn_with_retry(&spec).await {
            Ok(live) => {
                inner.live = Some(live);
                inner.spec = Some(spec);
                self.set_state(SupervisorState::Running);
                Ok(())
            }
            Err(e) => {
                self.set_state(SupervisorState::Stopped);
                Err(e)
            }
        }
    }

    /// Terminate the current process, if any, and start a fresh one with the
    /// same spec.
    ///
    /// Requests that arrive while a restart is in flight are satisfied by a
    /// single follow-up restart; every caller returns once a restart that
    /// began after its request has finished.
    pub async fn restart(&self) -> Result<()> {
        let ticket = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let _serial = self.restart_serial.lock().await;
        if self.completed.load(Ordering::SeqCst) >= ticket {
            tracing::debug!(ticket, "Restart coalesced");
            return Ok(());
        }
        let covering = self.requested.load(Ordering::SeqCst);

        let mut inner = self.inner.lock().await;
        let spec = inner.spec.clone().ok_or(KilnError::NotRunning)?;
        self.set_state(SupervisorState::Restarting);

        if let Some(mut old) = inner.live.take() {
            if let Err(e) = self.stop_process(&spec, &mut old).await {
                inner.live = Some(old);
                self.set_state(SupervisorState::Running);
                return Err(e);
            }
        }

        match self.spawn_with_retry(&spec).await {
            Ok(live) => {
                inner.live = Some(live);
                self.completed.store(covering, Ordering::SeqCst);
                self.set_state(SupervisorState::Running);
                Ok(())
            }
            Err(e) => {
                self.set_state(SupervisorState::Stopped);
                Err(e)
            }
        }
    }

    /// Terminate the current process and transition to `Stopped`. Waits for
    /// an in-flight restart; restarts requested afterwards fail with
    /// [`KilnError::NotRunning`] until the next `start`.
    pub async fn stop(&self) -> Result<()> {
        let _serial = self.restart_serial.lock().await;
        let mut inner = self.inner.lock().await;
        let spec = inner.spec.take();
        if let (Some(spec), Some(mut old)) = (spec.clone(), inner.live.take()) {
            if let Err(e) = self.stop_process(&spec, &mut old).await {
                inner.live = Some(old);
                inner.spec = Some(spec);
                return Err(e);
            }
        }
        self.set_state(SupervisorState::Stopped);
        Ok(())
    }

    /// Restart whenever an event reports a changed path matching `scope`.
    /// Paths are matched relative to `root`.
    ///
    /// Once a pipeline has reported writing an artifact, watcher events for
    /// that same path are ignored; the pipeline's own event already restarted.
    ///
    /// The returned task ends with an error only when a restart fails fatally.
    pub fn observe(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<BuildEvent>,
        scope: GlobSet,
        root: PathBuf,
    ) -> JoinHandle<Result<()>> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut restarts = JoinSet::new();
            let mut artifacts: HashSet<PathBuf> = HashSet::new();
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let trigger = match event {
                            Ok(BuildEvent::ArtifactWritten { path, .. }) => {
                                let matched = matches_scope(&scope, &root, &path);
                                artifacts.insert(path);
                                matched
                            }
                            Ok(BuildEvent::FileChanged { path }) if artifacts.contains(&path) => {
                                tracing::debug!(
                                    path = %path.display(),
                                    "Artifact already reported by its pipeline"
                                );
                                false
                            }
                            Ok(event) => event
                                .changed_path()
                                .map(|p| matches_scope(&scope, &root, p))
                                .unwrap_or(false),
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(
                                    skipped,
                                    "Supervisor lagged behind build events, restarting"
                                );
                                true
                            }
                            Err(broadcast::error::RecvError::Closed) => return Ok(()),
                        };
                        if trigger {
                            let sup = Arc::clone(&this);
                            restarts.spawn(async move { sup.restart().await });
                        }
                    }
                    Some(done) = restarts.join_next(), if !restarts.is_empty() => {
                        match done {
                            Ok(Err(e)) if e.is_fatal() => return Err(e),
                            Ok(Err(e)) => tracing::error!(error = %e, "Restart failed"),
                            Err(e) => tracing::error!(error = %e, "Restart task aborted"),
                            Ok(Ok(())) => {}
                        }
                    }
                }
            }
        })
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }

    /// Stop `old`. If graceful termination fails the child is killed
    /// outright; an error means it may still be alive.
    async fn stop_process(&self, spec: &ProcessSpec, old: &mut LiveProcess) -> Result<()> {
        match terminate(&mut old.child, self.config.grace).await {
            Ok((status, forced)) => {
                if forced {
                    let timeout = KilnError::ProcessTimeout {
                        command: spec.command.clone(),
                        grace_ms: self.config.grace.as_millis() as u64,
                    };
                    tracing::warn!(pid = ?old.pid, "{}; killed", timeout);
                } else {
                    tracing::info!(pid = ?old.pid, status = %status, "Server stopped");
                }
                self.events.emit(BuildEvent::ProcessExited {
                    pid: old.pid,
                    code: status.code(),
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(pid = ?old.pid, error = %e, "Graceful stop failed, killing");
                kill_and_reap(&mut old.child)
                    .await
                    .map_err(|kill| KilnError::Process {
                        command: spec.command.clone(),
                        message: format!("cannot stop pid {:?}: {}", old.pid, kill),
                    })?;
                self.events.emit(BuildEvent::ProcessExited {
                    pid: old.pid,
                    code: None,
                });
                Ok(())
            }
        }
    }

    async fn spawn_with_retry(&self, spec: &ProcessSpec) -> Result<LiveProcess> {
        let live = with_start_retry(
            || async { self.spawn(spec) },
            self.config.start_attempts,
            &self.config.backoff,
            &spec.command,
        )
        .await?;
        self.spawns.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            pid = ?live.pid,
            command = %spec.command,
            args = ?spec.args,
            "Server started"
        );
        self.events.emit(BuildEvent::ProcessStarted {
            pid: live.pid,
            command: spec.command.clone(),
        });
        Ok(live)
    }

    fn spawn(&self, spec: &ProcessSpec) -> Result<LiveProcess> {
        let mut cmd = tokio::process::Command::new(&spec.command);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|e| KilnError::Process {
            command: spec.command.clone(),
            message: e.to_string(),
        })?;
        Ok(LiveProcess {
            pid: child.id(),
            child,
            started_at: Instant::now(),
        })
    }
}

async fn kill_and_reap(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
    child.kill().await
}

fn matches_scope(scope: &GlobSet, root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    scope.is_match(relative)
}
