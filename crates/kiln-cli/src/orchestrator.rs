//! Wires configuration into pipelines, tasks, the watcher, and the supervisor.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use globset::GlobSet;
use tokio::task::JoinHandle;

use kiln_bundle::PipelineRegistry;
use kiln_supervisor::{BackoffPolicy, ProcessSpec, ProcessSupervisor, SupervisorConfig};
use kiln_tasks::builtin::{BundlesTask, CleanTask, CopyRule, CopyTask, MkdirTask, ShellTask};
use kiln_tasks::{RunReport, Stage, StageExecutor, TaskAction, TaskRegistry};
use kiln_types::{EventEmitter, KilnError, Result};
use kiln_watch::{compile_globs, FsObserver, WatchDispatcher, WatchRule, WatchTarget};

use crate::config::{KilnConfig, ServerConfig, TaskConfig};

const EVENT_CAPACITY: usize = 1024;
const SHELL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Every stage without a serve or watch task.
    Build,
    /// Every stage, then stay in watch mode.
    Serve,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Long-lived handles started by serve and watch tasks.
#[derive(Default)]
struct Session {
    observer: Mutex<Option<FsObserver>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    server_watch: Mutex<Option<JoinHandle<Result<()>>>>,
    fatal: Mutex<Option<KilnError>>,
}

impl Session {
    fn is_watching(&self) -> bool {
        lock(&self.dispatcher).is_some()
    }
}

pub struct Orchestrator {
    config: KilnConfig,
    events: EventEmitter,
    pipelines: Arc<PipelineRegistry>,
    executor: StageExecutor,
    supervisor: Option<Arc<ProcessSupervisor>>,
    session: Arc<Session>,
}

impl Orchestrator {
    /// Build every component from `config`. `extra_server_args` are appended
    /// to the configured server arguments.
    pub fn new(config: KilnConfig, extra_server_args: Vec<String>) -> Result<Self> {
        let root = config.project_root().to_path_buf();
        let output = config.output_dir();
        let events = EventEmitter::new(EVENT_CAPACITY);
        let session = Arc::new(Session::default());

        let mut pipelines = PipelineRegistry::new(&root, &output, events.clone());
        for bundle in &config.bundles {
            pipelines.register(bundle.clone())?;
        }
        let pipelines = Arc::new(pipelines);

        let supervisor = config
            .server
            .as_ref()
            .map(|server| {
                Arc::new(ProcessSupervisor::new(
                    supervisor_config(server),
                    events.clone(),
                ))
            });

        let dispatcher_slot = Arc::new(Mutex::new(None));
        let mut tasks = TaskRegistry::new();
        for (name, task) in &config.tasks {
            let action: Box<dyn TaskAction> = match task {
                TaskConfig::Clean => Box::new(CleanTask::new(&output)),
                TaskConfig::Mkdir { dirs } => {
                    Box::new(MkdirTask::new(dirs.iter().map(|d| output.join(d)).collect()))
                }
                TaskConfig::Copy { rules } => {
                    let rules = rules
                        .iter()
                        .map(|r| CopyRule::new(&r.from, output.join(&r.to)))
                        .collect::<Result<Vec<_>>>()?;
                    Box::new(CopyTask::new(&root, rules))
                }
                TaskConfig::Shell {
                    command,
                    cwd,
                    timeout_ms,
                } => {
                    let cwd = cwd.as_ref().map_or_else(|| root.clone(), |c| root.join(c));
                    let mut shell = ShellTask::new(name.as_str(), command.as_str(), cwd);
                    if let Some(ms) = timeout_ms {
                        shell = shell.with_timeout(Duration::from_millis(*ms), SHELL_GRACE);
                    }
                    Box::new(shell)
                }
                TaskConfig::Bundles => Box::new(BundlesTask::new(name.as_str(), pipelines.clone())),
                TaskConfig::Serve => {
                    let (Some(server), Some(supervisor)) = (&config.server, &supervisor) else {
                        return Err(KilnError::Config(format!(
                            "task '{}' is a serve task but no [server] is configured",
                            name
                        )));
                    };
                    Box::new(ServeTask {
                        supervisor: supervisor.clone(),
                        spec: process_spec(server, &root, &extra_server_args),
                        scope: compile_globs(&server.restart_on)?,
                        root: root.clone(),
                        events: events.clone(),
                        session: session.clone(),
                    })
                }
                TaskConfig::Watch => Box::new(WatchTask {
                    dispatcher: dispatcher_slot.clone(),
                    root: root.clone(),
                    session: session.clone(),
                }),
            };
            tasks.register_boxed(name.as_str(), action)?;
        }
        let tasks = Arc::new(tasks);

        let mut dispatcher = WatchDispatcher::new(
            &root,
            config.debounce(),
            tasks.clone(),
            pipelines.clone(),
            events.clone(),
        )
        .ignore_dispatch_under(&output);
        for watch in &config.watches {
            let targets = watch
                .targets
                .iter()
                .map(|t| WatchTarget::resolve(t, &tasks, &pipelines))
                .collect::<Result<Vec<_>>>()?;
            dispatcher.watch(WatchRule::new(watch.globs.iter().cloned(), targets))?;
        }
        *lock(&dispatcher_slot) = Some(dispatcher);

        let executor = StageExecutor::new(tasks, events.clone());
        Ok(Self {
            config,
            events,
            pipelines,
            executor,
            supervisor,
            session,
        })
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn pipelines(&self) -> &Arc<PipelineRegistry> {
        &self.pipelines
    }

    pub fn supervisor(&self) -> Option<&Arc<ProcessSupervisor>> {
        self.supervisor.as_ref()
    }

    /// The stages `mode` runs, in declared order.
    pub fn stages(&self, mode: Mode) -> Vec<Stage> {
        self.config
            .stages
            .iter()
            .filter(|s| mode == Mode::Serve || !self.config.stage_is_long_running(s))
            .map(|s| Stage {
                tasks: s.tasks.clone(),
                requires_success: s.requires_success,
            })
            .collect()
    }

    pub async fn run(&self, mode: Mode) -> Result<RunReport> {
        let stages = self.stages(mode);
        self.executor.run(&stages).await
    }

    /// Run every stage, then keep watching until Ctrl-C or a fatal
    /// supervisor error. The server is stopped before returning.
    pub async fn serve(&self) -> Result<RunReport> {
        let report = self.run(Mode::Serve).await?;
        let fatal = lock(&self.session.fatal).take();
        if let Some(fatal) = fatal {
            self.shutdown().await;
            return Err(fatal);
        }
        if !report.is_success() {
            tracing::warn!(failed = ?report.failed_tasks(), "Initial build had failures");
        }
        if !self.session.is_watching() && lock(&self.session.server_watch).is_none() {
            tracing::warn!("Nothing left running");
            return Ok(report);
        }

        tracing::info!("Watching; press Ctrl-C to stop");
        let server_watch = lock(&self.session.server_watch).take();
        let outcome = match server_watch {
            Some(handle) => tokio::select! {
                signal = tokio::signal::ctrl_c() => signal.map_err(KilnError::from),
                joined = handle => match joined {
                    Ok(Err(e)) => Err(e),
                    Ok(Ok(())) => Ok(()),
                    Err(e) => Err(KilnError::Process {
                        command: "supervisor".into(),
                        message: e.to_string(),
                    }),
                },
            },
            None => tokio::signal::ctrl_c().await.map_err(KilnError::from),
        };

        self.shutdown().await;
        outcome.map(|()| report)
    }

    /// Stop watching and stop the server.
    pub async fn shutdown(&self) {
        lock(&self.session.observer).take();
        if let Some(handle) = lock(&self.session.dispatcher).take() {
            handle.abort();
        }
        if let Some(handle) = lock(&self.session.server_watch).take() {
            handle.abort();
        }
        if let Some(supervisor) = &self.supervisor {
            if let Err(e) = supervisor.stop().await {
                tracing::warn!(error = %e, "Failed to stop server");
            }
        }
    }
}

fn supervisor_config(server: &ServerConfig) -> SupervisorConfig {
    SupervisorConfig {
        grace: Duration::from_millis(server.grace_ms),
        start_attempts: server.start_attempts,
        backoff: BackoffPolicy::default(),
    }
}

fn process_spec(
    server: &ServerConfig,
    root: &std::path::Path,
    extra_args: &[String],
) -> ProcessSpec {
    let cwd = server.cwd.as_ref().map_or_else(|| root.to_path_buf(), |c| root.join(c));
    ProcessSpec::new(server.command.as_str(), cwd)
        .with_args(server.args.iter().chain(extra_args).cloned())
}

// ---------------------------------------------------------------------------
// Task actions that start long-lived components
// ---------------------------------------------------------------------------

/// Starts the server and restarts it on matching changes.
struct ServeTask {
    supervisor: Arc<ProcessSupervisor>,
    spec: ProcessSpec,
    scope: GlobSet,
    root: PathBuf,
    events: EventEmitter,
    session: Arc<Session>,
}

#[async_trait]
impl TaskAction for ServeTask {
    async fn run(&self) -> Result<()> {
        if let Err(e) = self.supervisor.start(self.spec.clone()).await {
            if let KilnError::StartAttemptsExhausted { command, attempts } = &e {
                *lock(&self.session.fatal) = Some(KilnError::StartAttemptsExhausted {
                    command: command.clone(),
                    attempts: *attempts,
                });
            }
            return Err(e);
        }
        let handle = self
            .supervisor
            .observe(self.events.subscribe(), self.scope.clone(), self.root.clone());
        if let Some(previous) = lock(&self.session.server_watch).replace(handle) {
            previous.abort();
        }
        Ok(())
    }
}

/// Starts filesystem observation and the dispatch loop. Later runs are no-ops.
struct WatchTask {
    dispatcher: Arc<Mutex<Option<WatchDispatcher>>>,
    root: PathBuf,
    session: Arc<Session>,
}

#[async_trait]
impl TaskAction for WatchTask {
    async fn run(&self) -> Result<()> {
        let Some(dispatcher) = lock(&self.dispatcher).take() else {
            tracing::debug!("Already watching");
            return Ok(());
        };
        let observer = FsObserver::new(&self.root, dispatcher.sender())?;
        let handle = dispatcher.start();
        *lock(&self.session.observer) = Some(observer);
        *lock(&self.session.dispatcher) = Some(handle);
        Ok(())
    }
}
