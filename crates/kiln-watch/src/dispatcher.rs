//! Maps debounced file changes to task runs and pipeline rebuilds.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use globset::GlobSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use kiln_bundle::PipelineRegistry;
use kiln_tasks::TaskRegistry;
use kiln_types::{BuildEvent, EventEmitter, KilnError, Result};

use crate::debounce::Debouncer;
use crate::rule::{compile_globs, WatchRule, WatchTarget};

struct CompiledRule {
    globs: GlobSet,
    targets: Vec<WatchTarget>,
}

pub struct WatchDispatcher {
    root: PathBuf,
    ignored: Vec<PathBuf>,
    debounce: Duration,
    rules: Vec<CompiledRule>,
    tasks: Arc<TaskRegistry>,
    pipelines: Arc<PipelineRegistry>,
    events: EventEmitter,
    tx: mpsc::UnboundedSender<PathBuf>,
    rx: mpsc::UnboundedReceiver<PathBuf>,
}

impl WatchDispatcher {
    /// Globs are matched against paths relative to `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        debounce: Duration,
        tasks: Arc<TaskRegistry>,
        pipelines: Arc<PipelineRegistry>,
        events: EventEmitter,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            root: root.into(),
            ignored: Vec::new(),
            debounce,
            rules: Vec::new(),
            tasks,
            pipelines,
            events,
            tx,
            rx,
        }
    }

    /// Changes below `dir` are reported as [`BuildEvent::FileChanged`] but
    /// never dispatched to rules. Used for the output root, so rebuilt
    /// artifacts cannot retrigger the rules that produced them.
    pub fn ignore_dispatch_under(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ignored.push(dir.into());
        self
    }

    /// Register a rule. Every target must name a registered task or pipeline.
    pub fn watch(&mut self, rule: WatchRule) -> Result<()> {
        for target in &rule.targets {
            match target {
                WatchTarget::Task(name) if !self.tasks.contains(name) => {
                    return Err(KilnError::UnknownTask(name.clone()));
                }
                WatchTarget::Pipeline(key) if !self.pipelines.contains(key) => {
                    return Err(KilnError::UnknownPipeline(key.clone()));
                }
                _ => {}
            }
        }
        let globs = compile_globs(&rule.globs)?;
        tracing::debug!(globs = ?rule.globs, targets = ?rule.targets, "Watching");
        self.rules.push(CompiledRule {
            globs,
            targets: rule.targets,
        });
        Ok(())
    }

    /// Channel for reporting changed paths. Clone it before calling `start`.
    pub fn sender(&self) -> mpsc::UnboundedSender<PathBuf> {
        self.tx.clone()
    }

    /// Start the dispatch loop. It ends once every sender has been dropped.
    pub fn start(self) -> JoinHandle<()> {
        let WatchDispatcher {
            root,
            ignored,
            debounce,
            rules,
            tasks,
            pipelines,
            events,
            tx,
            mut rx,
        } = self;
        drop(tx);

        let dispatch = Dispatch {
            root,
            ignored,
            rules,
            tasks,
            pipelines,
            events,
        };
        tracing::info!(
            rules = dispatch.rules.len(),
            debounce_ms = debounce.as_millis() as u64,
            "Watching for changes"
        );

        tokio::spawn(async move {
            let mut pending = Debouncer::new(debounce);
            loop {
                let deadline = pending
                    .next_deadline()
                    .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
                tokio::select! {
                    changed = rx.recv() => match changed {
                        Some(path) => pending.push(path, Instant::now()),
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline), if !pending.is_empty() => {
                        let due = pending.drain_due(Instant::now());
                        dispatch.fire(due);
                    }
                }
            }
            tracing::debug!("Watch dispatcher stopped");
        })
    }
}

/// The immutable half of the dispatcher, owned by the running loop.
struct Dispatch {
    root: PathBuf,
    ignored: Vec<PathBuf>,
    rules: Vec<CompiledRule>,
    tasks: Arc<TaskRegistry>,
    pipelines: Arc<PipelineRegistry>,
    events: EventEmitter,
}

impl Dispatch {
    fn fire(&self, paths: Vec<PathBuf>) {
        let mut task_targets = BTreeSet::new();

        for path in paths {
            self.events.emit(BuildEvent::FileChanged { path: path.clone() });
            if self.ignored.iter().any(|dir| path.starts_with(dir)) {
                continue;
            }
            let relative = relative_to(&self.root, &path);
            for rule in self.rules.iter().filter(|r| r.globs.is_match(relative)) {
                for target in &rule.targets {
                    match target {
                        WatchTarget::Task(name) => {
                            task_targets.insert(name.clone());
                        }
                        WatchTarget::Pipeline(key) => {
                            if let Some(pipeline) = self.pipelines.get(key) {
                                tracing::debug!(
                                    path = %relative.display(),
                                    pipeline = %key,
                                    "Change dispatched"
                                );
                                pipeline.on_change(path.clone());
                            }
                        }
                    }
                }
            }
        }

        // One run per task per batch, however many paths matched it.
        for name in task_targets {
            let tasks = self.tasks.clone();
            tokio::spawn(async move {
                if let Err(e) = tasks.run_task(&name).await {
                    tracing::warn!(task = %name, error = %e, "Watch-triggered task failed");
                }
            });
        }
    }
}

fn relative_to<'a>(root: &Path, path: &'a Path) -> &'a Path {
    path.strip_prefix(root).unwrap_or(path)
}
