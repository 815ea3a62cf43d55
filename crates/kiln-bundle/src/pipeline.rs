//! A bundle pipeline: one output artifact, one long-lived adapter.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::broadcast;

use kiln_types::{Artifact, BuildEvent, BuildState, EventEmitter, Result};

use crate::adapter::{LogSink, TransformAdapter};
use crate::descriptor::BundleDescriptor;
use crate::writer::write_artifact;

/// Result of a build, published on the pipeline's update channel.
#[derive(Debug, Clone)]
pub struct PipelineUpdate {
    pub output: String,
    pub incremental: bool,
    pub result: std::result::Result<Artifact, String>,
}

/// Rebuild bookkeeping. `running` is true while a rebuild loop owns the
/// pipeline; `pending` records that at least one change arrived after the
/// current rebuild started.
#[derive(Debug, Default)]
struct RebuildSlot {
    running: bool,
    pending: bool,
    dirty: Vec<PathBuf>,
}

pub struct BundlePipeline {
    descriptor: BundleDescriptor,
    output_root: PathBuf,
    adapter: tokio::sync::Mutex<Box<dyn TransformAdapter>>,
    sink: Arc<dyn LogSink>,
    state: Mutex<BuildState>,
    slot: Mutex<RebuildSlot>,
    events: EventEmitter,
    updates: broadcast::Sender<PipelineUpdate>,
    builds: AtomicUsize,
}

impl std::fmt::Debug for BundlePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundlePipeline")
            .field("descriptor", &self.descriptor)
            .field("output_root", &self.output_root)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BundlePipeline {
    pub fn new(
        descriptor: BundleDescriptor,
        output_root: impl Into<PathBuf>,
        adapter: Box<dyn TransformAdapter>,
        sink: Arc<dyn LogSink>,
        events: EventEmitter,
    ) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            descriptor,
            output_root: output_root.into(),
            adapter: tokio::sync::Mutex::new(adapter),
            sink,
            state: Mutex::new(BuildState::Idle),
            slot: Mutex::new(RebuildSlot::default()),
            events,
            updates,
            builds: AtomicUsize::new(0),
        }
    }

    pub fn descriptor(&self) -> &BundleDescriptor {
        &self.descriptor
    }

    /// Registry key: the descriptor's output path.
    pub fn key(&self) -> &str {
        &self.descriptor.output
    }

    pub fn state(&self) -> BuildState {
        lock(&self.state).clone()
    }

    /// Builds completed so far, successful or not.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// True while a change-triggered rebuild is running or queued.
    pub fn is_rebuilding(&self) -> bool {
        lock(&self.slot).running
    }

    /// Subscribe to the result of every subsequent build.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineUpdate> {
        self.updates.subscribe()
    }

    /// Full build from source, ignoring cached modules. Waits for any
    /// in-flight build of this pipeline first.
    pub async fn build(&self) -> Result<Artifact> {
        let mut adapter = self.adapter.lock().await;
        adapter.reset();
        self.build_locked(&mut **adapter, false).await
    }

    /// Report a changed source file. The rebuild runs in the background and
    /// its result is published on [`subscribe`](Self::subscribe).
    ///
    /// At most one rebuild runs at a time. Changes that arrive while one is
    /// running collapse into a single follow-up rebuild.
    pub fn on_change(self: &Arc<Self>, path: impl Into<PathBuf>) {
        {
            let mut slot = lock(&self.slot);
            slot.dirty.push(path.into());
            if slot.running {
                slot.pending = true;
                tracing::debug!(pipeline = %self.key(), "Rebuild already in flight, coalescing");
                return;
            }
            slot.running = true;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.rebuild_loop().await });
    }

    async fn rebuild_loop(&self) {
        loop {
            let mut adapter = self.adapter.lock().await;
            let dirty = {
                let mut slot = lock(&self.slot);
                slot.pending = false;
                std::mem::take(&mut slot.dirty)
            };
            for path in &dirty {
                let known = adapter.invalidate(path);
                tracing::debug!(
                    pipeline = %self.key(),
                    path = %path.display(),
                    known,
                    "Invalidated"
                );
            }

            // Failures are reported through state, events, and the update channel.
            let _ = self.build_locked(&mut **adapter, true).await;
            drop(adapter);

            let settled = {
                let mut slot = lock(&self.slot);
                if !slot.pending {
                    slot.running = false;
                }
                !slot.running
            };
            if settled {
                return;
            }
        }
    }

    async fn build_locked(
        &self,
        adapter: &mut dyn TransformAdapter,
        incremental: bool,
    ) -> Result<Artifact> {
        *lock(&self.state) = BuildState::Building;
        self.events.emit(BuildEvent::BuildStarted {
            pipeline: self.key().to_string(),
            incremental,
        });
        let started = Instant::now();

        let result = self.produce(adapter).await;
        self.builds.fetch_add(1, Ordering::SeqCst);
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(artifact) => {
                *lock(&self.state) = BuildState::Ready;
                tracing::info!(
                    pipeline = %self.key(),
                    hash = %&artifact.content_hash[..12],
                    bytes = artifact.size,
                    duration_ms,
                    incremental,
                    "Bundle written"
                );
                self.events.emit(BuildEvent::ArtifactWritten {
                    pipeline: self.key().to_string(),
                    path: artifact.path.clone(),
                    content_hash: artifact.content_hash.clone(),
                    duration_ms,
                    at: chrono::Utc::now(),
                });
            }
            Err(e) => {
                *lock(&self.state) = BuildState::Failed(e.to_string());
                tracing::error!(pipeline = %self.key(), error = %e, "Bundle failed");
                self.events.emit(BuildEvent::BuildFailed {
                    pipeline: self.key().to_string(),
                    error: e.to_string(),
                });
            }
        }

        let _ = self.updates.send(PipelineUpdate {
            output: self.key().to_string(),
            incremental,
            result: result.as_ref().map(Clone::clone).map_err(|e| e.to_string()),
        });
        result
    }

    async fn produce(&self, adapter: &mut dyn TransformAdapter) -> Result<Artifact> {
        let output = adapter
            .bundle(&self.descriptor.entries, self.sink.as_ref())
            .await?;
        let sourcemap = if self.descriptor.debug {
            output.sourcemap.as_deref()
        } else {
            None
        };
        write_artifact(&self.output_root, &self.descriptor.output, output.code, sourcemap).await
    }

    /// Absolute path the artifact is written to.
    pub fn artifact_path(&self) -> PathBuf {
        self.output_root.join(Path::new(&self.descriptor.output))
    }
}
