//! Build event bus.
//!
//! Emits [`BuildEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! components (the supervisor, the CLI reporter, tests) can observe pipeline
//! rebuilds, task runs, and file changes without holding references to each other.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events emitted by pipelines, the task executor, the watch dispatcher, and the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BuildEvent {
    BuildStarted {
        pipeline: String,
        incremental: bool,
    },
    ArtifactWritten {
        pipeline: String,
        path: PathBuf,
        content_hash: String,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
    BuildFailed {
        pipeline: String,
        error: String,
    },
    AdapterLog {
        pipeline: String,
        message: String,
    },
    StageStarted {
        index: usize,
        tasks: Vec<String>,
    },
    StageFinished {
        index: usize,
        failed: usize,
    },
    TaskStarted {
        task: String,
    },
    TaskFinished {
        task: String,
        success: bool,
        duration_ms: u64,
    },
    FileChanged {
        path: PathBuf,
    },
    ProcessStarted {
        pid: Option<u32>,
        command: String,
    },
    ProcessExited {
        pid: Option<u32>,
        code: Option<i32>,
    },
}

impl BuildEvent {
    /// The filesystem path this event reports a change to, if any.
    pub fn changed_path(&self) -> Option<&PathBuf> {
        match self {
            BuildEvent::ArtifactWritten { path, .. } | BuildEvent::FileChanged { path } => {
                Some(path)
            }
            _ => None,
        }
    }
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<BuildEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: BuildEvent) {
        tracing::trace!(?event, "emit");
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BuildEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
