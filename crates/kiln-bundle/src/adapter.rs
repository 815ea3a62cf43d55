//! Transform adapter trait and the log sinks adapters report through.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use kiln_types::{BuildEvent, EventEmitter, Result};

/// Output of a single adapter run.
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub code: Vec<u8>,
    /// Serialized v3 sourcemap, when the adapter was configured to emit one.
    pub sourcemap: Option<String>,
    pub modules_total: usize,
    /// Modules that were read and transformed on this run rather than served from cache.
    pub modules_rebuilt: usize,
}

/// Converts entry sources into a bundled artifact.
///
/// An adapter instance lives as long as its pipeline. Implementations are
/// expected to keep whatever per-module state makes the next `bundle` call
/// cheaper, and to drop only the state for paths passed to `invalidate`.
/// A full build calls `reset` first.
#[async_trait]
pub trait TransformAdapter: Send {
    /// Adapter identifier used in logs.
    fn name(&self) -> &str;

    /// Produce a bundle from the given entry sources.
    async fn bundle(&mut self, entries: &[PathBuf], sink: &dyn LogSink) -> Result<TransformOutput>;

    /// Evict cached state for a changed file. Returns `true` if the file was
    /// part of the last module graph.
    fn invalidate(&mut self, path: &Path) -> bool;

    /// Drop all cached state so the next `bundle` reads every module again.
    fn reset(&mut self) {}

    /// Files the last successful bundle depended on.
    fn dependencies(&self) -> Vec<PathBuf>;
}

// ---------------------------------------------------------------------------
// Log sinks
// ---------------------------------------------------------------------------

/// Receives adapter log lines synchronously while a bundle is being produced.
pub trait LogSink: Send + Sync {
    fn log(&self, message: &str);
}

/// Writes adapter logs to `tracing`.
pub struct TracingSink {
    pipeline: String,
}

impl TracingSink {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
        }
    }
}

impl LogSink for TracingSink {
    fn log(&self, message: &str) {
        tracing::info!(pipeline = %self.pipeline, "{}", message);
    }
}

/// Re-publishes adapter logs on the build event bus.
pub struct EmitterSink {
    pipeline: String,
    events: EventEmitter,
}

impl EmitterSink {
    pub fn new(pipeline: impl Into<String>, events: EventEmitter) -> Self {
        Self {
            pipeline: pipeline.into(),
            events,
        }
    }
}

impl LogSink for EmitterSink {
    fn log(&self, message: &str) {
        self.events.emit(BuildEvent::AdapterLog {
            pipeline: self.pipeline.clone(),
            message: message.to_string(),
        });
    }
}

/// Forwards every line to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl LogSink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }
}

impl LogSink for FanoutSink {
    fn log(&self, message: &str) {
        for sink in &self.sinks {
            sink.log(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<String>>);

    impl LogSink for Recording {
        fn log(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    #[tokio::test]
    async fn emitter_sink_publishes_adapter_log() {
        let events = EventEmitter::new(8);
        let mut rx = events.subscribe();
        let sink = EmitterSink::new("js/main.js", events);

        sink.log("42 bytes written");

        match rx.recv().await.unwrap() {
            BuildEvent::AdapterLog { pipeline, message } => {
                assert_eq!(pipeline, "js/main.js");
                assert_eq!(message, "42 bytes written");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let first = Arc::new(Recording(Mutex::new(Vec::new())));
        let second = Arc::new(Recording(Mutex::new(Vec::new())));
        let fanout = FanoutSink {
            sinks: vec![first.clone(), second.clone()],
        };

        fanout.log("hello");

        assert_eq!(*first.0.lock().unwrap(), vec!["hello".to_string()]);
        assert_eq!(*second.0.lock().unwrap(), vec!["hello".to_string()]);
    }
}
