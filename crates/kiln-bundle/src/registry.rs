//! Pipeline registry: output path to pipeline, fixed for the session.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_types::{Artifact, BuildState, EventEmitter, KilnError, Result};

use crate::adapter::{EmitterSink, FanoutSink, TracingSink, TransformAdapter};
use crate::descriptor::BundleDescriptor;
use crate::graph::ModuleGraphAdapter;
use crate::pipeline::BundlePipeline;

/// Per-pipeline results of [`PipelineRegistry::build_all`], in registration order.
#[derive(Debug)]
pub struct BuildAllReport {
    pub results: Vec<(String, Result<Artifact>)>,
}

impl BuildAllReport {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    /// Output keys of the pipelines that failed.
    pub fn failed(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(key, _)| key.as_str())
            .collect()
    }
}

pub struct PipelineRegistry {
    root: PathBuf,
    output_root: PathBuf,
    events: EventEmitter,
    pipelines: Vec<Arc<BundlePipeline>>,
    index: HashMap<String, usize>,
}

impl PipelineRegistry {
    /// `root` is the project root entry sources are resolved against;
    /// artifacts are written under `output_root`.
    pub fn new(
        root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        events: EventEmitter,
    ) -> Self {
        Self {
            root: root.into(),
            output_root: output_root.into(),
            events,
            pipelines: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Register a descriptor backed by the built-in module graph adapter.
    pub fn register(&mut self, descriptor: BundleDescriptor) -> Result<Arc<BundlePipeline>> {
        let adapter = ModuleGraphAdapter::new(
            self.root.clone(),
            descriptor.file_name(),
            &descriptor.transforms,
            descriptor.debug,
        );
        self.register_with_adapter(descriptor, Box::new(adapter))
    }

    /// Register a descriptor backed by a caller-supplied adapter.
    pub fn register_with_adapter(
        &mut self,
        descriptor: BundleDescriptor,
        adapter: Box<dyn TransformAdapter>,
    ) -> Result<Arc<BundlePipeline>> {
        descriptor.validate()?;
        if self.index.contains_key(&descriptor.output) {
            return Err(KilnError::DuplicateOutput(descriptor.output));
        }

        let key = descriptor.output.clone();
        let sink = FanoutSink::new()
            .with(TracingSink::new(key.clone()))
            .with(EmitterSink::new(key.clone(), self.events.clone()));
        let pipeline = Arc::new(BundlePipeline::new(
            descriptor,
            self.output_root.clone(),
            adapter,
            Arc::new(sink),
            self.events.clone(),
        ));

        tracing::debug!(pipeline = %key, "Registered bundle");
        self.index.insert(key, self.pipelines.len());
        self.pipelines.push(pipeline.clone());
        Ok(pipeline)
    }

    pub fn get(&self, output: &str) -> Option<Arc<BundlePipeline>> {
        self.index.get(output).map(|&i| self.pipelines[i].clone())
    }

    pub fn contains(&self, output: &str) -> bool {
        self.index.contains_key(output)
    }

    /// All pipelines in registration order.
    pub fn all(&self) -> &[Arc<BundlePipeline>] {
        &self.pipelines
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Build every pipeline concurrently and wait for all of them. A failing
    /// pipeline does not stop the others.
    pub async fn build_all(&self) -> BuildAllReport {
        let handles: Vec<_> = self
            .pipelines
            .iter()
            .map(|pipeline| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move { pipeline.build().await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (pipeline, handle) in self.pipelines.iter().zip(handles) {
            let result = handle.await.unwrap_or_else(|e| {
                Err(KilnError::Transform {
                    file: pipeline.key().to_string(),
                    message: format!("build task aborted: {}", e),
                })
            });
            results.push((pipeline.key().to_string(), result));
        }

        let report = BuildAllReport { results };
        if report.is_success() {
            tracing::info!(bundles = self.pipelines.len(), "All bundles built");
        } else {
            tracing::warn!(failed = ?report.failed(), "Some bundles failed");
        }
        report
    }

    /// Snapshot of every pipeline's state, in registration order.
    pub fn states(&self) -> Vec<(String, BuildState)> {
        self.pipelines
            .iter()
            .map(|p| (p.key().to_string(), p.state()))
            .collect()
    }
}
