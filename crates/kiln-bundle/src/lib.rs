//! Bundle pipelines, the pipeline registry, and the built-in transform adapter.
//!
//! A [`BundlePipeline`] owns one output artifact and a long-lived
//! [`TransformAdapter`] whose module cache makes incremental rebuilds cheap.
//! The [`PipelineRegistry`] maps output paths to pipelines and builds them as
//! independent failure domains.

pub mod adapter;
pub mod descriptor;
pub mod graph;
pub mod pipeline;
pub mod registry;
pub mod sourcemap;
pub mod transforms;
pub mod writer;

pub use adapter::{EmitterSink, FanoutSink, LogSink, TracingSink, TransformAdapter, TransformOutput};
pub use descriptor::{BundleDescriptor, TransformConfig};
pub use graph::ModuleGraphAdapter;
pub use pipeline::{BundlePipeline, PipelineUpdate};
pub use registry::{BuildAllReport, PipelineRegistry};
pub use sourcemap::SourceMapBuilder;
pub use transforms::{
    build_chain, CommandTransform, JsonTransform, ModuleTransform, TemplateTransform,
};
pub use writer::write_artifact;
