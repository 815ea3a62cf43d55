use std::sync::Arc;

use async_trait::async_trait;

use kiln_bundle::PipelineRegistry;
use kiln_types::{KilnError, Result};

use crate::task::TaskAction;

/// Builds every registered bundle. Fails if any bundle failed; the others
/// still finish.
pub struct BundlesTask {
    name: String,
    registry: Arc<PipelineRegistry>,
}

impl BundlesTask {
    pub fn new(name: impl Into<String>, registry: Arc<PipelineRegistry>) -> Self {
        Self {
            name: name.into(),
            registry,
        }
    }
}

#[async_trait]
impl TaskAction for BundlesTask {
    async fn run(&self) -> Result<()> {
        let report = self.registry.build_all().await;
        if report.is_success() {
            return Ok(());
        }
        let reasons: Vec<String> = report
            .results
            .iter()
            .filter_map(|(key, r)| r.as_ref().err().map(|e| format!("{}: {}", key, e)))
            .collect();
        Err(KilnError::TaskFailed {
            task: self.name.clone(),
            message: reasons.join("; "),
        })
    }
}
