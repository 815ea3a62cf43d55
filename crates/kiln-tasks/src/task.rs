//! Task action trait and the named task registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use kiln_types::{KilnError, Result};

// ---------------------------------------------------------------------------
// TaskAction trait
// ---------------------------------------------------------------------------

/// A no-argument build step that either succeeds or fails.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn run(&self) -> Result<()>;
}

/// A [`TaskAction`] backed by an async closure.
pub struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> TaskAction for FnAction<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn run(&self) -> Result<()> {
        (self.0)().await
    }
}

/// Wrap an async closure as a task action.
pub fn action_fn<F, Fut>(f: F) -> FnAction<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    FnAction(f)
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

/// Named tasks, in registration order.
#[derive(Default)]
pub struct TaskRegistry {
    actions: HashMap<String, Arc<dyn TaskAction>>,
    order: Vec<String>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        action: impl TaskAction + 'static,
    ) -> Result<()> {
        self.register_boxed(name, Box::new(action))
    }

    pub fn register_boxed(
        &mut self,
        name: impl Into<String>,
        action: Box<dyn TaskAction>,
    ) -> Result<()> {
        let name = name.into();
        if self.actions.contains_key(&name) {
            return Err(KilnError::DuplicateTask(name));
        }
        self.actions.insert(name.clone(), Arc::from(action));
        self.order.push(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskAction>> {
        self.actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Run one task directly, outside any staged run.
    pub async fn run_task(&self, name: &str) -> Result<()> {
        let action = self
            .get(name)
            .ok_or_else(|| KilnError::UnknownTask(name.to_string()))?;

        let started = Instant::now();
        tracing::info!(task = %name, "Running task");
        let result = action.run().await;
        match &result {
            Ok(()) => tracing::info!(
                task = %name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Task finished"
            ),
            Err(e) => tracing::error!(task = %name, error = %e, "Task failed"),
        }
        result
    }
}
