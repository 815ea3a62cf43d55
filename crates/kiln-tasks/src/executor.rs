//! Staged task executor.
//!
//! Runs an ordered list of stages. Tasks within a stage run concurrently and
//! always all settle; a failure never aborts its siblings. Later stages still
//! run after a failure unless they are gated with `requires_success`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use kiln_types::{BuildEvent, EventEmitter, KilnError, Result};

use crate::task::TaskRegistry;

/// A group of task names run concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub tasks: Vec<String>,
    /// Skip this stage if any earlier stage had a failure.
    pub requires_success: bool,
}

impl Stage {
    pub fn new<I, S>(tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tasks: tasks.into_iter().map(Into::into).collect(),
            requires_success: false,
        }
    }

    pub fn gated(mut self) -> Self {
        self.requires_success = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum TaskStatus {
    Succeeded,
    Failed(String),
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub name: String,
    pub stage: usize,
    pub status: TaskStatus,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub index: usize,
    /// Task reports in declared order.
    pub tasks: Vec<TaskReport>,
}

impl StageReport {
    pub fn failed(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed(_)))
            .count()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
}

impl RunReport {
    /// True when every task ran and succeeded.
    pub fn is_success(&self) -> bool {
        self.tasks().all(|t| t.status == TaskStatus::Succeeded)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskReport> {
        self.stages.iter().flat_map(|s| s.tasks.iter())
    }

    pub fn failed_tasks(&self) -> Vec<&str> {
        self.tasks()
            .filter(|t| matches!(t.status, TaskStatus::Failed(_)))
            .map(|t| t.name.as_str())
            .collect()
    }

    pub fn status_of(&self, task: &str) -> Option<&TaskStatus> {
        self.tasks().find(|t| t.name == task).map(|t| &t.status)
    }
}

/// Clears the executor's running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct StageExecutor {
    tasks: Arc<TaskRegistry>,
    events: EventEmitter,
    running: AtomicBool,
}

impl StageExecutor {
    pub fn new(tasks: Arc<TaskRegistry>, events: EventEmitter) -> Self {
        Self {
            tasks,
            events,
            running: AtomicBool::new(false),
        }
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run `stages` in order. Fails with [`KilnError::SchedulerBusy`] if a run
    /// is already in flight, and with [`KilnError::UnknownTask`] before
    /// anything runs if a stage names an unregistered task. Task failures are
    /// reported in the [`RunReport`], not as an error.
    pub async fn run(&self, stages: &[Stage]) -> Result<RunReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(KilnError::SchedulerBusy);
        }
        let _guard = RunGuard(&self.running);

        for name in stages.iter().flat_map(|s| s.tasks.iter()) {
            if !self.tasks.contains(name) {
                return Err(KilnError::UnknownTask(name.clone()));
            }
        }

        let started = Instant::now();
        let mut report = RunReport::default();
        let mut any_failed = false;

        for (index, stage) in stages.iter().enumerate() {
            let stage_report = if stage.requires_success && any_failed {
                tracing::warn!(
                    stage = index,
                    tasks = ?stage.tasks,
                    "Skipping stage after earlier failure"
                );
                StageReport {
                    index,
                    tasks: stage
                        .tasks
                        .iter()
                        .map(|name| TaskReport {
                            name: name.clone(),
                            stage: index,
                            status: TaskStatus::Skipped,
                            duration_ms: 0,
                        })
                        .collect(),
                }
            } else {
                self.run_stage(index, stage).await
            };

            let failed = stage_report.failed();
            any_failed |= failed > 0
                || stage_report
                    .tasks
                    .iter()
                    .any(|t| t.status == TaskStatus::Skipped);
            self.events.emit(BuildEvent::StageFinished { index, failed });
            report.stages.push(stage_report);
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if report.is_success() {
            tracing::info!(stages = stages.len(), elapsed_ms, "Run finished");
        } else {
            tracing::warn!(
                failed = ?report.failed_tasks(),
                elapsed_ms,
                "Run finished with failures"
            );
        }
        Ok(report)
    }

    async fn run_stage(&self, index: usize, stage: &Stage) -> StageReport {
        tracing::info!(stage = index, tasks = ?stage.tasks, "Starting stage");
        self.events.emit(BuildEvent::StageStarted {
            index,
            tasks: stage.tasks.clone(),
        });

        let handles: Vec<_> = stage
            .tasks
            .iter()
            .map(|name| {
                let tasks = self.tasks.clone();
                let events = self.events.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    events.emit(BuildEvent::TaskStarted { task: name.clone() });
                    let started = Instant::now();
                    let result = tasks.run_task(&name).await;
                    let duration_ms = started.elapsed().as_millis() as u64;
                    events.emit(BuildEvent::TaskFinished {
                        task: name,
                        success: result.is_ok(),
                        duration_ms,
                    });
                    (result, duration_ms)
                })
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (name, handle) in stage.tasks.iter().zip(handles) {
            let (status, duration_ms) = match handle.await {
                Ok((Ok(()), ms)) => (TaskStatus::Succeeded, ms),
                Ok((Err(e), ms)) => (TaskStatus::Failed(e.to_string()), ms),
                Err(e) => (TaskStatus::Failed(format!("task aborted: {}", e)), 0),
            };
            reports.push(TaskReport {
                name: name.clone(),
                stage: index,
                status,
                duration_ms,
            });
        }

        StageReport {
            index,
            tasks: reports,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::action_fn;
    use std::sync::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records "start:<name>" and "end:<name>" around a sleep.
    fn recording(
        log: &Log,
        name: &'static str,
        ms: u64,
        fail: bool,
    ) -> impl crate::TaskAction + 'static {
        let log = log.clone();
        action_fn(move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("start:{name}"));
                tokio::time::sleep(Duration::from_millis(ms)).await;
                log.lock().unwrap().push(format!("end:{name}"));
                if fail {
                    Err(KilnError::TaskFailed {
                        task: name.into(),
                        message: "boom".into(),
                    })
                } else {
                    Ok(())
                }
            }
        })
    }

    fn position(log: &[String], entry: &str) -> usize {
        log.iter().position(|e| e == entry).unwrap()
    }

    #[tokio::test]
    async fn stages_run_in_order_and_tasks_within_a_stage_overlap() {
        let log: Log = Arc::default();
        let mut tasks = TaskRegistry::new();
        tasks.register("clean", recording(&log, "clean", 20, false)).unwrap();
        tasks.register("styles", recording(&log, "styles", 40, false)).unwrap();
        tasks.register("scripts", recording(&log, "scripts", 40, false)).unwrap();
        let executor = StageExecutor::new(Arc::new(tasks), EventEmitter::default());

        let report = executor
            .run(&[Stage::new(["clean"]), Stage::new(["styles", "scripts"])])
            .await
            .unwrap();

        assert!(report.is_success());
        let log = log.lock().unwrap();
        assert!(position(&log, "end:clean") < position(&log, "start:styles"));
        assert!(position(&log, "end:clean") < position(&log, "start:scripts"));
        // Both stage-2 tasks started before either finished.
        assert!(position(&log, "start:scripts") < position(&log, "end:styles"));
        assert!(position(&log, "start:styles") < position(&log, "end:scripts"));
    }

    #[tokio::test]
    async fn failure_does_not_abort_siblings_or_later_stages() {
        let log: Log = Arc::default();
        let mut tasks = TaskRegistry::new();
        tasks.register("bad", recording(&log, "bad", 5, true)).unwrap();
        tasks.register("slow", recording(&log, "slow", 30, false)).unwrap();
        tasks.register("after", recording(&log, "after", 1, false)).unwrap();
        let executor = StageExecutor::new(Arc::new(tasks), EventEmitter::default());

        let report = executor
            .run(&[Stage::new(["bad", "slow"]), Stage::new(["after"])])
            .await
            .unwrap();

        assert!(!report.is_success());
        assert_eq!(report.failed_tasks(), vec!["bad"]);
        assert_eq!(report.status_of("slow"), Some(&TaskStatus::Succeeded));
        assert_eq!(report.status_of("after"), Some(&TaskStatus::Succeeded));
        // Declared order, not completion order.
        let names: Vec<_> = report.stages[0].tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["bad", "slow"]);
    }

    #[tokio::test]
    async fn gated_stage_is_skipped_after_failure() {
        let log: Log = Arc::default();
        let mut tasks = TaskRegistry::new();
        tasks.register("build", recording(&log, "build", 1, true)).unwrap();
        tasks.register("serve", recording(&log, "serve", 1, false)).unwrap();
        let executor = StageExecutor::new(Arc::new(tasks), EventEmitter::default());

        let report = executor
            .run(&[Stage::new(["build"]), Stage::new(["serve"]).gated()])
            .await
            .unwrap();

        assert_eq!(report.status_of("serve"), Some(&TaskStatus::Skipped));
        assert!(!log.lock().unwrap().iter().any(|e| e == "start:serve"));
    }

    #[tokio::test]
    async fn overlapping_runs_are_rejected() {
        let log: Log = Arc::default();
        let mut tasks = TaskRegistry::new();
        tasks.register("slow", recording(&log, "slow", 100, false)).unwrap();
        let executor = Arc::new(StageExecutor::new(Arc::new(tasks), EventEmitter::default()));

        let first = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run(&[Stage::new(["slow"])]).await })
        };
        while !executor.is_running() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let err = executor.run(&[Stage::new(["slow"])]).await.unwrap_err();
        assert!(matches!(err, KilnError::SchedulerBusy));

        assert!(first.await.unwrap().unwrap().is_success());
        assert!(!executor.is_running());
        assert!(executor.run(&[Stage::new(["slow"])]).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_task_fails_before_anything_runs() {
        let log: Log = Arc::default();
        let mut tasks = TaskRegistry::new();
        tasks.register("clean", recording(&log, "clean", 1, false)).unwrap();
        let executor = StageExecutor::new(Arc::new(tasks), EventEmitter::default());

        let err = executor
            .run(&[Stage::new(["clean"]), Stage::new(["missing"])])
            .await
            .unwrap_err();

        assert!(matches!(err, KilnError::UnknownTask(ref n) if n == "missing"));
        assert!(log.lock().unwrap().is_empty());
        assert!(!executor.is_running());
    }

    #[tokio::test]
    async fn stage_and_task_events_are_emitted() {
        let log: Log = Arc::default();
        let mut tasks = TaskRegistry::new();
        tasks.register("a", recording(&log, "a", 1, false)).unwrap();
        let events = EventEmitter::default();
        let mut rx = events.subscribe();
        let executor = StageExecutor::new(Arc::new(tasks), events);

        executor.run(&[Stage::new(["a"])]).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(match event {
                BuildEvent::StageStarted { .. } => "stage_started",
                BuildEvent::TaskStarted { .. } => "task_started",
                BuildEvent::TaskFinished { success: true, .. } => "task_finished",
                BuildEvent::StageFinished { failed: 0, .. } => "stage_finished",
                _ => "other",
            });
        }
        assert_eq!(
            seen,
            vec!["stage_started", "task_started", "task_finished", "stage_finished"]
        );
    }
}
