//! Shared types, errors, and build events for the Kiln build orchestrator.
//!
//! This crate provides the foundational types used across all other Kiln crates:
//! - `KilnError` — unified error taxonomy
//! - `BuildState` — lifecycle state of a bundle pipeline
//! - `Artifact` — a written output file and its content hash
//! - `EventEmitter` / `BuildEvent` — the broadcast bus components observe each other through

pub mod events;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use events::{BuildEvent, EventEmitter};

/// Unified error type for all Kiln subsystems.
#[derive(Debug, thiserror::Error)]
pub enum KilnError {
    // === Bundle Errors ===
    #[error("Transform failed for {file}: {message}")]
    Transform { file: String, message: String },

    #[error("Failed to write {}: {message}", path.display())]
    WriteFailed { path: PathBuf, message: String },

    #[error("Duplicate bundle output path '{0}'")]
    DuplicateOutput(String),

    #[error("No pipeline registered for output '{0}'")]
    UnknownPipeline(String),

    // === Scheduler Errors ===
    #[error("A task graph run is already in flight")]
    SchedulerBusy,

    #[error("No task named '{0}'")]
    UnknownTask(String),

    #[error("Duplicate task name '{0}'")]
    DuplicateTask(String),

    #[error("Task '{task}' failed: {message}")]
    TaskFailed { task: String, message: String },

    // === Process Errors ===
    #[error("Process '{command}' failed: {message}")]
    Process { command: String, message: String },

    #[error("Process '{command}' did not exit within {grace_ms}ms")]
    ProcessTimeout { command: String, grace_ms: u64 },

    #[error("Process '{command}' is already running")]
    AlreadyRunning { command: String },

    #[error("No process is running")]
    NotRunning,

    #[error("Process '{command}' failed to start after {attempts} attempts")]
    StartAttemptsExhausted { command: String, attempts: usize },

    // === Configuration Errors ===
    #[error("Invalid glob '{pattern}': {message}")]
    InvalidGlob { pattern: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KilnError {
    /// Returns `true` if the error should end the session rather than be logged
    /// and retried on the next change.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KilnError::StartAttemptsExhausted { .. })
    }

    /// Short label used in diagnostics and events.
    pub fn kind(&self) -> &'static str {
        match self {
            KilnError::Transform { .. } => "transform",
            KilnError::WriteFailed { .. } | KilnError::Io(_) => "io",
            KilnError::Process { .. }
            | KilnError::ProcessTimeout { .. }
            | KilnError::AlreadyRunning { .. }
            | KilnError::NotRunning
            | KilnError::StartAttemptsExhausted { .. } => "process",
            KilnError::SchedulerBusy => "scheduler_busy",
            KilnError::TaskFailed { .. } => "task",
            _ => "config",
        }
    }
}

/// A convenience alias for `Result<T, KilnError>`.
pub type Result<T> = std::result::Result<T, KilnError>;

// ---------------------------------------------------------------------------
// BuildState — lifecycle of a bundle pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "error")]
pub enum BuildState {
    Idle,
    Building,
    Ready,
    Failed(String),
}

impl BuildState {
    pub fn is_failed(&self) -> bool {
        matches!(self, BuildState::Failed(_))
    }
}

// ---------------------------------------------------------------------------
// Artifact — a written bundle
// ---------------------------------------------------------------------------

/// An artifact written under the output root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Absolute path of the written file.
    pub path: PathBuf,
    /// Sibling sourcemap, present when the bundle was built in debug mode.
    pub sourcemap: Option<PathBuf>,
    /// Hex-encoded SHA-256 of the artifact bytes.
    pub content_hash: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exhausted_starts_are_fatal() {
        let fatal = KilnError::StartAttemptsExhausted {
            command: "node".into(),
            attempts: 3,
        };
        assert!(fatal.is_fatal());

        let transform = KilnError::Transform {
            file: "src/a.js".into(),
            message: "unexpected token".into(),
        };
        assert!(!transform.is_fatal());
        assert!(!KilnError::SchedulerBusy.is_fatal());
        assert!(!KilnError::ProcessTimeout {
            command: "node".into(),
            grace_ms: 10
        }
        .is_fatal());
    }

    #[test]
    fn error_kinds() {
        let io = KilnError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert_eq!(io.kind(), "io");
        assert_eq!(KilnError::SchedulerBusy.kind(), "scheduler_busy");
        assert_eq!(KilnError::NotRunning.kind(), "process");
        assert_eq!(KilnError::Config("bad".into()).kind(), "config");
    }

    #[test]
    fn transform_error_names_source() {
        let err = KilnError::Transform {
            file: "src/main/index.js".into(),
            message: "Cannot find module './missing'".into(),
        };
        let text = err.to_string();
        assert!(text.contains("src/main/index.js"));
        assert!(text.contains("./missing"));
    }

    #[test]
    fn build_state_serializes_with_error() {
        let state = BuildState::Failed("boom".into());
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["error"], "boom");
        assert!(state.is_failed());
        assert!(!BuildState::Ready.is_failed());
    }
}
