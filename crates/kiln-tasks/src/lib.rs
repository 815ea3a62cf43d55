//! Named build tasks and the staged task executor.
//!
//! Tasks are grouped into stages. Every task of a stage runs concurrently,
//! and a stage starts only after every task of the previous one has settled.

pub mod builtin;
pub mod executor;
pub mod task;

pub use executor::{RunReport, Stage, StageExecutor, StageReport, TaskReport, TaskStatus};
pub use task::{action_fn, FnAction, TaskAction, TaskRegistry};
