//! Dev process supervisor.
//!
//! Keeps at most one instance of the dev server alive. Restarts terminate the
//! old instance (SIGTERM to its process group, then SIGKILL after a grace
//! period) before the new one is spawned, and restart requests that arrive
//! while one is in flight collapse into a single follow-up restart.

pub mod retry;
pub mod supervisor;
pub mod terminate;

pub use retry::BackoffPolicy;
pub use supervisor::{ProcessSpec, ProcessSupervisor, SupervisorConfig, SupervisorState};
pub use terminate::terminate;
