//! Configuration and orchestration behind the `kiln` binary.

pub mod config;
pub mod orchestrator;

pub use config::{
    KilnConfig, ServerConfig, StageConfig, TaskConfig, WatchConfig, DEFAULT_CONFIG_FILE,
};
pub use orchestrator::{Mode, Orchestrator};
