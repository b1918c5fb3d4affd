//! Runtime adapters for restage (processes, git, run-state persistence, config).

pub mod config;
pub mod git_ops;
pub mod process;
pub mod store;
pub mod util;

pub use config::PipelineConfig;
pub use process::{run_command, CommandOutcome, CommandSpec};
pub use store::{CheckpointStore, ProjectLock};
