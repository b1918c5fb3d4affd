//! Staged migration engine: planning, patch application, build/test
//! verification and repair, snapshots, and the pipeline that ties them
//! together.

pub mod apply;
pub mod backup;
pub mod executor;
pub mod fixer;
pub mod pipeline;
pub mod planner;
pub mod verifier;

pub use backup::{Backup, BackupManager, Snapshot};
pub use executor::{ExecutorSettings, StageExecutor};
pub use fixer::BuildFixer;
pub use pipeline::{load_manifest, Pipeline};
pub use planner::PatchPlanner;
pub use verifier::{CommandVerifier, Verifier, VerifyCommands};
