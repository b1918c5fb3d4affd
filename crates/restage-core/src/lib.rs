//! Core domain model and contracts for restage.
//!
//! Everything here is plain data: patches and the stages they are planned
//! into, build/test results, fixes, the resumable checkpoint, and the run
//! summary. The engine and adapters crates own the behavior.

pub mod build;
pub mod checkpoint;
pub mod context;
pub mod error;
pub mod patch;
pub mod report;
pub mod stage;

pub use build::*;
pub use checkpoint::*;
pub use context::*;
pub use error::{MigrationError, MigrationResult};
pub use patch::*;
pub use report::*;
pub use stage::*;
