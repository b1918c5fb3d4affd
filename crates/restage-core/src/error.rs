//! Error taxonomy for the migration engine.
//!
//! Per-item failures (patches, fixes) are captured into result structures and
//! build/test failures are plain data. Only the variants here surface to the
//! caller, and of those only [`MigrationError::Rollback`] signals that the
//! working tree may no longer be recoverable.

use crate::stage::StageId;

pub type MigrationResult<T> = Result<T, MigrationError>;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// A single patch could not be applied.
    #[error("patch {patch_id} failed: {message}")]
    PatchApplication { patch_id: String, message: String },

    /// An external tool exceeded its time budget.
    #[error("{command} timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// Checkpoint persistence failed.
    #[error("checkpoint I/O failed: {0}")]
    CheckpointIo(String),

    /// Restoring a snapshot failed; the safety guarantee is lost.
    #[error("rollback to {snapshot} failed: {message}")]
    Rollback { snapshot: String, message: String },

    /// A critical stage aborted the pipeline.
    #[error("stage {stage_id} ({name}) aborted the migration")]
    StageAborted { stage_id: StageId, name: String },

    /// The patch manifest could not be read or parsed.
    #[error("invalid patch manifest: {0}")]
    Manifest(String),

    /// Another pipeline holds the project lock.
    #[error("project is locked: {0}")]
    Lock(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl MigrationError {
    /// Whether this error means the working tree can no longer be trusted.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Rollback { .. })
    }

    /// Exit code the CLI reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::StageAborted { .. } => 1,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_rollback_is_fatal() {
        let rollback = MigrationError::Rollback {
            snapshot: "abc123".to_string(),
            message: "reset failed".to_string(),
        };
        assert!(rollback.is_fatal());
        assert_eq!(rollback.exit_code(), 2);
        assert_eq!(
            rollback.to_string(),
            "rollback to abc123 failed: reset failed"
        );

        let io = MigrationError::CheckpointIo("disk full".to_string());
        assert!(!io.is_fatal());
    }
}
