//! VCS snapshots and rollback.
//!
//! A snapshot pins HEAD with a `restage/<run>/<label>` branch without
//! switching to it. Restore is a hard reset to the pinned commit plus a
//! clean of untracked files.

use restage_adapters::git_ops;
use restage_core::{MigrationError, MigrationResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DRY_RUN_SNAPSHOT: &str = "dry-run";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub commit: String,
    pub branch: String,
}

impl Snapshot {
    pub fn dry_run() -> Self {
        Self {
            commit: DRY_RUN_SNAPSHOT.to_string(),
            branch: DRY_RUN_SNAPSHOT.to_string(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.commit == DRY_RUN_SNAPSHOT
    }

    /// Identifier reported to the operator.
    pub fn id(&self) -> String {
        if self.is_dry_run() {
            return DRY_RUN_SNAPSHOT.to_string();
        }
        format!("{}@{}", self.branch, &self.commit[..self.commit.len().min(12)])
    }
}

/// Snapshot/restore/commit seam used by the executor and pipeline.
pub trait Backup {
    fn snapshot(&self, label: &str) -> anyhow::Result<Snapshot>;
    fn restore(&self, snapshot: &Snapshot) -> MigrationResult<()>;
    /// Commit all working-tree changes. `None` when there was nothing to commit.
    fn commit(&self, message: &str) -> anyhow::Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    project_root: PathBuf,
    run_tag: String,
    dry_run: bool,
    vcs_timeout: Duration,
}

impl BackupManager {
    pub fn new(project_root: &Path, run_tag: &str, dry_run: bool, vcs_timeout: Duration) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            run_tag: run_tag.to_string(),
            dry_run,
            vcs_timeout,
        }
    }

    pub fn branch_name(&self, label: &str) -> String {
        format!("restage/{}/{}", self.run_tag, sanitize_label(label))
    }
}

fn sanitize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut last_dash = false;
    for c in label.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "snapshot".to_string()
    } else {
        trimmed.to_string()
    }
}

impl Backup for BackupManager {
    fn snapshot(&self, label: &str) -> anyhow::Result<Snapshot> {
        if self.dry_run {
            return Ok(Snapshot::dry_run());
        }
        let (branch, commit) = git_ops::create_branch_at_head(&self.project_root, &self.branch_name(label))?;
        tracing::info!(branch = %branch, commit = %commit, "snapshot created");
        Ok(Snapshot { commit, branch })
    }

    fn restore(&self, snapshot: &Snapshot) -> MigrationResult<()> {
        if self.dry_run || snapshot.is_dry_run() {
            return Ok(());
        }
        tracing::warn!(snapshot = %snapshot.id(), "restoring working tree");
        git_ops::reset_hard_and_clean(&self.project_root, &snapshot.commit, self.vcs_timeout).map_err(
            |e| MigrationError::Rollback {
                snapshot: snapshot.id(),
                message: format!("{:#}", e),
            },
        )
    }

    fn commit(&self, message: &str) -> anyhow::Result<Option<String>> {
        if self.dry_run {
            return Ok(None);
        }
        git_ops::stage_all(&self.project_root)?;
        let commit = git_ops::commit(&self.project_root, message)?;
        if let Some(id) = &commit {
            tracing::info!(commit = %id, "changes committed");
        }
        Ok(commit)
    }
}
