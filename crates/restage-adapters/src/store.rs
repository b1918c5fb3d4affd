//! Run-state persistence under `<project>/.restage/`.
//!
//! Holds the resumable checkpoint, the run report and the project lock.
//! Intermediate checkpoint saves are best-effort: callers log failures and
//! carry on. The terminal save is retried and its failure is surfaced.

use crate::git_ops;
use crate::util::{ensure_ignored, write_atomic};
use anyhow::Context;
use chrono::Utc;
use fs2::FileExt;
use restage_core::{Checkpoint, MigrationError, MigrationResult, RunSummary, CHECKPOINT_VERSION};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

pub const STATE_DIR: &str = ".restage";
const CHECKPOINT_FILE: &str = "checkpoint.json";
const REPORT_FILE: &str = "report.json";
const PROJECT_LOCK_FILE: &str = ".lock";
const WRITE_LOCK_FILE: &str = ".write.lock";
const WRITE_LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;
const TERMINAL_SAVE_ATTEMPTS: u32 = 3;
const TERMINAL_SAVE_PAUSE_MS: u64 = 200;

/// Exclusive hold on a project; released on drop.
#[derive(Debug)]
pub struct ProjectLock {
    file: File,
    path: PathBuf,
}

impl ProjectLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

struct WriteLock {
    file: File,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    project_root: PathBuf,
    state_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            state_dir: project_root.join(STATE_DIR),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join(CHECKPOINT_FILE)
    }

    pub fn report_path(&self) -> PathBuf {
        self.state_dir.join(REPORT_FILE)
    }

    fn ensure_dir(&self) -> anyhow::Result<()> {
        if !self.state_dir.exists() {
            fs::create_dir_all(&self.state_dir).with_context(|| {
                format!("Failed to create {}", self.state_dir.display())
            })?;
        }
        self.ensure_state_dir_ignored()
    }

    /// Keep run state out of the project's commits.
    ///
    /// Goes to the repository's `info/exclude` when the project sits anywhere
    /// inside a git working tree, `.gitignore` otherwise. The working tree
    /// must stay clean for snapshots.
    fn ensure_state_dir_ignored(&self) -> anyhow::Result<()> {
        let entry = format!("{}/", STATE_DIR);
        if let Some(exclude) = git_ops::exclude_file(&self.project_root) {
            let ready = exclude.parent().is_some_and(|dir| fs::create_dir_all(dir).is_ok());
            if ready && ensure_ignored(&exclude, &entry).is_ok() {
                return Ok(());
            }
            tracing::warn!(path = %exclude.display(), "could not update git exclude file; using .gitignore");
        }

        ensure_ignored(&self.project_root.join(".gitignore"), &entry)
    }

    /// Take the exclusive project lock, waiting at most `wait`.
    pub fn lock_project(&self, wait: Duration) -> MigrationResult<ProjectLock> {
        self.ensure_dir()
            .map_err(|e| MigrationError::Lock(format!("{:#}", e)))?;
        let path = self.state_dir.join(PROJECT_LOCK_FILE);
        let file = acquire_exclusive(&path, wait).map_err(|e| {
            MigrationError::Lock(format!("{} ({})", self.project_root.display(), e))
        })?;
        Ok(ProjectLock { file, path })
    }

    fn write_lock(&self) -> anyhow::Result<WriteLock> {
        self.ensure_dir()?;
        let path = self.state_dir.join(WRITE_LOCK_FILE);
        let file = acquire_exclusive(&path, Duration::from_secs(WRITE_LOCK_TIMEOUT_SECS))?;
        Ok(WriteLock { file })
    }

    /// Overwrite the checkpoint atomically.
    pub fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let _lock = self.write_lock()?;
        let content = serde_json::to_string_pretty(checkpoint)?;
        write_atomic(&self.checkpoint_path(), &content)
            .with_context(|| format!("Failed to write {}", self.checkpoint_path().display()))?;
        tracing::debug!(
            step = %checkpoint.current_step,
            processed = checkpoint.progress.processed_files.len(),
            failed = checkpoint.progress.failed_files.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Save at a terminal state, retrying before giving up.
    pub fn save_terminal(&self, checkpoint: &Checkpoint) -> MigrationResult<()> {
        let mut last_error = String::new();
        for attempt in 1..=TERMINAL_SAVE_ATTEMPTS {
            match self.save(checkpoint) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last_error = format!("{:#}", err);
                    tracing::warn!(attempt, error = %last_error, "terminal checkpoint save failed");
                    if attempt < TERMINAL_SAVE_ATTEMPTS {
                        thread::sleep(Duration::from_millis(TERMINAL_SAVE_PAUSE_MS));
                    }
                }
            }
        }
        Err(MigrationError::CheckpointIo(last_error))
    }

    /// Last saved checkpoint, if any.
    ///
    /// Unreadable or unknown-version files are moved aside and treated as
    /// absent.
    pub fn load(&self) -> Option<Checkpoint> {
        let path = self.checkpoint_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to read checkpoint");
                return None;
            }
        };

        match serde_json::from_str::<Checkpoint>(&content) {
            Ok(checkpoint) if checkpoint.version <= CHECKPOINT_VERSION => Some(checkpoint),
            Ok(checkpoint) => {
                let backup = preserve_corrupt(&path, &content);
                tracing::warn!(
                    version = checkpoint.version,
                    backup = %backup.display(),
                    "checkpoint written by a newer version; starting fresh"
                );
                None
            }
            Err(err) => {
                let backup = preserve_corrupt(&path, &content);
                tracing::warn!(
                    error = %err,
                    backup = %backup.display(),
                    "checkpoint was corrupted; a backup was saved and the run starts fresh"
                );
                None
            }
        }
    }

    /// Delete the checkpoint. Returns whether one existed.
    pub fn clear(&self) -> anyhow::Result<bool> {
        let path = self.checkpoint_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    pub fn write_report(&self, summary: &RunSummary) -> anyhow::Result<PathBuf> {
        let _lock = self.write_lock()?;
        let path = self.report_path();
        let content = serde_json::to_string_pretty(summary)?;
        write_atomic(&path, &content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

fn acquire_exclusive(path: &Path, wait: Duration) -> anyhow::Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let start = Instant::now();
    loop {
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => return Ok(file),
            Err(err) => {
                if err.kind() != ErrorKind::WouldBlock {
                    return Err(err.into());
                }
                if start.elapsed() >= wait {
                    return Err(anyhow::anyhow!(
                        "held by another process after waiting {}ms",
                        wait.as_millis()
                    ));
                }
                thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
            }
        }
    }
}

fn preserve_corrupt(path: &Path, content: &str) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| CHECKPOINT_FILE.to_string());
    let corrupt_path = path.with_file_name(format!("{}.corrupt-{}", file_name, stamp));
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
        let _ = fs::remove_file(path);
    }
    corrupt_path
}
