//! Applies a patch's file-level changes to the working tree.
//!
//! Application is idempotent so a retried stage can re-apply patches that
//! already landed: creates overwrite, deleting a missing file is a no-op and
//! a move whose source is gone but whose target exists counts as done.
//! A patch whose changes fail part way is undone before the error returns.

use restage_adapters::util::resolve_in_project;
use restage_core::{Change, ChangeKind, MigrationError, MigrationResult, Patch};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PatchApplier {
    project_root: PathBuf,
    dry_run: bool,
}

/// Pre-patch state of one path, for undo.
struct Original {
    path: PathBuf,
    content: Option<Vec<u8>>,
}

impl PatchApplier {
    pub fn new(project_root: &Path, dry_run: bool) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            dry_run,
        }
    }

    pub fn apply(&self, patch: &Patch) -> MigrationResult<()> {
        let fail = |message: String| MigrationError::PatchApplication {
            patch_id: patch.id.clone(),
            message,
        };

        if patch.changes.is_empty() {
            return Err(fail("patch has no changes".to_string()));
        }

        if self.dry_run {
            for change in &patch.changes {
                self.check(change).map_err(fail)?;
            }
            tracing::debug!(patch_id = %patch.id, "dry run: patch validated");
            return Ok(());
        }

        let originals = self.capture(patch).map_err(fail)?;
        for (index, change) in patch.changes.iter().enumerate() {
            if let Err(message) = self.apply_change(change) {
                restore(&originals);
                return Err(fail(format!(
                    "change {} ({} {}): {}",
                    index + 1,
                    change.kind.as_str(),
                    change.target_path,
                    message
                )));
            }
        }
        tracing::debug!(patch_id = %patch.id, changes = patch.changes.len(), "patch applied");
        Ok(())
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        resolve_in_project(&self.project_root, Path::new(path)).map(|p| p.absolute)
    }

    /// Read-only precondition check used by dry runs.
    fn check(&self, change: &Change) -> Result<(), String> {
        let target = self.resolve(&change.target_path)?;
        match change.kind {
            ChangeKind::Create => require_content(change).map(|_| ()),
            ChangeKind::Modify => {
                require_content(change)?;
                if !target.is_file() {
                    return Err(format!("{} does not exist", change.target_path));
                }
                Ok(())
            }
            ChangeKind::Delete => Ok(()),
            ChangeKind::Move => {
                let source = self.resolve(require_source(change)?)?;
                if !source.exists() && !target.exists() {
                    return Err(format!(
                        "neither {} nor {} exists",
                        source.display(),
                        change.target_path
                    ));
                }
                Ok(())
            }
        }
    }

    fn capture(&self, patch: &Patch) -> Result<Vec<Original>, String> {
        let mut originals = Vec::new();
        for raw in patch.touched_paths() {
            let path = self.resolve(raw)?;
            if originals.iter().any(|o: &Original| o.path == path) {
                continue;
            }
            let content = if path.is_file() {
                Some(fs::read(&path).map_err(|e| format!("failed to read {}: {}", raw, e))?)
            } else {
                None
            };
            originals.push(Original { path, content });
        }
        Ok(originals)
    }

    fn apply_change(&self, change: &Change) -> Result<(), String> {
        let target = self.resolve(&change.target_path)?;
        match change.kind {
            ChangeKind::Create => write_file(&target, require_content(change)?),
            ChangeKind::Modify => {
                let content = require_content(change)?;
                if !target.is_file() {
                    return Err("target does not exist".to_string());
                }
                write_file(&target, content)
            }
            ChangeKind::Delete => match fs::remove_file(&target) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(format!("failed to delete: {}", e)),
            },
            ChangeKind::Move => {
                let source = self.resolve(require_source(change)?)?;
                if source.exists() {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)
                            .map_err(|e| format!("failed to create directory: {}", e))?;
                    }
                    fs::rename(&source, &target).map_err(|e| format!("failed to move: {}", e))?;
                } else if !target.exists() {
                    return Err("move source does not exist".to_string());
                }
                match change.content.as_deref() {
                    Some(content) => write_file(&target, content),
                    None => Ok(()),
                }
            }
        }
    }
}

fn require_content(change: &Change) -> Result<&str, String> {
    change
        .content
        .as_deref()
        .ok_or_else(|| format!("{} change has no content", change.kind.as_str()))
}

fn require_source(change: &Change) -> Result<&str, String> {
    change
        .source_path
        .as_deref()
        .ok_or_else(|| "move change has no sourcePath".to_string())
}

fn write_file(path: &Path, content: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create directory: {}", e))?;
    }
    fs::write(path, content).map_err(|e| format!("failed to write: {}", e))
}

fn restore(originals: &[Original]) {
    for original in originals {
        let result = match &original.content {
            Some(bytes) => fs::write(&original.path, bytes),
            None => match fs::remove_file(&original.path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(err) = result {
            tracing::warn!(path = %original.path.display(), error = %err, "failed to undo partial patch");
        }
    }
}
