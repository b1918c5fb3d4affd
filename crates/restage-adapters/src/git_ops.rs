//! Git operations backing snapshots, stage commits and rollback.
//!
//! Inspection, branches and commits go through git2. Reset and clean shell
//! out to `git` under a timeout since git2 has no equivalent of `clean -fd`.

use crate::util::{clip, run_bounded};
use anyhow::{Context, Result};
use git2::{BranchType, ErrorCode, IndexAddOption, Repository, Signature, StatusOptions};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const GIT_STDERR_LIMIT: usize = 64 * 1024;

fn open(path: &Path) -> Result<Repository> {
    Repository::discover(path)
        .with_context(|| format!("{} is not inside a git repository", path.display()))
}

fn head_of(repo: &Repository) -> Result<git2::Commit<'_>> {
    repo.head()
        .and_then(|head| head.peel_to_commit())
        .context("repository has no commit at HEAD")
}

pub fn is_repository(path: &Path) -> bool {
    open(path).is_ok()
}

/// The repository's shared `info/exclude`, found from anywhere inside the
/// working tree. Linked worktrees resolve to the main repository's file.
pub fn exclude_file(path: &Path) -> Option<PathBuf> {
    let repo = open(path).ok()?;
    Some(repo.commondir().join("info").join("exclude"))
}

/// Commit id HEAD points at.
pub fn head_commit(repo_path: &Path) -> Result<String> {
    let repo = open(repo_path)?;
    let id = head_of(&repo)?.id();
    Ok(id.to_string())
}

/// Whether the working tree has staged, modified or untracked changes.
///
/// Covers the whole repository, since a restore resets all of it.
pub fn is_dirty(repo_path: &Path) -> Result<bool> {
    let repo = open(repo_path)?;
    let mut filter = StatusOptions::new();
    filter
        .include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false)
        .exclude_submodules(true);
    let changes = repo.statuses(Some(&mut filter))?;
    Ok(changes.iter().next().is_some())
}

/// Create `name` at HEAD without switching branches.
///
/// An existing branch at the same commit is reused; one pointing elsewhere
/// gets a numbered sibling so earlier restore points are never moved.
/// Returns `(branch_name, commit_id)`.
pub fn create_branch_at_head(repo_path: &Path, name: &str) -> Result<(String, String)> {
    let repo = open(repo_path)?;
    let target = head_of(&repo)?;
    let target_id = target.id().to_string();

    let existing_tip = match repo.find_branch(name, BranchType::Local) {
        Ok(branch) => Some(branch.get().peel_to_commit()?.id()),
        Err(_) => None,
    };
    let branch = match existing_tip {
        Some(tip) if tip == target.id() => return Ok((name.to_string(), target_id)),
        Some(_) => free_branch_name(&repo, name)?,
        None => name.to_string(),
    };

    repo.branch(&branch, &target, false)
        .with_context(|| format!("could not create snapshot branch {}", branch))?;
    Ok((branch, target_id))
}

fn free_branch_name(repo: &Repository, base: &str) -> Result<String> {
    (2..100)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| repo.find_branch(candidate, BranchType::Local).is_err())
        .ok_or_else(|| anyhow::anyhow!("every snapshot branch name under {} is taken", base))
}

/// Stage every change in the working tree, deletions included.
pub fn stage_all(repo_path: &Path) -> Result<()> {
    let repo = open(repo_path)?;
    let mut index = repo.index()?;
    let everything = ["*"];
    index
        .add_all(everything.iter(), IndexAddOption::DEFAULT, None)
        .and_then(|_| index.update_all(everything.iter(), None))
        .context("could not stage working tree changes")?;
    index.write()?;
    Ok(())
}

/// Commit the index. Returns `None` when the tree is unchanged from HEAD.
pub fn commit(repo_path: &Path, message: &str) -> Result<Option<String>> {
    let repo = open(repo_path)?;
    let tree = repo.find_tree(repo.index()?.write_tree()?)?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => None,
        Err(err) => return Err(err.into()),
    };
    if parent.as_ref().is_some_and(|p| p.tree_id() == tree.id()) {
        return Ok(None);
    }

    let settings = repo.config()?;
    let author = Signature::now(
        &settings.get_string("user.name").unwrap_or_else(|_| "restage".into()),
        &settings.get_string("user.email").unwrap_or_else(|_| "restage@local".into()),
    )?;
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let oid = repo.commit(Some("HEAD"), &author, &author, message, &tree, &parents)?;
    Ok(Some(oid.to_string()))
}

/// `git reset --hard <commit>` followed by `git clean -fd`.
pub fn reset_hard_and_clean(repo_path: &Path, commit: &str, timeout: Duration) -> Result<()> {
    run_git(repo_path, &["reset", "--hard", commit], timeout)?;
    run_git(repo_path, &["clean", "-fd"], timeout)?;
    Ok(())
}

fn run_git(repo_path: &Path, args: &[&str], timeout: Duration) -> Result<()> {
    let label = format!("git {}", args.join(" "));
    let mut git = Command::new("git");
    git.current_dir(repo_path).args(args);
    let captured = run_bounded(&mut git, timeout, GIT_STDERR_LIMIT)
        .map_err(|e| anyhow::anyhow!("{}: {}", label, e))?;

    match (captured.timed_out, captured.exited_cleanly()) {
        (true, _) => Err(anyhow::anyhow!("{} exceeded {}s", label, timeout.as_secs())),
        (false, false) => Err(anyhow::anyhow!(
            "{} exited with {:?}: {}",
            label,
            captured.status.and_then(|s| s.code()),
            clip(captured.stderr.trim(), 500)
        )),
        (false, true) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();
        fs::write(dir.path().join("main.go"), "package main\n").unwrap();
        stage_all(dir.path()).unwrap();
        commit(dir.path(), "initial").unwrap();
        dir
    }

    #[test]
    fn test_commit_skips_unchanged_tree() {
        let dir = init_repo();
        stage_all(dir.path()).unwrap();
        assert_eq!(commit(dir.path(), "noop").unwrap(), None);

        fs::write(dir.path().join("lib.go"), "package main\n").unwrap();
        assert!(is_dirty(dir.path()).unwrap());
        stage_all(dir.path()).unwrap();
        assert!(commit(dir.path(), "add lib").unwrap().is_some());
        assert!(!is_dirty(dir.path()).unwrap());
    }

    #[test]
    fn test_branch_at_head_does_not_checkout() {
        let dir = init_repo();
        let head = head_commit(dir.path()).unwrap();
        let (name, commit_id) = create_branch_at_head(dir.path(), "restage/abc/start").unwrap();
        assert_eq!(name, "restage/abc/start");
        assert_eq!(commit_id, head);

        let repo = Repository::open(dir.path()).unwrap();
        let current = repo.head().unwrap();
        assert_ne!(current.shorthand(), Some("restage/abc/start"));

        // Same commit: reused.
        let (again, _) = create_branch_at_head(dir.path(), "restage/abc/start").unwrap();
        assert_eq!(again, "restage/abc/start");
    }

    #[test]
    fn test_exclude_file_found_from_subdirectory() {
        let dir = init_repo();
        fs::create_dir_all(dir.path().join("services/billing")).unwrap();
        let exclude = exclude_file(&dir.path().join("services/billing")).unwrap();
        let expected = dir.path().join(".git/info/exclude");
        assert_eq!(
            exclude.parent().unwrap().canonicalize().unwrap(),
            expected.parent().unwrap().canonicalize().unwrap()
        );
        assert!(exclude_file(tempfile::tempdir().unwrap().path()).is_none());
    }

    #[test]
    fn test_stage_all_picks_up_deletions() {
        let dir = init_repo();
        fs::remove_file(dir.path().join("main.go")).unwrap();
        stage_all(dir.path()).unwrap();
        assert!(commit(dir.path(), "remove main").unwrap().is_some());
        assert!(!is_dirty(dir.path()).unwrap());
    }

    #[test]
    fn test_reset_hard_and_clean_restores_tree() {
        let dir = init_repo();
        let head = head_commit(dir.path()).unwrap();
        fs::write(dir.path().join("main.go"), "package broken\n").unwrap();
        fs::create_dir_all(dir.path().join("internal")).unwrap();
        fs::write(dir.path().join("internal/new.go"), "package internal\n").unwrap();

        reset_hard_and_clean(dir.path(), &head, Duration::from_secs(30)).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("main.go")).unwrap(),
            "package main\n"
        );
        assert!(!dir.path().join("internal/new.go").exists());
    }

    #[test]
    fn test_reset_to_unknown_commit_fails() {
        let dir = init_repo();
        let err = reset_hard_and_clean(dir.path(), "deadbeef", Duration::from_secs(30));
        assert!(err.is_err());
    }
}
