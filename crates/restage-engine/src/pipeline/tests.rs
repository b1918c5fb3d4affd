use super::*;
use crate::backup::BackupManager;
use crate::verifier::{CommandVerifier, VerifyCommands};
use restage_core::{Change, ChangeKind, Patch, RunOptions};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::PathBuf;

/// Scripted build outcomes, then passing builds once the script runs out.
#[derive(Default)]
struct FakeVerifier {
    builds: RefCell<VecDeque<bool>>,
    failing_tests: bool,
    build_calls: Cell<u32>,
    test_calls: Cell<u32>,
}

impl FakeVerifier {
    fn scripted(builds: &[bool]) -> Self {
        Self {
            builds: RefCell::new(builds.iter().copied().collect()),
            ..Default::default()
        }
    }
}

impl Verifier for FakeVerifier {
    fn build(&self, _timeout: Duration) -> BuildResult {
        self.build_calls.set(self.build_calls.get() + 1);
        let success = self.builds.borrow_mut().pop_front().unwrap_or(true);
        BuildResult {
            success,
            errors: if success {
                Vec::new()
            } else {
                vec!["cmd/api/main.go:9:1: syntax error: non-declaration statement".to_string()]
            },
            ..Default::default()
        }
    }

    fn test(&self, _timeout: Duration) -> TestResult {
        self.test_calls.set(self.test_calls.get() + 1);
        TestResult {
            success: !self.failing_tests,
            total: 3,
            passed: if self.failing_tests { 2 } else { 3 },
            failed: if self.failing_tests { 1 } else { 0 },
            ..Default::default()
        }
    }

    fn tidy(&self, _timeout: Duration) -> Option<bool> {
        None
    }
}

#[derive(Default)]
struct FakeBackup {
    fail_restore: bool,
    snapshots: RefCell<Vec<String>>,
    restores: Cell<u32>,
    commits: RefCell<Vec<String>>,
}

impl Backup for FakeBackup {
    fn snapshot(&self, label: &str) -> anyhow::Result<Snapshot> {
        self.snapshots.borrow_mut().push(label.to_string());
        Ok(Snapshot {
            commit: format!("{:040}", self.snapshots.borrow().len()),
            branch: format!("restage/test/{}", label),
        })
    }

    fn restore(&self, snapshot: &Snapshot) -> MigrationResult<()> {
        self.restores.set(self.restores.get() + 1);
        if self.fail_restore {
            return Err(MigrationError::Rollback {
                snapshot: snapshot.id(),
                message: "reset failed".to_string(),
            });
        }
        Ok(())
    }

    fn commit(&self, message: &str) -> anyhow::Result<Option<String>> {
        self.commits.borrow_mut().push(message.to_string());
        Ok(Some("c0ffee".to_string()))
    }
}

const LAYERED: &[(&str, &str)] = &[
    ("handler", "internal/billing/handler/http.go"),
    ("service", "internal/billing/service/billing_service.go"),
    ("repo", "internal/billing/repository/invoice_repo.go"),
    ("entity", "internal/billing/domain/invoice.go"),
    ("module", "go.mod"),
];

fn create(id: &str, path: &str) -> Patch {
    Patch {
        id: id.to_string(),
        target_file: path.to_string(),
        changes: vec![Change {
            kind: ChangeKind::Create,
            source_path: None,
            target_path: path.to_string(),
            content: Some(format!("// {}\n", id)),
            description: format!("create {}", path),
        }],
        dependencies: Vec::new(),
        test_requirements: Vec::new(),
    }
}

fn manifest(entries: &[(&str, &str)]) -> PatchManifest {
    PatchManifest {
        patches: entries.iter().map(|(id, path)| create(id, path)).collect(),
        ..Default::default()
    }
}

fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.execution.retry_backoff_ms = 0;
    config.execution.max_stage_attempts = 2;
    config
}

fn options(f: impl FnOnce(&mut RunOptions)) -> RunOptions {
    let mut opts = RunOptions::default();
    f(&mut opts);
    opts
}

fn run(
    root: &Path,
    opts: RunOptions,
    verifier: &dyn Verifier,
    backup: &dyn Backup,
    entries: &[(&str, &str)],
) -> MigrationResult<RunSummary> {
    let ctx = ExecutionContext::new(root, opts);
    let config = test_config();
    let store = CheckpointStore::new(root);
    Pipeline::new(&ctx, &config, &store, verifier, backup).run(manifest(entries))
}

fn init_repo(root: &Path) {
    let repo = git2::Repository::init(root).unwrap();
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "Test").unwrap();
    config.set_str("user.email", "test@example.com").unwrap();
    fs::write(root.join("README.md"), "billing\n").unwrap();
    git_ops::stage_all(root).unwrap();
    git_ops::commit(root, "initial").unwrap();
}

#[test]
fn test_all_stages_pass() {
    let dir = tempfile::tempdir().unwrap();
    let verifier = FakeVerifier::default();
    let backup = FakeBackup::default();

    let summary = run(dir.path(), RunOptions::default(), &verifier, &backup, LAYERED).unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.stages.planned, 5);
    assert_eq!(summary.stages.continued, 5);
    assert_eq!(summary.applied_patches, 5);
    assert_eq!(summary.final_build_success, Some(true));
    assert_eq!(summary.final_test_success, Some(true));
    assert_eq!(verifier.build_calls.get(), 6);
    assert_eq!(backup.snapshots.borrow()[0], "start");
    assert_eq!(backup.snapshots.borrow().len(), 6);
    assert!(backup.commits.borrow().is_empty());

    let names: Vec<&str> = summary.stage_results.iter().map(|r| r.stage.name.as_str()).collect();
    assert_eq!(names, vec!["scaffolding", "domain", "persistence", "services", "handlers"]);

    let store = CheckpointStore::new(dir.path());
    assert!(store.report_path().exists());
    let checkpoint = store.load().unwrap();
    assert_eq!(checkpoint.current_step, PipelineStep::Complete);
    assert_eq!(checkpoint.progress.processed_files.len(), 5);
    assert!(checkpoint.progress.failed_files.is_empty());
    assert_eq!(checkpoint.progress.current_index, 5);
}

#[test]
fn test_critical_failure_halts_before_later_stages() {
    let dir = tempfile::tempdir().unwrap();
    let verifier = FakeVerifier::scripted(&[false]);
    let backup = FakeBackup::default();

    let summary = run(dir.path(), RunOptions::default(), &verifier, &backup, LAYERED).unwrap();
    assert_eq!(summary.outcome, RunOutcome::Aborted);
    assert_eq!(summary.stage_results.len(), 1);
    assert_eq!(summary.stages.aborted, 1);
    assert_eq!(summary.final_build_success, None);
    assert_eq!(verifier.build_calls.get(), 1);
    assert!(!dir.path().join("internal/billing/domain/invoice.go").exists());

    let checkpoint = CheckpointStore::new(dir.path()).load().unwrap();
    assert_eq!(checkpoint.progress.failed_files, vec!["go.mod"]);
}

#[test]
fn test_exhausted_retry_blocks_dependent_stages() {
    let dir = tempfile::tempdir().unwrap();
    let verifier = FakeVerifier::scripted(&[true, false, false]);
    let backup = FakeBackup::default();

    let summary = run(dir.path(), RunOptions::default(), &verifier, &backup, LAYERED).unwrap();
    assert_eq!(summary.outcome, RunOutcome::CompletedWithSkips);
    assert_eq!(summary.stage_results.len(), 6);

    let domain: Vec<&StageResult> = summary
        .stage_results
        .iter()
        .filter(|r| r.stage.name == "domain")
        .collect();
    assert_eq!(domain.len(), 2);
    assert_eq!(domain[0].decision, Decision::Retry);
    assert_eq!(domain[1].decision, Decision::Skip);
    assert_eq!(domain[1].attempt, 2);

    assert_eq!(summary.stages.attempts, 3);
    assert_eq!(summary.stages.retried, 1);
    assert_eq!(summary.stages.skipped, 1);
    assert_eq!(summary.stages.blocked, 3);
    assert_eq!(summary.stages.continued, 1);
    assert!(summary.stage_results[2].blocked_by.contains(&2));
    assert!(!dir.path().join("internal/billing/service/billing_service.go").exists());
}

#[test]
fn test_resume_skips_processed_files() {
    let dir = tempfile::tempdir().unwrap();
    let first = FakeVerifier::scripted(&[true, false, false]);
    run(dir.path(), RunOptions::default(), &first, &FakeBackup::default(), LAYERED).unwrap();

    fs::write(dir.path().join("go.mod"), "module edited\n").unwrap();

    let second = FakeVerifier::default();
    let summary = run(
        dir.path(),
        options(|o| o.resume = true),
        &second,
        &FakeBackup::default(),
        LAYERED,
    )
    .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(
        fs::read_to_string(dir.path().join("go.mod")).unwrap(),
        "module edited\n"
    );
    // four stages re-run plus the final verification
    assert_eq!(second.build_calls.get(), 5);
    assert_eq!(summary.stage_results.len(), 10);
    assert_eq!(summary.stages.continued, 5);

    let checkpoint = CheckpointStore::new(dir.path()).load().unwrap();
    assert_eq!(checkpoint.progress.processed_files.len(), 5);
    assert!(checkpoint.progress.failed_files.is_empty());
}

#[test]
fn test_retry_failed_skips_processed_files_only() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    let mut checkpoint = Checkpoint::new(dir.path().to_path_buf(), 5, serde_json::Value::Null);
    checkpoint.mark_processed("go.mod");
    checkpoint.mark_processed("internal/billing/domain/invoice.go");
    checkpoint.mark_failed("internal/billing/repository/invoice_repo.go");
    store.save(&checkpoint).unwrap();

    let verifier = FakeVerifier::default();
    let summary = run(
        dir.path(),
        options(|o| o.retry_failed = true),
        &verifier,
        &FakeBackup::default(),
        LAYERED,
    )
    .unwrap();

    let ran: Vec<&str> = summary.stage_results.iter().map(|r| r.stage.name.as_str()).collect();
    assert_eq!(ran, vec!["persistence", "services", "handlers"]);
    assert!(dir.path().join("internal/billing/repository/invoice_repo.go").exists());
    assert!(dir.path().join("internal/billing/handler/http.go").exists());
    assert!(!dir.path().join("go.mod").exists());
    assert!(!dir.path().join("internal/billing/domain/invoice.go").exists());
}

#[test]
fn test_retry_failed_after_abort_runs_unreached_stages() {
    let dir = tempfile::tempdir().unwrap();
    let first = FakeVerifier::scripted(&[false]);
    let aborted = run(dir.path(), RunOptions::default(), &first, &FakeBackup::default(), LAYERED).unwrap();
    assert_eq!(aborted.outcome, RunOutcome::Aborted);

    let second = FakeVerifier::default();
    let summary = run(
        dir.path(),
        options(|o| o.retry_failed = true),
        &second,
        &FakeBackup::default(),
        LAYERED,
    )
    .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.stages.continued, 5);
    assert_eq!(summary.applied_patches, 5);
    assert_eq!(second.build_calls.get(), 6);
    for (_, path) in LAYERED {
        assert!(dir.path().join(path).exists(), "{path} was not applied");
    }

    let checkpoint = CheckpointStore::new(dir.path()).load().unwrap();
    assert_eq!(checkpoint.progress.processed_files.len(), 5);
    assert!(checkpoint.progress.failed_files.is_empty());
}

#[test]
fn test_dry_run_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(|o| {
        o.dry_run = true;
        o.auto_apply = true;
    });
    let verifier = CommandVerifier::new(dir.path(), VerifyCommands::default(), true);
    let backup = BackupManager::new(dir.path(), "dryrun01", true, Duration::from_secs(5));

    let summary = run(dir.path(), opts, &verifier, &backup, LAYERED).unwrap();
    assert_eq!(summary.mode, "dry-run");
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.snapshot.as_deref(), Some("dry-run"));
    assert_eq!(summary.stage_results.len(), 5);
    for result in &summary.stage_results {
        assert_eq!(result.decision, Decision::Continue);
        assert_eq!(result.applied_patches.len(), result.stage.patches.len());
        assert!(result.build_result.success);
    }
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_auto_apply_rolls_back_once_on_final_failure() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    // stage build passes, final build fails, post-rollback build passes
    let verifier = FakeVerifier::scripted(&[true, false, true]);
    let backup = FakeBackup::default();
    let entries = &[("entity", "internal/billing/domain/invoice.go")];

    let summary = run(dir.path(), options(|o| o.auto_apply = true), &verifier, &backup, entries).unwrap();
    assert_eq!(summary.outcome, RunOutcome::RolledBack);
    assert!(summary.rolled_back);
    assert_eq!(backup.restores.get(), 1);
    assert_eq!(backup.commits.borrow().len(), 1);
    assert_eq!(summary.final_build_success, Some(false));
    assert!(summary.post_rollback_build.as_ref().unwrap().success);
    assert!(summary.snapshot.as_deref().unwrap().starts_with("restage/test/start@"));
}

#[test]
fn test_rollback_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let verifier = FakeVerifier::scripted(&[true, false]);
    let backup = FakeBackup {
        fail_restore: true,
        ..Default::default()
    };
    let entries = &[("entity", "internal/billing/domain/invoice.go")];

    let err = run(dir.path(), options(|o| o.auto_apply = true), &verifier, &backup, entries).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.exit_code(), 2);
    assert_eq!(backup.restores.get(), 1);

    let checkpoint = CheckpointStore::new(dir.path()).load().unwrap();
    assert_eq!(checkpoint.current_step, PipelineStep::Complete);
}

#[test]
fn test_auto_apply_refuses_dirty_tree() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    fs::write(dir.path().join("scratch.txt"), "uncommitted\n").unwrap();
    let verifier = FakeVerifier::default();
    let backup = FakeBackup::default();

    let err = run(dir.path(), options(|o| o.auto_apply = true), &verifier, &backup, LAYERED).unwrap_err();
    assert!(matches!(err, MigrationError::Config(_)));
    assert!(backup.snapshots.borrow().is_empty());
    assert!(!dir.path().join("go.mod").exists());
}

#[test]
fn test_from_report_step_reuses_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    run(
        dir.path(),
        RunOptions::default(),
        &FakeVerifier::default(),
        &FakeBackup::default(),
        LAYERED,
    )
    .unwrap();

    let verifier = FakeVerifier::scripted(&[false, false, false]);
    let summary = run(
        dir.path(),
        options(|o| o.from_step = Some(PipelineStep::Report)),
        &verifier,
        &FakeBackup::default(),
        LAYERED,
    )
    .unwrap();
    assert_eq!(verifier.build_calls.get(), 0);
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.stage_results.len(), 5);
    assert_eq!(summary.final_build_success, Some(true));
}

#[test]
fn test_final_test_failure_without_auto_apply() {
    let dir = tempfile::tempdir().unwrap();
    let verifier = FakeVerifier::default();
    let backup = FakeBackup::default();
    let ctx = ExecutionContext::new(dir.path(), options(|o| o.skip_tests = true));
    let config = test_config();
    let store = CheckpointStore::new(dir.path());
    let pipeline = Pipeline::new(&ctx, &config, &store, &verifier, &backup);

    let summary = pipeline
        .run(manifest(&[("readme", "docs/README.md")]))
        .unwrap();
    assert_eq!(summary.stage_results[0].stage.name, "unclassified-1");
    assert_eq!(verifier.test_calls.get(), 0);
    assert_eq!(summary.final_test_success, None);

    let failing = FakeVerifier {
        failing_tests: true,
        ..Default::default()
    };
    let summary = run(
        dir.path(),
        options(|o| o.clear_checkpoint = true),
        &failing,
        &backup,
        &[("readme", "docs/README.md")],
    )
    .unwrap();
    assert_eq!(summary.outcome, RunOutcome::VerificationFailed);
    assert!(!summary.rolled_back);
    assert_eq!(backup.restores.get(), 0);
}

#[test]
fn test_load_manifest_rejects_bad_input() {
    let dir = tempfile::tempdir().unwrap();
    let missing = load_manifest(&dir.path().join("none.json")).unwrap_err();
    assert!(matches!(missing, MigrationError::Manifest(_)));

    let path: PathBuf = dir.path().join("patches.json");
    fs::write(
        &path,
        r#"{"summary": {"totalPatches": 3}, "patches": [
            {"id": "a", "targetFile": "go.mod"},
            {"id": "a", "targetFile": "cmd/main.go"}
        ]}"#,
    )
    .unwrap();
    let dup = load_manifest(&path).unwrap_err();
    assert!(dup.to_string().contains("duplicate patch id 'a'"));

    fs::write(&path, r#"{"summary": {"totalPatches": 2}, "patches": [{"id": "a", "targetFile": "go.mod"}]}"#)
        .unwrap();
    assert_eq!(load_manifest(&path).unwrap().patches.len(), 1);
}
