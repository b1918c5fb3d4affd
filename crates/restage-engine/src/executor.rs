//! Runs one stage attempt end to end and decides what happens next.
//!
//! snapshot -> apply -> build -> (repair)? -> test? -> decision. Nothing in
//! here returns an error: failures become data in the [`StageResult`].

use crate::apply::PatchApplier;
use crate::backup::Backup;
use crate::fixer::BuildFixer;
use crate::verifier::Verifier;
use restage_core::{
    BuildResult, Decision, FailedPatch, MigrationContext, MigrationError, Priority, Stage,
    StageResult,
};
use std::path::Path;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub build_timeout: Duration,
    pub test_timeout: Duration,
    pub tidy_timeout: Duration,
    pub skip_tests: bool,
    pub backups: bool,
    /// Commit the stage's changes when it continues.
    pub auto_apply: bool,
    pub dry_run: bool,
    pub max_attempts: u32,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            build_timeout: Duration::from_secs(600),
            test_timeout: Duration::from_secs(900),
            tidy_timeout: Duration::from_secs(600),
            skip_tests: false,
            backups: true,
            auto_apply: false,
            dry_run: false,
            max_attempts: 2,
        }
    }
}

pub struct StageExecutor<'a> {
    applier: PatchApplier,
    fixer: BuildFixer,
    verifier: &'a dyn Verifier,
    backup: &'a dyn Backup,
    context: &'a MigrationContext,
    settings: ExecutorSettings,
}

impl<'a> StageExecutor<'a> {
    pub fn new(
        project_root: &Path,
        verifier: &'a dyn Verifier,
        backup: &'a dyn Backup,
        context: &'a MigrationContext,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            applier: PatchApplier::new(project_root, settings.dry_run),
            fixer: BuildFixer::new(project_root, settings.dry_run),
            verifier,
            backup,
            context,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Run one attempt of `stage`. `attempt` is 1-based.
    pub fn execute(&self, stage: &Stage, attempt: u32) -> StageResult {
        let started = Instant::now();
        tracing::info!(
            stage_id = stage.id,
            stage = %stage.name,
            attempt,
            patches = stage.patches.len(),
            priority = stage.priority.as_str(),
            "stage started"
        );

        let result = match self.run_stage(stage, attempt, started) {
            Ok(result) => result,
            Err(err) => {
                let reason = format!("stage error: {:#}", err);
                tracing::error!(stage_id = stage.id, error = %reason, "stage failed");
                StageResult::failed_whole(stage, attempt, &reason, elapsed_ms(started))
            }
        };

        tracing::info!(
            stage_id = stage.id,
            decision = result.decision.as_str(),
            applied = result.applied_patches.len(),
            failed = result.failed_patches.len(),
            elapsed_ms = result.elapsed_ms,
            "stage decided"
        );
        result
    }

    fn run_stage(&self, stage: &Stage, attempt: u32, started: Instant) -> anyhow::Result<StageResult> {
        let mut notes = Vec::new();

        if self.settings.backups {
            let label = format!("stage-{}-{}-attempt-{}", stage.id, stage.name, attempt);
            match self.backup.snapshot(&label) {
                Ok(snapshot) => tracing::debug!(stage_id = stage.id, snapshot = %snapshot.id(), "stage snapshot"),
                Err(err) => {
                    tracing::warn!(stage_id = stage.id, error = %format!("{:#}", err), "snapshot failed; continuing");
                    notes.push(format!("snapshot failed: {:#}", err));
                }
            }
        }

        let mut applied_patches = Vec::new();
        let mut failed_patches = Vec::new();
        for patch in &stage.patches {
            match self.applier.apply(patch) {
                Ok(()) => {
                    tracing::debug!(patch_id = %patch.id, file = %patch.target_file, "patch applied");
                    applied_patches.push(patch.id.clone());
                }
                Err(err) => {
                    let message = match err {
                        MigrationError::PatchApplication { message, .. } => message,
                        other => other.to_string(),
                    };
                    tracing::warn!(patch_id = %patch.id, error = %message, "patch failed");
                    failed_patches.push(FailedPatch {
                        patch_id: patch.id.clone(),
                        target_file: patch.target_file.clone(),
                        error: message,
                    });
                }
            }
        }

        let mut result = StageResult {
            stage: stage.clone(),
            attempt,
            applied_patches,
            failed_patches,
            build_result: BuildResult::not_run("build not run"),
            test_result: None,
            fix_result: None,
            decision: Decision::Continue,
            elapsed_ms: 0,
            blocked_by: Vec::new(),
            notes,
        };

        if stage.priority == Priority::Critical && !result.failed_patches.is_empty() {
            let reason = format!(
                "{} patch(es) failed in a critical stage; build skipped",
                result.failed_patches.len()
            );
            result.build_result = BuildResult::not_run(&reason);
            result.notes.push(reason);
            result.decision = Decision::Abort;
            result.elapsed_ms = elapsed_ms(started);
            return Ok(result);
        }

        let build = self.verifier.build(self.settings.build_timeout);
        result.build_result = if build.success {
            build
        } else {
            tracing::warn!(stage_id = stage.id, errors = build.errors.len(), "build failed; attempting repair");
            let mut fix = self.fixer.repair(
                &build,
                self.context,
                self.verifier,
                self.settings.build_timeout,
                self.settings.tidy_timeout,
            );
            let latest = fix.rebuild.clone().unwrap_or_else(|| build.clone());
            fix.initial_build = Some(build);
            result.fix_result = Some(fix);
            latest
        };
        let build_passed = result.build_result.success;

        if build_passed && !self.settings.skip_tests {
            let tests = self.verifier.test(self.settings.test_timeout);
            if !tests.success {
                tracing::warn!(stage_id = stage.id, failed = tests.failed, total = tests.total, "tests failed");
            }
            result.test_result = Some(tests);
        }

        let tests_passed = result.test_result.as_ref().map(|t| t.success);
        let mut decision =
            Decision::from_outcome(stage.priority, stage.rollback_strategy, build_passed, tests_passed);
        if decision == Decision::Continue && !result.failed_patches.is_empty() {
            result.notes.push(format!(
                "{} patch(es) failed but the build passed",
                result.failed_patches.len()
            ));
        }
        if decision == Decision::Retry && attempt >= self.settings.max_attempts {
            result.notes.push(format!(
                "retry budget of {} attempt(s) exhausted; stage skipped",
                self.settings.max_attempts
            ));
            decision = Decision::Skip;
        }

        if decision == Decision::Continue && self.settings.auto_apply && !self.settings.dry_run {
            let message = format!("restage: stage {} ({})", stage.id, stage.name);
            if let Some(commit) = self.backup.commit(&message)? {
                result.notes.push(format!("committed {}", commit));
            }
        }

        result.decision = decision;
        result.elapsed_ms = elapsed_ms(started);
        Ok(result)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::Snapshot;
    use restage_core::{
        Change, ChangeKind, MigrationResult, Patch, RollbackStrategy, StageId, TestResult,
    };
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::fs;

    /// Verifier that replays scripted build results.
    #[derive(Default)]
    struct ScriptedVerifier {
        builds: RefCell<VecDeque<bool>>,
        tests_pass: bool,
        failure: Option<&'static str>,
        build_calls: Cell<u32>,
        test_calls: Cell<u32>,
    }

    impl ScriptedVerifier {
        fn new(builds: &[bool], tests_pass: bool) -> Self {
            Self {
                builds: RefCell::new(builds.iter().copied().collect()),
                tests_pass,
                ..Default::default()
            }
        }
    }

    impl Verifier for ScriptedVerifier {
        fn build(&self, _timeout: Duration) -> BuildResult {
            self.build_calls.set(self.build_calls.get() + 1);
            let success = self.builds.borrow_mut().pop_front().unwrap_or(true);
            BuildResult {
                success,
                errors: if success {
                    Vec::new()
                } else {
                    vec![self
                        .failure
                        .unwrap_or("main.go:3:2: syntax error: unexpected }")
                        .to_string()]
                },
                ..Default::default()
            }
        }

        fn test(&self, _timeout: Duration) -> TestResult {
            self.test_calls.set(self.test_calls.get() + 1);
            TestResult {
                success: self.tests_pass,
                total: 2,
                passed: if self.tests_pass { 2 } else { 1 },
                failed: if self.tests_pass { 0 } else { 1 },
                ..Default::default()
            }
        }

        fn tidy(&self, _timeout: Duration) -> Option<bool> {
            None
        }
    }

    #[derive(Default)]
    struct RecordingBackup {
        fail_snapshots: bool,
        snapshots: RefCell<Vec<String>>,
        commits: RefCell<Vec<String>>,
    }

    impl Backup for RecordingBackup {
        fn snapshot(&self, label: &str) -> anyhow::Result<Snapshot> {
            if self.fail_snapshots {
                anyhow::bail!("not a git repository");
            }
            self.snapshots.borrow_mut().push(label.to_string());
            Ok(Snapshot {
                commit: "abc".to_string(),
                branch: label.to_string(),
            })
        }

        fn restore(&self, _snapshot: &Snapshot) -> MigrationResult<()> {
            Ok(())
        }

        fn commit(&self, message: &str) -> anyhow::Result<Option<String>> {
            self.commits.borrow_mut().push(message.to_string());
            Ok(Some("c0ffee".to_string()))
        }
    }

    fn create(id: &str, path: &str) -> Patch {
        Patch {
            id: id.to_string(),
            target_file: path.to_string(),
            changes: vec![Change {
                kind: ChangeKind::Create,
                source_path: None,
                target_path: path.to_string(),
                content: Some("package x\n".to_string()),
                description: String::new(),
            }],
            dependencies: Vec::new(),
            test_requirements: Vec::new(),
        }
    }

    fn broken(id: &str, path: &str) -> Patch {
        Patch {
            id: id.to_string(),
            target_file: path.to_string(),
            changes: vec![Change {
                kind: ChangeKind::Modify,
                source_path: None,
                target_path: path.to_string(),
                content: None,
                description: String::new(),
            }],
            dependencies: Vec::new(),
            test_requirements: Vec::new(),
        }
    }

    fn stage(id: StageId, priority: Priority, strategy: RollbackStrategy, patches: Vec<Patch>) -> Stage {
        Stage {
            id,
            name: "domain".to_string(),
            patches,
            depends_on_stage_ids: Vec::new(),
            priority,
            rollback_strategy: strategy,
        }
    }

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            max_attempts: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_passing_stage_continues_and_runs_tests() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = ScriptedVerifier::new(&[true], true);
        let backup = RecordingBackup::default();
        let ctx = MigrationContext::default();
        let executor = StageExecutor::new(dir.path(), &verifier, &backup, &ctx, settings());

        let s = stage(1, Priority::High, RollbackStrategy::Retry, vec![create("p1", "domain/a.go")]);
        let result = executor.execute(&s, 1);
        assert_eq!(result.decision, Decision::Continue);
        assert_eq!(result.applied_patches, vec!["p1"]);
        assert!(result.build_result.success);
        assert_eq!(verifier.test_calls.get(), 1);
        assert_eq!(backup.snapshots.borrow().len(), 1);
        assert!(backup.commits.borrow().is_empty());
        assert!(dir.path().join("domain/a.go").exists());
    }

    #[test]
    fn test_critical_patch_failure_aborts_without_building() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = ScriptedVerifier::new(&[], true);
        let backup = RecordingBackup::default();
        let ctx = MigrationContext::default();
        let executor = StageExecutor::new(dir.path(), &verifier, &backup, &ctx, settings());

        let s = stage(
            1,
            Priority::Critical,
            RollbackStrategy::Abort,
            vec![create("ok", "go.mod"), broken("bad", "cmd/main.go")],
        );
        let result = executor.execute(&s, 1);
        assert_eq!(result.decision, Decision::Abort);
        assert_eq!(result.failed_patches.len(), 1);
        assert_eq!(result.failed_patches[0].patch_id, "bad");
        assert_eq!(verifier.build_calls.get(), 0);
    }

    #[test]
    fn test_critical_build_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = ScriptedVerifier::new(&[false], true);
        let backup = RecordingBackup::default();
        let ctx = MigrationContext::default();
        let executor = StageExecutor::new(dir.path(), &verifier, &backup, &ctx, settings());

        let s = stage(1, Priority::Critical, RollbackStrategy::Abort, vec![create("p", "go.mod")]);
        let result = executor.execute(&s, 1);
        assert_eq!(result.decision, Decision::Abort);
        // syntax error has no fix, so no rebuild and no tests
        assert_eq!(verifier.build_calls.get(), 1);
        assert_eq!(verifier.test_calls.get(), 0);
        assert!(result.fix_result.as_ref().unwrap().rebuild.is_none());
    }

    #[test]
    fn test_repaired_build_is_the_recorded_build() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("domain")).unwrap();
        fs::write(
            dir.path().join("domain/b.go"),
            "package domain\n\nimport \"old/billing\"\n",
        )
        .unwrap();
        let verifier = ScriptedVerifier {
            failure: Some("domain/b.go:3:8: cannot find package \"old/billing\""),
            ..ScriptedVerifier::new(&[false, true], true)
        };
        let backup = RecordingBackup::default();
        let mut ctx = MigrationContext::default();
        ctx.path_renames
            .insert("old/billing".to_string(), "acme/billing/domain".to_string());
        let executor = StageExecutor::new(dir.path(), &verifier, &backup, &ctx, settings());

        let s = stage(2, Priority::High, RollbackStrategy::Retry, vec![create("p", "domain/a.go")]);
        let result = executor.execute(&s, 1);
        assert_eq!(result.decision, Decision::Continue);
        assert!(result.build_result.success);
        let fix = result.fix_result.as_ref().unwrap();
        assert_eq!(fix.applied.len(), 1);
        assert!(fix.rebuild_succeeded());
        assert!(!fix.initial_build.as_ref().unwrap().success);
        assert_eq!(verifier.build_calls.get(), 2);
        assert!(fs::read_to_string(dir.path().join("domain/b.go"))
            .unwrap()
            .contains("\"acme/billing/domain\""));
    }

    #[test]
    fn test_high_failure_retries_then_skips_on_last_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = ScriptedVerifier::new(&[false, false], true);
        let backup = RecordingBackup::default();
        let ctx = MigrationContext::default();
        let executor = StageExecutor::new(dir.path(), &verifier, &backup, &ctx, settings());

        let s = stage(2, Priority::High, RollbackStrategy::Retry, vec![create("p", "domain/a.go")]);
        let first = executor.execute(&s, 1);
        assert_eq!(first.decision, Decision::Retry);
        let second = executor.execute(&s, 2);
        assert_eq!(second.decision, Decision::Skip);
        assert!(second.notes.iter().any(|n| n.contains("retry budget")));
    }

    #[test]
    fn test_test_failure_counts_as_build_failure() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = ScriptedVerifier::new(&[true], false);
        let backup = RecordingBackup::default();
        let ctx = MigrationContext::default();
        let executor = StageExecutor::new(dir.path(), &verifier, &backup, &ctx, settings());

        let s = stage(4, Priority::Medium, RollbackStrategy::Skip, vec![create("p", "services/a.go")]);
        let result = executor.execute(&s, 1);
        assert_eq!(result.decision, Decision::Skip);
        assert!(result.build_result.success);
        assert!(!result.test_result.unwrap().success);
    }

    #[test]
    fn test_skip_tests_and_snapshot_failure_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = ScriptedVerifier::new(&[true], false);
        let backup = RecordingBackup {
            fail_snapshots: true,
            ..Default::default()
        };
        let ctx = MigrationContext::default();
        let executor = StageExecutor::new(
            dir.path(),
            &verifier,
            &backup,
            &ctx,
            ExecutorSettings {
                skip_tests: true,
                ..settings()
            },
        );

        let s = stage(1, Priority::Critical, RollbackStrategy::Abort, vec![create("p", "go.mod")]);
        let result = executor.execute(&s, 1);
        assert_eq!(result.decision, Decision::Continue);
        assert!(result.test_result.is_none());
        assert!(result.notes[0].starts_with("snapshot failed"));
    }

    #[test]
    fn test_auto_apply_commits_on_continue_only() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = ScriptedVerifier::new(&[true, false], true);
        let backup = RecordingBackup::default();
        let ctx = MigrationContext::default();
        let executor = StageExecutor::new(
            dir.path(),
            &verifier,
            &backup,
            &ctx,
            ExecutorSettings {
                auto_apply: true,
                ..settings()
            },
        );

        let ok = stage(1, Priority::High, RollbackStrategy::Skip, vec![create("a", "domain/a.go")]);
        assert_eq!(executor.execute(&ok, 1).decision, Decision::Continue);
        let bad = stage(2, Priority::High, RollbackStrategy::Skip, vec![create("b", "domain/b.go")]);
        assert_eq!(executor.execute(&bad, 1).decision, Decision::Skip);
        assert_eq!(*backup.commits.borrow(), vec!["restage: stage 1 (domain)"]);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = ScriptedVerifier::new(&[true], true);
        let backup = RecordingBackup::default();
        let ctx = MigrationContext::default();
        let executor = StageExecutor::new(
            dir.path(),
            &verifier,
            &backup,
            &ctx,
            ExecutorSettings {
                dry_run: true,
                auto_apply: true,
                ..settings()
            },
        );

        let s = stage(1, Priority::High, RollbackStrategy::Retry, vec![create("p", "domain/a.go")]);
        let result = executor.execute(&s, 1);
        assert_eq!(result.decision, Decision::Continue);
        assert_eq!(result.applied_patches, vec!["p"]);
        assert!(!dir.path().join("domain").exists());
        assert!(backup.commits.borrow().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
