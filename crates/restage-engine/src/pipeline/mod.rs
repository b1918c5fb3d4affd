//! The top-level migration driver.
//!
//! Owns the checkpoint for the duration of a run: plans the manifest, feeds
//! stages through the [`StageExecutor`] with dependency gating and retries,
//! verifies the final tree, rolls back when an auto-apply run fails
//! verification, and writes the run report.

use crate::backup::{Backup, Snapshot};
use crate::executor::{ExecutorSettings, StageExecutor};
use crate::planner::PatchPlanner;
use crate::verifier::Verifier;
use restage_adapters::{git_ops, CheckpointStore, PipelineConfig};
use restage_core::{
    final_attempts, patch_totals, recommendations, should_process, BuildErrorKind, BuildResult,
    Checkpoint, Decision, ExecutionContext, MigrationError, MigrationResult, PatchManifest,
    PipelineStep, ResumeFilter, RunOutcome, RunSummary, Stage, StageId, StageResult, StageTotals,
    TestResult,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

const PLAN_KEY: &str = "plan";
const EXECUTE_KEY: &str = "execute";
const VERIFY_KEY: &str = "verify";
const SNAPSHOT_KEY: &str = "snapshot";

/// Read and parse the patch manifest.
pub fn load_manifest(path: &Path) -> MigrationResult<PatchManifest> {
    let content = fs::read_to_string(path)
        .map_err(|e| MigrationError::Manifest(format!("{}: {}", path.display(), e)))?;
    let manifest = PatchManifest::from_json(&content)
        .map_err(|e| MigrationError::Manifest(format!("{}: {}", path.display(), e)))?;
    if manifest.count_mismatch() {
        tracing::warn!(
            declared = manifest.summary.total_patches,
            actual = manifest.patches.len(),
            "manifest summary disagrees with the patch list"
        );
    }
    let mut seen = HashSet::new();
    if let Some(dup) = manifest.patches.iter().find(|p| !seen.insert(p.id.as_str())) {
        return Err(MigrationError::Manifest(format!(
            "duplicate patch id '{}'",
            dup.id
        )));
    }
    Ok(manifest)
}

/// Outcome of the whole-project verification after all stages ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRecord {
    build: Option<BuildResult>,
    tests: Option<TestResult>,
    rolled_back: bool,
    post_rollback_build: Option<BuildResult>,
}

impl VerifyRecord {
    fn passed(&self) -> Option<bool> {
        let build = self.build.as_ref()?;
        Some(build.success && self.tests.as_ref().map(|t| t.success).unwrap_or(true))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlannedStage<'a> {
    id: StageId,
    name: &'a str,
    priority: &'static str,
    depends_on: &'a [StageId],
    patch_ids: Vec<String>,
}

pub struct Pipeline<'a> {
    ctx: &'a ExecutionContext,
    config: &'a PipelineConfig,
    store: &'a CheckpointStore,
    verifier: &'a dyn Verifier,
    backup: &'a dyn Backup,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        ctx: &'a ExecutionContext,
        config: &'a PipelineConfig,
        store: &'a CheckpointStore,
        verifier: &'a dyn Verifier,
        backup: &'a dyn Backup,
    ) -> Self {
        Self {
            ctx,
            config,
            store,
            verifier,
            backup,
        }
    }

    fn dry_run(&self) -> bool {
        self.ctx.options.dry_run
    }

    /// Run the migration. Aborts and verification failures are reported in
    /// the summary; only lock, config, manifest, rollback and terminal
    /// checkpoint failures come back as errors.
    pub fn run(&self, manifest: PatchManifest) -> MigrationResult<RunSummary> {
        let span = tracing::info_span!(
            "run",
            run_id = %self.ctx.run_id,
            mode = self.ctx.options.mode_label()
        );
        let _guard = span.enter();
        self.run_inner(manifest)
    }

    fn run_inner(&self, manifest: PatchManifest) -> MigrationResult<RunSummary> {
        let opts = &self.ctx.options;
        if opts.auto_apply && !opts.dry_run {
            self.ensure_clean_repository()?;
        }

        let total_files = manifest
            .patches
            .iter()
            .map(|p| p.target_file.as_str())
            .collect::<HashSet<_>>()
            .len();
        let (mut checkpoint, resumed) = self.prepare_checkpoint(total_files);
        let start_step = opts.from_step.unwrap_or(PipelineStep::Plan);
        tracing::info!(
            patches = manifest.patches.len(),
            files = total_files,
            resumed,
            start_step = %start_step,
            "migration started"
        );

        let stages = PatchPlanner::new(self.config.planner.max_batch_size).plan(manifest.patches);
        let planned = stages.len();
        if start_step <= PipelineStep::Plan || !checkpoint.step_results.contains_key(PLAN_KEY) {
            checkpoint
                .step_results
                .insert(PLAN_KEY.to_string(), plan_record(&stages));
        }

        let previous: Vec<StageResult> = if resumed || start_step > PipelineStep::Execute {
            step_value(&checkpoint, EXECUTE_KEY).unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut snapshot: Option<Snapshot> = step_value(&checkpoint, SNAPSHOT_KEY);
        let results = if start_step <= PipelineStep::Execute {
            if snapshot.is_none() || !resumed {
                snapshot = self.start_snapshot()?;
                if let Some(snap) = &snapshot {
                    set_step_value(&mut checkpoint, SNAPSHOT_KEY, snap);
                }
            }
            checkpoint.set_step(PipelineStep::Execute);
            self.save(&mut checkpoint);
            self.execute_stages(&stages, &mut checkpoint, previous, resumed)
        } else {
            tracing::info!(stages = previous.len(), "execute step skipped; using checkpointed results");
            previous
        };

        let aborted = final_attempts(&results)
            .values()
            .any(|r| r.decision == Decision::Abort);

        let mut rollback_error = None;
        let verify = if aborted {
            VerifyRecord::default()
        } else if start_step <= PipelineStep::Verify {
            checkpoint.set_step(PipelineStep::Verify);
            self.save(&mut checkpoint);
            let (record, error) = self.final_verification(snapshot.as_ref());
            rollback_error = error;
            set_step_value(&mut checkpoint, VERIFY_KEY, &record);
            record
        } else {
            step_value(&checkpoint, VERIFY_KEY).unwrap_or_default()
        };

        checkpoint.set_step(PipelineStep::Report);
        let summary = self.summarize(planned, results, &verify, snapshot.as_ref());
        if !self.dry_run() {
            match self.store.write_report(&summary) {
                Ok(path) => tracing::info!(path = %path.display(), "run report written"),
                Err(err) => tracing::warn!(error = %format!("{:#}", err), "failed to write run report"),
            }
        }

        checkpoint.set_step(PipelineStep::Complete);
        if !self.dry_run() {
            if let Err(err) = self.store.save_terminal(&checkpoint) {
                tracing::error!(error = %err, "final checkpoint could not be saved");
                return Err(rollback_error.unwrap_or(err));
            }
        }
        if let Some(err) = rollback_error {
            tracing::error!(error = %err, "rollback failed; the working tree needs manual recovery");
            return Err(err);
        }

        tracing::info!(
            outcome = ?summary.outcome,
            continued = summary.stages.continued,
            skipped = summary.stages.skipped,
            blocked = summary.stages.blocked,
            applied = summary.applied_patches,
            failed = summary.failed_patches,
            "migration finished"
        );
        Ok(summary)
    }

    fn ensure_clean_repository(&self) -> MigrationResult<()> {
        let root = &self.ctx.project_root;
        if !git_ops::is_repository(root) {
            return Err(MigrationError::Config(format!(
                "--auto-apply needs a git repository at {}",
                root.display()
            )));
        }
        let dirty = git_ops::is_dirty(root)
            .map_err(|e| MigrationError::Config(format!("failed to read git status: {:#}", e)))?;
        if dirty {
            return Err(MigrationError::Config(
                "working tree has uncommitted changes; commit or stash them before --auto-apply"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Load or create the checkpoint. Returns it with whether it was resumed.
    fn prepare_checkpoint(&self, total_files: usize) -> (Checkpoint, bool) {
        let opts = &self.ctx.options;
        let configuration = serde_json::to_value(self.config).unwrap_or_default();
        let fresh = || Checkpoint::new(self.ctx.project_root.clone(), total_files, configuration.clone());

        if opts.clear_checkpoint {
            if self.dry_run() {
                tracing::info!("dry run: checkpoint would be cleared");
            } else {
                match self.store.clear() {
                    Ok(true) => tracing::info!("checkpoint cleared"),
                    Ok(false) => tracing::debug!("no checkpoint to clear"),
                    Err(err) => tracing::warn!(error = %format!("{:#}", err), "failed to clear checkpoint"),
                }
            }
            return (fresh(), false);
        }

        let wants_checkpoint = opts.resume || opts.retry_failed || opts.from_step.is_some();
        if !wants_checkpoint {
            if self.store.checkpoint_path().exists() {
                tracing::info!("an earlier checkpoint exists and will be replaced; pass --resume to continue it");
            }
            return (fresh(), false);
        }

        match self.store.load() {
            Some(checkpoint) if checkpoint.project_path == self.ctx.project_root => {
                tracing::info!(
                    step = %checkpoint.current_step,
                    processed = checkpoint.progress.processed_files.len(),
                    failed = checkpoint.progress.failed_files.len(),
                    saved_at = %checkpoint.timestamp,
                    "resuming from checkpoint"
                );
                let mut checkpoint = checkpoint;
                checkpoint.progress.total_files = total_files;
                checkpoint.configuration = configuration.clone();
                (checkpoint, true)
            }
            Some(checkpoint) => {
                tracing::warn!(
                    checkpoint_project = %checkpoint.project_path.display(),
                    "checkpoint belongs to another project; starting fresh"
                );
                (fresh(), false)
            }
            None => {
                tracing::warn!("no checkpoint to resume; starting fresh");
                (fresh(), false)
            }
        }
    }

    /// Restore point for the whole run.
    ///
    /// Required in auto-apply mode, where final verification may roll back
    /// to it. Otherwise best effort when backups are enabled.
    fn start_snapshot(&self) -> MigrationResult<Option<Snapshot>> {
        let opts = &self.ctx.options;
        if !opts.auto_apply && !self.config.execution.backups {
            return Ok(None);
        }
        match self.backup.snapshot("start") {
            Ok(snapshot) => {
                tracing::info!(snapshot = %snapshot.id(), "start snapshot created");
                Ok(Some(snapshot))
            }
            Err(err) if opts.auto_apply && !opts.dry_run => Err(MigrationError::Rollback {
                snapshot: "start".to_string(),
                message: format!("could not create the restore point: {:#}", err),
            }),
            Err(err) => {
                tracing::warn!(error = %format!("{:#}", err), "start snapshot failed; continuing without one");
                Ok(None)
            }
        }
    }

    fn executor_settings(&self) -> ExecutorSettings {
        let opts = &self.ctx.options;
        let timeouts = &self.config.timeouts;
        ExecutorSettings {
            build_timeout: timeouts.build(),
            test_timeout: timeouts.test(),
            tidy_timeout: timeouts.build(),
            skip_tests: opts.skip_tests,
            backups: self.config.execution.backups,
            auto_apply: opts.auto_apply,
            dry_run: opts.dry_run,
            max_attempts: self.config.execution.max_stage_attempts.max(1),
        }
    }

    fn execute_stages(
        &self,
        stages: &[Stage],
        checkpoint: &mut Checkpoint,
        mut results: Vec<StageResult>,
        resumed: bool,
    ) -> Vec<StageResult> {
        let opts = &self.ctx.options;
        let filter = if resumed && opts.retry_failed {
            ResumeFilter::failed_only(checkpoint)
        } else {
            ResumeFilter::default()
        };
        let executor = StageExecutor::new(
            &self.ctx.project_root,
            self.verifier,
            self.backup,
            &self.config.context,
            self.executor_settings(),
        );
        let max_attempts = executor.settings().max_attempts;
        let backoff = Duration::from_millis(self.config.execution.retry_backoff_ms);
        let interval = self.config.execution.checkpoint_interval.max(1);

        let mut satisfied: BTreeSet<StageId> = BTreeSet::new();
        let mut since_save = 0usize;
        let mut position = 0usize;

        for stage in stages {
            position += stage.patches.len();
            let work = pending_work(stage, checkpoint, &filter);
            if work.patches.is_empty() {
                tracing::info!(stage_id = stage.id, stage = %stage.name, "nothing left to do in stage");
                satisfied.insert(stage.id);
                checkpoint.progress.current_index = position;
                continue;
            }

            let blockers: Vec<StageId> = stage
                .depends_on_stage_ids
                .iter()
                .filter(|id| !satisfied.contains(id))
                .copied()
                .collect();
            if !blockers.is_empty() {
                tracing::warn!(stage_id = stage.id, blocked_by = ?blockers, "stage blocked by dependencies");
                let result = StageResult::blocked(&work, blockers);
                record_progress(checkpoint, &result);
                results.push(result);
                since_save += work.patches.len();
                checkpoint.progress.current_index = position;
                self.save_every(checkpoint, &results, &mut since_save, interval);
                continue;
            }

            let mut attempt = 1;
            let decision = loop {
                let result = executor.execute(&work, attempt);
                let decision = result.decision;
                if decision != Decision::Retry {
                    record_progress(checkpoint, &result);
                }
                results.push(result);
                if decision == Decision::Retry && attempt < max_attempts {
                    tracing::info!(
                        stage_id = stage.id,
                        next_attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying stage"
                    );
                    if !backoff.is_zero() && !self.dry_run() {
                        thread::sleep(backoff);
                    }
                    attempt += 1;
                    continue;
                }
                break decision;
            };

            since_save += work.patches.len();
            checkpoint.progress.current_index = position;
            match decision {
                Decision::Continue => {
                    satisfied.insert(stage.id);
                }
                Decision::Abort => {
                    let err = MigrationError::StageAborted {
                        stage_id: stage.id,
                        name: stage.name.clone(),
                    };
                    tracing::error!(error = %err, "halting: no later stage will run");
                    set_step_value(checkpoint, EXECUTE_KEY, &results);
                    return results;
                }
                Decision::Skip | Decision::Retry => {}
            }
            self.save_every(checkpoint, &results, &mut since_save, interval);
        }

        set_step_value(checkpoint, EXECUTE_KEY, &results);
        results
    }

    fn save_every(
        &self,
        checkpoint: &mut Checkpoint,
        results: &[StageResult],
        since_save: &mut usize,
        interval: usize,
    ) {
        if *since_save < interval {
            return;
        }
        set_step_value(checkpoint, EXECUTE_KEY, &results);
        self.save(checkpoint);
        *since_save = 0;
    }

    /// Non-terminal save. Failures are logged and the run goes on.
    fn save(&self, checkpoint: &mut Checkpoint) {
        if self.dry_run() {
            return;
        }
        checkpoint.touch();
        if let Err(err) = self.store.save(checkpoint) {
            tracing::warn!(error = %format!("{:#}", err), "checkpoint save failed; continuing");
        }
    }

    /// Build and test the whole tree once. On failure in auto-apply mode,
    /// restore the start snapshot and rebuild to confirm the restored state.
    fn final_verification(
        &self,
        snapshot: Option<&Snapshot>,
    ) -> (VerifyRecord, Option<MigrationError>) {
        let opts = &self.ctx.options;
        let timeouts = &self.config.timeouts;
        let build = self.verifier.build(timeouts.build());
        let tests = (build.success && !opts.skip_tests).then(|| self.verifier.test(timeouts.test()));
        let mut record = VerifyRecord {
            build: Some(build),
            tests,
            ..Default::default()
        };

        if record.passed() == Some(true) {
            tracing::info!("final verification passed");
            return (record, None);
        }
        tracing::warn!("final verification failed");
        if !opts.auto_apply || opts.dry_run {
            return (record, None);
        }

        let Some(snapshot) = snapshot else {
            tracing::warn!("no start snapshot; cannot roll back");
            return (record, None);
        };
        match self.backup.restore(snapshot) {
            Ok(()) => {
                tracing::info!(snapshot = %snapshot.id(), "working tree restored");
                record.rolled_back = true;
                let rebuilt = self.verifier.build(timeouts.build());
                if !rebuilt.success {
                    tracing::warn!("build still fails after rollback");
                }
                record.post_rollback_build = Some(rebuilt);
                (record, None)
            }
            Err(err) => (record, Some(err)),
        }
    }

    fn summarize(
        &self,
        planned: usize,
        results: Vec<StageResult>,
        verify: &VerifyRecord,
        snapshot: Option<&Snapshot>,
    ) -> RunSummary {
        let latest = final_attempts(&results);
        let aborted = latest.values().any(|r| r.decision == Decision::Abort);
        let skipped = latest
            .values()
            .any(|r| r.decision != Decision::Continue || r.is_blocked());

        let outcome = if aborted {
            RunOutcome::Aborted
        } else if verify.passed() == Some(false) {
            if verify.rolled_back {
                RunOutcome::RolledBack
            } else {
                RunOutcome::VerificationFailed
            }
        } else if skipped {
            RunOutcome::CompletedWithSkips
        } else {
            RunOutcome::Completed
        };

        let unhandled: BTreeSet<BuildErrorKind> = latest
            .values()
            .filter_map(|r| r.fix_result.as_ref())
            .flat_map(|f| f.unhandled.iter().map(|e| e.kind))
            .collect();
        let (applied_patches, failed_patches) = patch_totals(&results);

        RunSummary {
            run_id: self.ctx.run_id.to_string(),
            mode: self.ctx.options.mode_label().to_string(),
            project_path: self.ctx.project_root.clone(),
            started_at: self.ctx.started_at,
            finished_at: chrono::Utc::now(),
            outcome,
            stages: StageTotals::from_results(planned, &results),
            applied_patches,
            failed_patches,
            final_build_success: verify.build.as_ref().map(|b| b.success),
            final_test_success: verify.tests.as_ref().map(|t| t.success),
            snapshot: snapshot.map(Snapshot::id),
            rolled_back: verify.rolled_back,
            post_rollback_build: verify.post_rollback_build.clone(),
            recommendations: recommendations(&results, outcome, &unhandled),
            stage_results: results,
        }
    }
}

/// The part of `stage` this run still has to apply.
fn pending_work(stage: &Stage, checkpoint: &Checkpoint, filter: &ResumeFilter) -> Stage {
    let mut work = stage.clone();
    work.patches
        .retain(|p| should_process(&p.target_file, checkpoint, filter));
    work
}

fn record_progress(checkpoint: &mut Checkpoint, result: &StageResult) {
    if result.decision == Decision::Continue {
        for file in result.applied_files() {
            checkpoint.mark_processed(&file);
        }
        for file in result.failed_files() {
            checkpoint.mark_failed(&file);
        }
    } else {
        for patch in &result.stage.patches {
            checkpoint.mark_failed(&patch.target_file);
        }
    }
}

fn plan_record(stages: &[Stage]) -> serde_json::Value {
    let planned: Vec<PlannedStage<'_>> = stages
        .iter()
        .map(|s| PlannedStage {
            id: s.id,
            name: &s.name,
            priority: s.priority.as_str(),
            depends_on: &s.depends_on_stage_ids,
            patch_ids: s.patch_ids(),
        })
        .collect();
    serde_json::to_value(planned).unwrap_or_default()
}

fn step_value<T: serde::de::DeserializeOwned>(checkpoint: &Checkpoint, key: &str) -> Option<T> {
    let value = checkpoint.step_results.get(key)?;
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::warn!(key, error = %err, "ignoring unreadable checkpoint step result");
            None
        }
    }
}

fn set_step_value<T: Serialize + ?Sized>(checkpoint: &mut Checkpoint, key: &str, value: &T) {
    match serde_json::to_value(value) {
        Ok(json) => {
            checkpoint.step_results.insert(key.to_string(), json);
        }
        Err(err) => tracing::warn!(key, error = %err, "failed to record step result"),
    }
}

#[cfg(test)]
mod tests;
