use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::build::{BuildErrorKind, BuildResult};
use crate::stage::{Decision, StageId, StageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every stage continued and final verification (if run) passed.
    Completed,
    /// The run finished but some stages were skipped or blocked.
    CompletedWithSkips,
    /// A critical stage aborted the run.
    Aborted,
    /// Final verification failed and no rollback was performed.
    VerificationFailed,
    /// Final verification failed and the working tree was restored.
    RolledBack,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed | RunOutcome::CompletedWithSkips)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTotals {
    pub planned: usize,
    /// Stage attempts that actually ran (retries count separately).
    pub attempts: usize,
    pub continued: usize,
    pub skipped: usize,
    pub retried: usize,
    pub aborted: usize,
    pub blocked: usize,
}

/// Output report written at the end of every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub mode: String,
    pub project_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub stages: StageTotals,
    pub applied_patches: usize,
    pub failed_patches: usize,
    #[serde(default)]
    pub final_build_success: Option<bool>,
    #[serde(default)]
    pub final_test_success: Option<bool>,
    #[serde(default)]
    pub snapshot: Option<String>,
    #[serde(default)]
    pub rolled_back: bool,
    #[serde(default)]
    pub post_rollback_build: Option<BuildResult>,
    #[serde(default)]
    pub stage_results: Vec<StageResult>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl StageTotals {
    pub fn from_results(planned: usize, results: &[StageResult]) -> Self {
        let mut totals = StageTotals {
            planned,
            ..Default::default()
        };
        for (_, result) in final_attempts(results) {
            if result.is_blocked() {
                totals.blocked += 1;
                continue;
            }
            match result.decision {
                Decision::Continue => totals.continued += 1,
                Decision::Skip | Decision::Retry => totals.skipped += 1,
                Decision::Abort => totals.aborted += 1,
            }
        }
        for result in results {
            if result.is_blocked() {
                continue;
            }
            totals.attempts += 1;
            if result.decision == Decision::Retry {
                totals.retried += 1;
            }
        }
        totals
    }
}

/// The last recorded attempt for every stage id, in stage order.
pub fn final_attempts(results: &[StageResult]) -> BTreeMap<StageId, &StageResult> {
    let mut latest = BTreeMap::new();
    for result in results {
        latest.insert(result.stage.id, result);
    }
    latest
}

/// Applied and failed patch counts over the final attempt of every stage.
pub fn patch_totals(results: &[StageResult]) -> (usize, usize) {
    final_attempts(results)
        .values()
        .fold((0, 0), |(applied, failed), r| {
            (
                applied + r.applied_patches.len(),
                failed + r.failed_patches.len(),
            )
        })
}

/// Free-text follow-ups for the operator, derived from the result log.
pub fn recommendations(
    results: &[StageResult],
    outcome: RunOutcome,
    unhandled_kinds: &BTreeSet<BuildErrorKind>,
) -> Vec<String> {
    let mut out = Vec::new();
    let latest = final_attempts(results);

    for result in latest.values() {
        let stage = &result.stage;
        if result.is_blocked() {
            out.push(format!(
                "Stage {} ({}) did not run because stage(s) {:?} did not succeed; fix those first.",
                stage.id, stage.name, result.blocked_by
            ));
            continue;
        }
        match result.decision {
            Decision::Abort => out.push(format!(
                "Critical stage {} ({}) aborted the run; inspect its build errors before resuming with --resume.",
                stage.id, stage.name
            )),
            Decision::Skip | Decision::Retry => out.push(format!(
                "Stage {} ({}) was skipped with {} failed patch(es); re-run with --resume --retry-failed after addressing them.",
                stage.id,
                stage.name,
                result.failed_patches.len().max(
                    stage.patches.len().saturating_sub(result.applied_patches.len())
                )
            )),
            Decision::Continue => {}
        }
    }

    for kind in unhandled_kinds {
        let hint = match kind {
            BuildErrorKind::Import => {
                "Unresolved import errors remain; add the missing entries to [context.path_renames]."
            }
            BuildErrorKind::Type => {
                "Undefined symbols remain; add their new packages to [context.symbols]."
            }
            BuildErrorKind::Dependency => {
                "Dependency errors remain; check module manifests and [context.modules]."
            }
            BuildErrorKind::Syntax => {
                "Syntax errors were reported; these need a corrected patch from the producer."
            }
        };
        out.push(hint.to_string());
    }

    match outcome {
        RunOutcome::RolledBack => out.push(
            "Final verification failed and the working tree was restored to the pre-run snapshot."
                .to_string(),
        ),
        RunOutcome::VerificationFailed => out.push(
            "Final verification failed; re-run with --auto-apply to restore automatically, or inspect the working tree."
                .to_string(),
        ),
        RunOutcome::Completed if out.is_empty() => {
            out.push("All stages applied and verified.".to_string())
        }
        _ => {}
    }

    out
}
