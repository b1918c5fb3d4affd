use crate::build::{BuildResult, FixResult, TestResult};
use crate::patch::Patch;
use serde::{Deserialize, Serialize};

pub type StageId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackStrategy {
    Abort,
    Skip,
    Retry,
}

/// A dependency-ordered batch of patches that is decided as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: StageId,
    pub name: String,
    pub patches: Vec<Patch>,
    #[serde(default)]
    pub depends_on_stage_ids: Vec<StageId>,
    pub priority: Priority,
    pub rollback_strategy: RollbackStrategy,
}

impl Stage {
    pub fn patch_ids(&self) -> Vec<String> {
        self.patches.iter().map(|p| p.id.clone()).collect()
    }
}

/// Per-stage outcome that drives pipeline continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Continue,
    Retry,
    Skip,
    Abort,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Continue => "continue",
            Decision::Retry => "retry",
            Decision::Skip => "skip",
            Decision::Abort => "abort",
        }
    }

    /// Map a stage's verification outcome to a decision.
    ///
    /// A test failure counts the same as a build failure; `tests_passed` is
    /// `None` when tests were not run.
    pub fn from_outcome(
        priority: Priority,
        strategy: RollbackStrategy,
        build_passed: bool,
        tests_passed: Option<bool>,
    ) -> Self {
        let passed = build_passed && tests_passed.unwrap_or(true);
        if passed {
            return Decision::Continue;
        }
        match priority {
            Priority::Critical => Decision::Abort,
            Priority::High if strategy == RollbackStrategy::Retry => Decision::Retry,
            Priority::High => Decision::Skip,
            Priority::Medium | Priority::Low => Decision::Skip,
        }
    }

    /// Decision used when a stage errors out before it could be decided.
    pub fn for_stage_error(priority: Priority) -> Self {
        if priority == Priority::Critical {
            Decision::Abort
        } else {
            Decision::Skip
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedPatch {
    pub patch_id: String,
    pub target_file: String,
    pub error: String,
}

/// Record of one stage attempt. Appended to the result log, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage: Stage,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    #[serde(default)]
    pub applied_patches: Vec<String>,
    #[serde(default)]
    pub failed_patches: Vec<FailedPatch>,
    pub build_result: BuildResult,
    #[serde(default)]
    pub test_result: Option<TestResult>,
    #[serde(default)]
    pub fix_result: Option<FixResult>,
    pub decision: Decision,
    pub elapsed_ms: u64,
    /// Dependency stages that kept this stage from running.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<StageId>,
    #[serde(default)]
    pub notes: Vec<String>,
}

fn default_attempt() -> u32 {
    1
}

impl StageResult {
    /// Result for a stage that failed as a whole: every patch is marked failed.
    pub fn failed_whole(stage: &Stage, attempt: u32, reason: &str, elapsed_ms: u64) -> Self {
        let failed_patches = stage
            .patches
            .iter()
            .map(|p| FailedPatch {
                patch_id: p.id.clone(),
                target_file: p.target_file.clone(),
                error: reason.to_string(),
            })
            .collect();
        Self {
            stage: stage.clone(),
            attempt,
            applied_patches: Vec::new(),
            failed_patches,
            build_result: BuildResult::not_run(reason),
            test_result: None,
            fix_result: None,
            decision: Decision::for_stage_error(stage.priority),
            elapsed_ms,
            blocked_by: Vec::new(),
            notes: vec![reason.to_string()],
        }
    }

    /// Result for a stage that never ran because a dependency did not continue.
    pub fn blocked(stage: &Stage, blocked_by: Vec<StageId>) -> Self {
        let ids = blocked_by
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let reason = format!("blocked: dependency stage(s) {} did not continue", ids);
        let mut result = Self::failed_whole(stage, 0, &reason, 0);
        result.decision = Decision::Skip;
        result.blocked_by = blocked_by;
        result
    }

    pub fn is_blocked(&self) -> bool {
        !self.blocked_by.is_empty()
    }

    /// Target files whose patches were applied in this attempt.
    pub fn applied_files(&self) -> Vec<String> {
        self.stage
            .patches
            .iter()
            .filter(|p| self.applied_patches.contains(&p.id))
            .map(|p| p.target_file.clone())
            .collect()
    }

    pub fn failed_files(&self) -> Vec<String> {
        self.failed_patches
            .iter()
            .map(|f| f.target_file.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_table() {
        use Decision::*;
        use Priority::*;
        use RollbackStrategy as R;

        assert_eq!(Decision::from_outcome(Critical, R::Abort, false, None), Abort);
        assert_eq!(Decision::from_outcome(Critical, R::Abort, true, Some(true)), Continue);
        assert_eq!(Decision::from_outcome(High, R::Retry, false, None), Retry);
        assert_eq!(Decision::from_outcome(High, R::Skip, false, None), Skip);
        assert_eq!(Decision::from_outcome(High, R::Retry, true, None), Continue);
        assert_eq!(Decision::from_outcome(Medium, R::Abort, false, None), Skip);
        assert_eq!(Decision::from_outcome(Low, R::Skip, false, None), Skip);
    }

    #[test]
    fn test_failed_tests_count_as_build_failure() {
        assert_eq!(
            Decision::from_outcome(Priority::Critical, RollbackStrategy::Abort, true, Some(false)),
            Decision::Abort
        );
        assert_eq!(
            Decision::from_outcome(Priority::Medium, RollbackStrategy::Skip, true, Some(false)),
            Decision::Skip
        );
    }

    #[test]
    fn test_failed_whole_marks_every_patch() {
        let stage = Stage {
            id: 2,
            name: "domain".to_string(),
            patches: vec![
                Patch {
                    id: "a".to_string(),
                    target_file: "domain/a.go".to_string(),
                    changes: Vec::new(),
                    dependencies: Vec::new(),
                    test_requirements: Vec::new(),
                },
                Patch {
                    id: "b".to_string(),
                    target_file: "domain/b.go".to_string(),
                    changes: Vec::new(),
                    dependencies: Vec::new(),
                    test_requirements: Vec::new(),
                },
            ],
            depends_on_stage_ids: vec![1],
            priority: Priority::High,
            rollback_strategy: RollbackStrategy::Retry,
        };
        let result = StageResult::failed_whole(&stage, 1, "boom", 5);
        assert_eq!(result.decision, Decision::Skip);
        assert_eq!(result.failed_files(), vec!["domain/a.go", "domain/b.go"]);
        assert!(result.applied_patches.is_empty());
        assert!(!result.build_result.success);
    }

    #[test]
    fn test_blocked_result_never_aborts() {
        let stage = Stage {
            id: 4,
            name: "services".to_string(),
            patches: Vec::new(),
            depends_on_stage_ids: vec![2, 3],
            priority: Priority::Critical,
            rollback_strategy: RollbackStrategy::Abort,
        };
        let result = StageResult::blocked(&stage, vec![3]);
        assert!(result.is_blocked());
        assert_eq!(result.decision, Decision::Skip);
        assert_eq!(result.attempt, 0);
        assert!(result.notes[0].contains("stage(s) 3"));
    }
}
