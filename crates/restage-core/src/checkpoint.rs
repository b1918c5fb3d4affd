use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const CHECKPOINT_VERSION: u32 = 1;

/// Coarse pipeline steps, in execution order. `--from-step` names one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStep {
    Plan,
    Execute,
    Verify,
    Report,
    Complete,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::Plan => "plan",
            PipelineStep::Execute => "execute",
            PipelineStep::Verify => "verify",
            PipelineStep::Report => "report",
            PipelineStep::Complete => "complete",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plan" => Ok(PipelineStep::Plan),
            "execute" | "apply" => Ok(PipelineStep::Execute),
            "verify" => Ok(PipelineStep::Verify),
            "report" => Ok(PipelineStep::Report),
            "complete" => Ok(PipelineStep::Complete),
            other => Err(format!(
                "unknown step '{}' (expected plan, execute, verify or report)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total_files: usize,
    #[serde(default)]
    pub processed_files: Vec<String>,
    #[serde(default)]
    pub failed_files: Vec<String>,
    /// Index into the planned patch order of the next item to work on.
    #[serde(default)]
    pub current_index: usize,
}

/// Durable, resumable record of pipeline progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub project_path: PathBuf,
    pub current_step: PipelineStep,
    pub progress: Progress,
    #[serde(default)]
    pub step_results: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub configuration: serde_json::Value,
}

impl Checkpoint {
    pub fn new(project_path: PathBuf, total_files: usize, configuration: serde_json::Value) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            timestamp: Utc::now(),
            project_path,
            current_step: PipelineStep::Plan,
            progress: Progress {
                total_files,
                ..Default::default()
            },
            step_results: BTreeMap::new(),
            configuration,
        }
    }

    pub fn is_processed(&self, file: &str) -> bool {
        self.progress.processed_files.iter().any(|f| f == file)
    }

    pub fn is_failed(&self, file: &str) -> bool {
        self.progress.failed_files.iter().any(|f| f == file)
    }

    /// Record a file as done. Clears any earlier failure for it.
    pub fn mark_processed(&mut self, file: &str) {
        self.progress.failed_files.retain(|f| f != file);
        if !self.is_processed(file) {
            self.progress.processed_files.push(file.to_string());
        }
    }

    /// Record a file as failed. A failed file is never also "processed".
    pub fn mark_failed(&mut self, file: &str) {
        self.progress.processed_files.retain(|f| f != file);
        if !self.is_failed(file) {
            self.progress.failed_files.push(file.to_string());
        }
    }

    pub fn set_step(&mut self, step: PipelineStep) {
        self.current_step = step;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.timestamp = Utc::now();
    }

    pub fn failed_set(&self) -> HashSet<String> {
        self.progress.failed_files.iter().cloned().collect()
    }
}

/// Caller knobs for [`should_process`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeFilter {
    /// When set, only these files are eligible.
    pub allow_list: Option<HashSet<String>>,
    /// Let files the checkpoint has never recorded through the allow-list.
    pub admit_unseen: bool,
}

impl ResumeFilter {
    /// Re-attempt the files that failed in the checkpointed run and pick up
    /// the ones it never reached. Nothing already processed is touched.
    pub fn failed_only(checkpoint: &Checkpoint) -> Self {
        Self {
            allow_list: Some(checkpoint.failed_set()),
            admit_unseen: true,
        }
    }
}

/// Whether `file` needs work on this run.
///
/// Already-processed files are skipped; previously failed files are retried
/// unless an allow-list excludes them.
pub fn should_process(file: &str, checkpoint: &Checkpoint, filter: &ResumeFilter) -> bool {
    if checkpoint.is_processed(file) {
        return false;
    }
    match &filter.allow_list {
        Some(allow) if !allow.contains(file) => filter.admit_unseen && !checkpoint.is_failed(file),
        _ => true,
    }
}
