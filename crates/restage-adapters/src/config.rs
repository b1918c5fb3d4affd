//! Pipeline configuration
//!
//! Read from `<project>/.restage/config.toml`. Every field has a default, so
//! a missing file is the same as an empty one.

use crate::store::STATE_DIR;
use restage_core::{MigrationContext, MigrationError, MigrationResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
pub const BUILD_CMD_ENV: &str = "RESTAGE_BUILD_CMD";
pub const TEST_CMD_ENV: &str = "RESTAGE_TEST_CMD";
pub const TIDY_CMD_ENV: &str = "RESTAGE_TIDY_CMD";

/// Shell command lines; `None` means detect from project files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub build: Option<String>,
    pub test: Option<String>,
    pub tidy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub build_secs: u64,
    pub test_secs: u64,
    pub vcs_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            build_secs: 600,
            test_secs: 900,
            vcs_secs: 60,
        }
    }
}

impl TimeoutsConfig {
    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_secs)
    }

    pub fn test(&self) -> Duration {
        Duration::from_secs(self.test_secs)
    }

    pub fn vcs(&self) -> Duration {
        Duration::from_secs(self.vcs_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Largest trailing batch for patches that match no layer.
    pub max_batch_size: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self { max_batch_size: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Save the checkpoint once this many files were processed since the last save.
    pub checkpoint_interval: usize,
    /// Upper bound on attempts for a stage whose decision is `retry`.
    pub max_stage_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Take a VCS snapshot before each stage.
    pub backups: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 10,
            max_stage_attempts: 2,
            retry_backoff_ms: 2_000,
            backups: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub commands: CommandsConfig,
    pub timeouts: TimeoutsConfig,
    pub planner: PlannerConfig,
    pub execution: ExecutionConfig,
    pub context: MigrationContext,
}

impl PipelineConfig {
    fn sanitize(&mut self) {
        self.planner.max_batch_size = self.planner.max_batch_size.max(1);
        self.execution.checkpoint_interval = self.execution.checkpoint_interval.max(1);
        self.execution.max_stage_attempts = self.execution.max_stage_attempts.max(1);
        for cmd in [
            &mut self.commands.build,
            &mut self.commands.test,
            &mut self.commands.tidy,
        ] {
            if cmd.as_deref().map(|c| c.trim().is_empty()).unwrap_or(false) {
                *cmd = None;
            }
        }
    }

    pub fn default_path(project_root: &Path) -> PathBuf {
        project_root.join(STATE_DIR).join(CONFIG_FILE)
    }

    pub fn from_toml_str(content: &str) -> MigrationResult<Self> {
        let mut config: PipelineConfig =
            toml::from_str(content).map_err(|e| MigrationError::Config(e.to_string()))?;
        config.sanitize();
        Ok(config)
    }

    /// Load the project config, or defaults when absent or unreadable.
    ///
    /// A corrupt file is moved aside so the next run does not trip on it,
    /// unless `read_only` is set (dry runs leave the project untouched).
    pub fn load(project_root: &Path, read_only: bool) -> Self {
        let path = Self::default_path(project_root);
        let mut config = match fs::read_to_string(&path) {
            Ok(content) => match Self::from_toml_str(&content) {
                Ok(config) => config,
                Err(err) if read_only => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "config file is corrupted; using defaults"
                    );
                    Self::default()
                }
                Err(err) => {
                    preserve_corrupt_config(&path, &content);
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "config file was corrupted; a backup was saved and defaults were loaded"
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Load an explicitly named config file. Errors are not swallowed.
    pub fn load_from(path: &Path) -> MigrationResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| MigrationError::Config(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let pick = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(build) = pick(BUILD_CMD_ENV) {
            self.commands.build = Some(build);
        }
        if let Some(test) = pick(TEST_CMD_ENV) {
            self.commands.test = Some(test);
        }
        if let Some(tidy) = pick(TIDY_CMD_ENV) {
            self.commands.tidy = Some(tidy);
        }
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
