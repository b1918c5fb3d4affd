//! Blocking external commands with a time budget and structured results.

use crate::util::{keep_tail, run_bounded};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Characters of each stream kept on the outcome.
const OUTPUT_TAIL_MAX_CHARS: usize = 64_000;
/// Bytes buffered per stream while the process runs.
const CAPTURE_LIMIT_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, cwd: impl AsRef<Path>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.as_ref().to_path_buf(),
            timeout: Duration::from_secs(600),
            env: Vec::new(),
        }
    }

    /// A command line interpreted by `sh -c`.
    pub fn shell(name: impl Into<String>, cwd: impl AsRef<Path>, command_line: &str) -> Self {
        Self::new(name, cwd, "sh").args(&["-c", command_line])
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout_secs(self, secs: u64) -> Self {
        self.timeout(Duration::from_secs(secs))
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Human-readable command line for logs and reports.
    pub fn label(&self) -> String {
        if self.program == "sh" && self.args.len() == 2 && self.args[0] == "-c" {
            return self.args[1].clone();
        }
        format!("{} {}", self.program, self.args.join(" "))
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub name: String,
    pub command: String,
    pub cwd: PathBuf,
    pub duration_ms: u64,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout_tail: String,
    pub stderr_tail: String,
    /// Set when the process could not be started or awaited.
    pub note: Option<String>,
}

impl CommandOutcome {
    /// Combined stdout and stderr, stdout first.
    pub fn combined_output(&self) -> String {
        let mut out = String::with_capacity(self.stdout_tail.len() + self.stderr_tail.len() + 1);
        out.push_str(&self.stdout_tail);
        if !self.stdout_tail.is_empty() && !self.stdout_tail.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&self.stderr_tail);
        out
    }
}

pub fn run_command(spec: &CommandSpec) -> CommandOutcome {
    let mut command = Command::new(&spec.program);
    command.current_dir(&spec.cwd).args(&spec.args);
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let label = spec.label();
    tracing::debug!(name = %spec.name, command = %label, cwd = %spec.cwd.display(), "running command");

    let mut outcome = CommandOutcome {
        name: spec.name.clone(),
        command: label,
        cwd: spec.cwd.clone(),
        ..CommandOutcome::default()
    };
    match run_bounded(&mut command, spec.timeout, CAPTURE_LIMIT_BYTES) {
        Ok(captured) => {
            outcome.duration_ms = captured.elapsed.as_millis() as u64;
            outcome.success = captured.exited_cleanly();
            outcome.exit_code = captured.status.and_then(|s| s.code());
            outcome.timed_out = captured.timed_out;
            outcome.stdout_tail = keep_tail(&captured.stdout, OUTPUT_TAIL_MAX_CHARS).to_string();
            outcome.stderr_tail = keep_tail(&captured.stderr, OUTPUT_TAIL_MAX_CHARS).to_string();
        }
        Err(error) => outcome.note = Some(format!("{}: {}", spec.name, error)),
    }

    if outcome.timed_out {
        tracing::warn!(
            name = %outcome.name,
            timeout_ms = spec.timeout.as_millis() as u64,
            "command timed out"
        );
    } else {
        tracing::debug!(
            name = %outcome.name,
            success = outcome.success,
            exit_code = ?outcome.exit_code,
            duration_ms = outcome.duration_ms,
            "command finished"
        );
    }
    outcome
}
