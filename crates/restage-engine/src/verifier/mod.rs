//! Build and test verification
//!
//! Runs the project's build, test and tidy commands as blocking processes and
//! turns their output into structured results. A timeout is a failure.

pub mod parse;

use restage_adapters::config::CommandsConfig;
use restage_adapters::{run_command, CommandOutcome, CommandSpec};
use restage_core::{BuildResult, TestResult};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// The build/test/tidy seam the executor and fixer depend on.
pub trait Verifier {
    fn build(&self, timeout: Duration) -> BuildResult;
    fn test(&self, timeout: Duration) -> TestResult;
    /// `None` when no tidy command is configured; otherwise whether it passed.
    fn tidy(&self, timeout: Duration) -> Option<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectType {
    Go,
    Rust,
    Node,
    Python,
    Unknown,
}

impl ProjectType {
    pub fn name(&self) -> &'static str {
        match self {
            ProjectType::Go => "Go",
            ProjectType::Rust => "Rust",
            ProjectType::Node => "Node.js",
            ProjectType::Python => "Python",
            ProjectType::Unknown => "Unknown",
        }
    }
}

pub fn detect_project_type(project_root: &Path) -> ProjectType {
    if project_root.join("go.mod").exists() || project_root.join("go.work").exists() {
        ProjectType::Go
    } else if project_root.join("Cargo.toml").exists() {
        ProjectType::Rust
    } else if project_root.join("package.json").exists() {
        ProjectType::Node
    } else if project_root.join("pyproject.toml").exists()
        || project_root.join("setup.py").exists()
        || project_root.join("requirements.txt").exists()
    {
        ProjectType::Python
    } else {
        ProjectType::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyCommand {
    Shell(String),
    Program { program: String, args: Vec<String> },
}

impl VerifyCommand {
    fn program(program: &str, args: &[&str]) -> Self {
        VerifyCommand::Program {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn to_spec(&self, name: &str, cwd: &Path, timeout: Duration) -> CommandSpec {
        match self {
            VerifyCommand::Shell(line) => CommandSpec::shell(name, cwd, line).timeout(timeout),
            VerifyCommand::Program { program, args } => {
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                CommandSpec::new(name, cwd, program.as_str())
                    .args(&args)
                    .timeout(timeout)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyCommands {
    pub build: Option<VerifyCommand>,
    pub test: Option<VerifyCommand>,
    pub tidy: Option<VerifyCommand>,
}

impl VerifyCommands {
    /// Configured shell commands first, detection for whatever is left.
    pub fn resolve(project_root: &Path, configured: &CommandsConfig) -> Self {
        let detected = Self::detect(detect_project_type(project_root));
        let shell = |c: &Option<String>| c.as_ref().map(|line| VerifyCommand::Shell(line.clone()));
        Self {
            build: shell(&configured.build).or(detected.build),
            test: shell(&configured.test).or(detected.test),
            tidy: shell(&configured.tidy).or(detected.tidy),
        }
    }

    pub fn detect(project_type: ProjectType) -> Self {
        match project_type {
            ProjectType::Go => Self {
                build: Some(VerifyCommand::program("go", &["build", "./..."])),
                test: Some(VerifyCommand::program(
                    "go",
                    &["test", "-v", "-coverprofile=coverage.out", "./..."],
                )),
                tidy: Some(VerifyCommand::program("go", &["mod", "tidy"])),
            },
            ProjectType::Rust => Self {
                build: Some(VerifyCommand::program("cargo", &["build"])),
                test: Some(VerifyCommand::program("cargo", &["test"])),
                tidy: None,
            },
            ProjectType::Node => Self {
                build: Some(VerifyCommand::program("npm", &["run", "build", "--if-present"])),
                test: Some(VerifyCommand::program("npm", &["test"])),
                tidy: None,
            },
            ProjectType::Python => Self {
                build: Some(VerifyCommand::program("python3", &["-m", "compileall", "-q", "."])),
                test: Some(VerifyCommand::program("python3", &["-m", "pytest"])),
                tidy: None,
            },
            ProjectType::Unknown => Self::default(),
        }
    }
}

/// Runs real commands in the project directory.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    project_root: PathBuf,
    commands: VerifyCommands,
    dry_run: bool,
}

impl CommandVerifier {
    pub fn new(project_root: &Path, commands: VerifyCommands, dry_run: bool) -> Self {
        if commands.build.is_none() {
            tracing::warn!(
                project = %project_root.display(),
                "no build command configured or detected; builds will pass trivially"
            );
        }
        Self {
            project_root: project_root.to_path_buf(),
            commands,
            dry_run,
        }
    }

    fn run(&self, name: &str, command: &VerifyCommand, timeout: Duration) -> CommandOutcome {
        run_command(&command.to_spec(name, &self.project_root, timeout))
    }
}

fn failure_lines(outcome: &CommandOutcome, timeout: Duration) -> Vec<String> {
    let mut errors = Vec::new();
    if outcome.timed_out {
        errors.push(format!(
            "{} timed out after {}s",
            outcome.command,
            timeout.as_secs()
        ));
    }
    if let Some(note) = &outcome.note {
        errors.push(format!("{}: {}", outcome.command, note));
    }
    errors.extend(parse::extract_error_lines(&outcome.combined_output()));
    errors
}

impl Verifier for CommandVerifier {
    fn build(&self, timeout: Duration) -> BuildResult {
        if self.dry_run {
            return BuildResult::simulated();
        }
        let Some(command) = &self.commands.build else {
            return BuildResult {
                success: true,
                warnings: vec!["no build command configured".to_string()],
                ..Default::default()
            };
        };

        let outcome = self.run("build", command, timeout);
        let result = if outcome.success {
            BuildResult {
                success: true,
                errors: Vec::new(),
                warnings: parse::extract_warnings(&outcome.stderr_tail),
                duration_ms: outcome.duration_ms,
                timed_out: false,
            }
        } else {
            BuildResult {
                success: false,
                errors: failure_lines(&outcome, timeout),
                warnings: parse::extract_warnings(&outcome.stderr_tail),
                duration_ms: outcome.duration_ms,
                timed_out: outcome.timed_out,
            }
        };
        tracing::info!(
            success = result.success,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            duration_ms = result.duration_ms,
            "build finished"
        );
        result
    }

    fn test(&self, timeout: Duration) -> TestResult {
        if self.dry_run {
            return TestResult::simulated();
        }
        let Some(command) = &self.commands.test else {
            tracing::warn!("no test command configured; tests skipped");
            return TestResult {
                success: true,
                ..Default::default()
            };
        };

        let started = SystemTime::now();
        let outcome = self.run("test", command, timeout);
        let output = outcome.combined_output();
        let counts = parse::parse_test_counts(&output).unwrap_or_default();
        let success = outcome.success && counts.failed == 0;
        let coverage_percent = if outcome.timed_out {
            None
        } else {
            parse::find_coverage(&self.project_root, started, &output)
        };

        tracing::info!(
            success,
            total = counts.total,
            failed = counts.failed,
            coverage = ?coverage_percent,
            duration_ms = outcome.duration_ms,
            "tests finished"
        );
        if !success {
            for line in failure_lines(&outcome, timeout).iter().take(10) {
                tracing::debug!(line = %line, "test failure output");
            }
        }

        TestResult {
            success,
            total: counts.total,
            passed: counts.passed,
            failed: counts.failed,
            coverage_percent,
            duration_ms: outcome.duration_ms,
            timed_out: outcome.timed_out,
        }
    }

    fn tidy(&self, timeout: Duration) -> Option<bool> {
        let command = self.commands.tidy.as_ref()?;
        if self.dry_run {
            return Some(true);
        }
        let outcome = self.run("tidy", command, timeout);
        if !outcome.success {
            tracing::warn!(
                command = %outcome.command,
                stderr = %restage_adapters::util::clip(outcome.stderr_tail.trim(), 500),
                "tidy failed"
            );
        }
        Some(outcome.success)
    }
}
