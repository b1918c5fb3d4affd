use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
}

impl BuildResult {
    /// Placeholder for a build that was never started.
    pub fn not_run(reason: &str) -> Self {
        Self {
            success: false,
            errors: vec![reason.to_string()],
            warnings: Vec::new(),
            duration_ms: 0,
            timed_out: false,
        }
    }

    /// Result reported in dry-run mode, where nothing is executed.
    pub fn simulated() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
            warnings: vec!["dry run: build not executed".to_string()],
            duration_ms: 0,
            timed_out: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub success: bool,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    #[serde(default)]
    pub coverage_percent: Option<f64>,
    pub duration_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
}

impl TestResult {
    pub fn simulated() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildErrorKind {
    Import,
    Type,
    Syntax,
    Dependency,
}

impl BuildErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildErrorKind::Import => "import",
            BuildErrorKind::Type => "type",
            BuildErrorKind::Syntax => "syntax",
            BuildErrorKind::Dependency => "dependency",
        }
    }
}

/// A build failure line classified into something a fixer can act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildError {
    /// Empty when the tool did not name a file.
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub kind: BuildErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixKind {
    Import,
    Dependency,
    Type,
    Config,
}

impl FixKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixKind::Import => "import",
            FixKind::Dependency => "dependency",
            FixKind::Type => "type",
            FixKind::Config => "config",
        }
    }
}

/// A mechanical remediation: the full new body for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fix {
    pub kind: FixKind,
    pub file: String,
    pub description: String,
    pub patch_body: String,
    /// Heuristic certainty in [0, 1].
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedFix {
    pub fix: Fix,
    pub error: String,
}

/// What a repair pass did for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixResult {
    #[serde(default)]
    pub applied: Vec<Fix>,
    #[serde(default)]
    pub failed: Vec<FailedFix>,
    /// Errors no heuristic could address.
    #[serde(default)]
    pub unhandled: Vec<BuildError>,
    #[serde(default)]
    pub tidy_ran: bool,
    #[serde(default)]
    pub rebuild: Option<BuildResult>,
    /// The failing build that triggered the repair.
    #[serde(default)]
    pub initial_build: Option<BuildResult>,
}

impl FixResult {
    pub fn rebuild_succeeded(&self) -> bool {
        self.rebuild.as_ref().map(|b| b.success).unwrap_or(false)
    }
}
