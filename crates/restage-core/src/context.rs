use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::checkpoint::PipelineStep;

/// Where a relocated symbol now lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolRelocation {
    /// Import path of the package that now defines the symbol.
    pub package: String,
    /// Name the symbol is referenced through (`qualifier.Symbol`).
    pub qualifier: String,
}

/// A module root that must carry its own manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    pub dir: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestTemplate {
    #[serde(alias = "file_name")]
    pub file_name: String,
    /// `{name}` is replaced by the module name.
    pub template: String,
}

impl Default for ManifestTemplate {
    fn default() -> Self {
        Self {
            file_name: "go.mod".to_string(),
            template: "module {name}\n\ngo 1.21\n".to_string(),
        }
    }
}

impl ManifestTemplate {
    pub fn render(&self, module_name: &str) -> String {
        self.template.replace("{name}", module_name)
    }
}

/// Knowledge about the restructuring that build repairs rely on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationContext {
    /// Old import path -> new import path.
    #[serde(alias = "path_renames")]
    pub path_renames: BTreeMap<String, String>,
    /// Symbol name -> new home.
    pub symbols: BTreeMap<String, SymbolRelocation>,
    pub modules: Vec<ModuleSpec>,
    pub manifest: ManifestTemplate,
}

impl MigrationContext {
    /// Resolve an old import path, preferring exact matches over the longest
    /// matching prefix. Returns the new path and whether the match was exact.
    pub fn rename_for(&self, import_path: &str) -> Option<(String, bool)> {
        if let Some(new_path) = self.path_renames.get(import_path) {
            return Some((new_path.clone(), true));
        }
        self.path_renames
            .iter()
            .filter(|(old, _)| {
                import_path.len() > old.len()
                    && import_path.starts_with(old.as_str())
                    && import_path.as_bytes()[old.len()] == b'/'
            })
            .max_by_key(|(old, _)| old.len())
            .map(|(old, new)| (format!("{}{}", new, &import_path[old.len()..]), false))
    }
}

/// Flags the operator passed for this run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    pub resume: bool,
    pub retry_failed: bool,
    #[serde(default)]
    pub from_step: Option<PipelineStep>,
    pub clear_checkpoint: bool,
    pub dry_run: bool,
    pub auto_apply: bool,
    pub skip_tests: bool,
}

impl RunOptions {
    pub fn mode_label(&self) -> &'static str {
        if self.dry_run {
            "dry-run"
        } else if self.auto_apply {
            "auto-apply"
        } else {
            "apply"
        }
    }
}

/// Run-scoped state threaded through the pipeline.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub project_root: PathBuf,
    pub options: RunOptions,
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(project_root: &Path, options: RunOptions) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            project_root: project_root.to_path_buf(),
            options,
            started_at: Utc::now(),
        }
    }

    /// First 8 hex chars of the run id, used in branch names.
    pub fn short_id(&self) -> String {
        self.run_id.simple().to_string()[..8].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_prefers_exact_then_longest_prefix() {
        let mut ctx = MigrationContext::default();
        ctx.path_renames
            .insert("foo/bar".to_string(), "foo/newbar".to_string());
        ctx.path_renames
            .insert("foo/bar/baz".to_string(), "core/baz".to_string());

        assert_eq!(
            ctx.rename_for("foo/bar"),
            Some(("foo/newbar".to_string(), true))
        );
        assert_eq!(
            ctx.rename_for("foo/bar/baz/qux"),
            Some(("core/baz/qux".to_string(), false))
        );
        assert_eq!(
            ctx.rename_for("foo/bar/other"),
            Some(("foo/newbar/other".to_string(), false))
        );
        assert_eq!(ctx.rename_for("foo/barn"), None);
    }

    #[test]
    fn test_manifest_render() {
        let tpl = ManifestTemplate::default();
        assert_eq!(
            tpl.render("github.com/acme/billing"),
            "module github.com/acme/billing\n\ngo 1.21\n"
        );
    }
}
