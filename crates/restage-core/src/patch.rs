use serde::{Deserialize, Serialize};

/// What a single change does to the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
    Move,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Modify => "modify",
            ChangeKind::Delete => "delete",
            ChangeKind::Move => "move",
        }
    }
}

/// One file-level edit inside a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub kind: ChangeKind,
    /// Only meaningful for `move`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    pub target_path: String,
    /// Full new content for `create`/`modify` (and optionally `move`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// A generated patch. Immutable once planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub id: String,
    pub target_file: String,
    #[serde(default)]
    pub changes: Vec<Change>,
    /// Ids of patches that must be applied before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub test_requirements: Vec<String>,
}

impl Patch {
    /// Every path this patch writes, removes or moves from.
    pub fn touched_paths(&self) -> Vec<&str> {
        let mut paths = Vec::new();
        for change in &self.changes {
            if let Some(source) = change.source_path.as_deref() {
                paths.push(source);
            }
            paths.push(change.target_path.as_str());
        }
        paths
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSummary {
    #[serde(default)]
    pub total_patches: usize,
    #[serde(default)]
    pub target_modules: Vec<String>,
    /// Free-form estimate from the patch producer (e.g. "2h").
    #[serde(default)]
    pub estimated_time: serde_json::Value,
}

/// The input document handed over by the patch producer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchManifest {
    #[serde(default)]
    pub summary: ManifestSummary,
    #[serde(default)]
    pub patches: Vec<Patch>,
}

impl PatchManifest {
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// True when the producer's declared count disagrees with the patch list.
    pub fn count_mismatch(&self) -> bool {
        self.summary.total_patches != 0 && self.summary.total_patches != self.patches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_parses_camel_case_fields() {
        let raw = r#"{
            "summary": {"totalPatches": 1, "targetModules": ["billing"], "estimatedTime": "15m"},
            "patches": [{
                "id": "p1",
                "targetFile": "internal/billing/domain/invoice.go",
                "changes": [
                    {"kind": "move", "sourcePath": "billing/invoice.go",
                     "targetPath": "internal/billing/domain/invoice.go",
                     "description": "relocate invoice entity"}
                ],
                "dependencies": [],
                "testRequirements": ["internal/billing/domain/invoice_test.go"]
            }]
        }"#;
        let manifest = PatchManifest::from_json(raw).unwrap();
        assert_eq!(manifest.patches.len(), 1);
        assert!(!manifest.count_mismatch());

        let patch = &manifest.patches[0];
        assert_eq!(patch.changes[0].kind, ChangeKind::Move);
        assert_eq!(
            patch.touched_paths(),
            vec!["billing/invoice.go", "internal/billing/domain/invoice.go"]
        );
    }

    #[test]
    fn test_manifest_count_mismatch_detected() {
        let manifest = PatchManifest {
            summary: ManifestSummary {
                total_patches: 3,
                ..Default::default()
            },
            patches: Vec::new(),
        };
        assert!(manifest.count_mismatch());
    }
}
