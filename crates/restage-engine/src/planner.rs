//! Patch planning
//!
//! Splits an unordered patch set into dependency-ordered stages using
//! path-pattern layer detection:
//! - Build manifests and shared scaffolding first
//! - Then domain, persistence, services and handlers
//! - Anything unrecognized trails in fixed-size batches

use restage_core::{Patch, Priority, RollbackStrategy, Stage, StageId};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Architectural layer a patch is assigned to, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    Scaffolding,
    Domain,
    Persistence,
    Services,
    Handlers,
}

impl Bucket {
    pub const ALL: [Bucket; 5] = [
        Bucket::Scaffolding,
        Bucket::Domain,
        Bucket::Persistence,
        Bucket::Services,
        Bucket::Handlers,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Bucket::Scaffolding => "scaffolding",
            Bucket::Domain => "domain",
            Bucket::Persistence => "persistence",
            Bucket::Services => "services",
            Bucket::Handlers => "handlers",
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Bucket::Scaffolding => Priority::Critical,
            Bucket::Domain | Bucket::Persistence => Priority::High,
            Bucket::Services | Bucket::Handlers => Priority::Medium,
        }
    }

    pub fn rollback_strategy(&self) -> RollbackStrategy {
        match self {
            Bucket::Scaffolding => RollbackStrategy::Abort,
            Bucket::Domain | Bucket::Persistence => RollbackStrategy::Retry,
            Bucket::Services | Bucket::Handlers => RollbackStrategy::Skip,
        }
    }

    /// Layers that must be in place before this one.
    pub fn depends_on(&self) -> &'static [Bucket] {
        match self {
            Bucket::Scaffolding => &[],
            Bucket::Domain => &[Bucket::Scaffolding],
            Bucket::Persistence => &[Bucket::Domain],
            Bucket::Services => &[Bucket::Domain, Bucket::Persistence],
            Bucket::Handlers => &[Bucket::Services],
        }
    }

    /// (directory segments, substrings of any path segment)
    fn signals(&self) -> (&'static [&'static str], &'static [&'static str]) {
        match self {
            Bucket::Scaffolding => (
                &["cmd", "pkg", "shared", "common", "platform"],
                &["config", "bootstrap"],
            ),
            Bucket::Domain => (
                &["domain", "entities", "models"],
                &["entity", "model", "aggregate"],
            ),
            Bucket::Persistence => (
                &["repositories", "persistence", "db", "migrations"],
                &["repository", "store", "dao"],
            ),
            Bucket::Services => (
                &["services", "application", "app"],
                &["service", "usecase"],
            ),
            Bucket::Handlers => (
                &["api", "http", "grpc", "transport"],
                &["handler", "controller", "routes"],
            ),
        }
    }
}

const BUILD_MANIFESTS: &[&str] = &["go.mod", "go.sum", "cargo.toml", "package.json", "pyproject.toml"];

/// Layer for a patch target path, or `None` when nothing matches.
pub fn classify(path: &str) -> Option<Bucket> {
    let normalized = path.replace('\\', "/").to_lowercase();
    let segments: Vec<&str> = normalized
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    let (file_name, dirs) = segments.split_last()?;

    if BUILD_MANIFESTS.contains(file_name) {
        return Some(Bucket::Scaffolding);
    }

    Bucket::ALL.into_iter().find(|bucket| {
        let (dir_signals, substrings) = bucket.signals();
        dirs.iter().any(|d| dir_signals.contains(d))
            || segments
                .iter()
                .any(|segment| substrings.iter().any(|s| segment.contains(s)))
    })
}

#[derive(Debug, Clone)]
pub struct PatchPlanner {
    max_batch_size: usize,
}

impl Default for PatchPlanner {
    fn default() -> Self {
        Self::new(10)
    }
}

impl PatchPlanner {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Partition `patches` into stages. Every patch lands in exactly one
    /// stage and a stage only depends on stages with smaller ids.
    pub fn plan(&self, patches: Vec<Patch>) -> Vec<Stage> {
        let mut buckets: BTreeMap<Bucket, Vec<Patch>> = BTreeMap::new();
        let mut unclassified = Vec::new();
        for patch in patches {
            match classify(&patch.target_file) {
                Some(bucket) => buckets.entry(bucket).or_default().push(patch),
                None => unclassified.push(patch),
            }
        }

        let mut stages = Vec::new();
        let mut bucket_ids: HashMap<Bucket, StageId> = HashMap::new();
        let mut next_id: StageId = 1;

        for (bucket, patches) in buckets {
            let depends_on_stage_ids = bucket
                .depends_on()
                .iter()
                .filter_map(|dep| bucket_ids.get(dep).copied())
                .collect();
            stages.push(Stage {
                id: next_id,
                name: bucket.name().to_string(),
                patches: order_within_stage(bucket.name(), patches),
                depends_on_stage_ids,
                priority: bucket.priority(),
                rollback_strategy: bucket.rollback_strategy(),
            });
            bucket_ids.insert(bucket, next_id);
            next_id += 1;
        }

        let batch_count = unclassified.len().div_ceil(self.max_batch_size);
        let mut remaining = unclassified.into_iter();
        for batch in 1..=batch_count {
            let chunk: Vec<Patch> = remaining.by_ref().take(self.max_batch_size).collect();
            let name = format!("unclassified-{}", batch);
            stages.push(Stage {
                id: next_id,
                patches: order_within_stage(&name, chunk),
                name,
                depends_on_stage_ids: Vec::new(),
                priority: Priority::Low,
                rollback_strategy: RollbackStrategy::Skip,
            });
            next_id += 1;
        }

        tracing::info!(
            stages = stages.len(),
            patches = stages.iter().map(|s| s.patches.len()).sum::<usize>(),
            "planned migration stages"
        );
        for stage in &stages {
            tracing::debug!(
                stage_id = stage.id,
                name = %stage.name,
                patches = stage.patches.len(),
                priority = stage.priority.as_str(),
                depends_on = ?stage.depends_on_stage_ids,
                "stage planned"
            );
        }
        stages
    }
}

/// Stable topological order over dependencies between patches of one stage.
///
/// Dependencies on patches outside the stage are ignored here; stage
/// ordering covers them. A cycle keeps the input order.
fn order_within_stage(stage_name: &str, patches: Vec<Patch>) -> Vec<Patch> {
    let ids: HashSet<&str> = patches.iter().map(|p| p.id.as_str()).collect();
    let local_deps: Vec<Vec<&str>> = patches
        .iter()
        .map(|p| {
            p.dependencies
                .iter()
                .map(String::as_str)
                .filter(|d| ids.contains(d) && *d != p.id)
                .collect()
        })
        .collect();
    if local_deps.iter().all(Vec::is_empty) {
        return patches;
    }

    let mut emitted: HashSet<&str> = HashSet::new();
    let mut order: Vec<usize> = Vec::with_capacity(patches.len());
    while order.len() < patches.len() {
        let next = (0..patches.len()).find(|&i| {
            !emitted.contains(patches[i].id.as_str())
                && local_deps[i].iter().all(|d| emitted.contains(d))
        });
        match next {
            Some(i) => {
                emitted.insert(patches[i].id.as_str());
                order.push(i);
            }
            None => {
                tracing::warn!(
                    stage = stage_name,
                    "dependency cycle between patches; keeping input order"
                );
                return patches;
            }
        }
    }

    let mut slots: Vec<Option<Patch>> = patches.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}
