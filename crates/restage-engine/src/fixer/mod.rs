//! Mechanical build repair
//!
//! Classifies build failures and proposes whole-file rewrites that follow
//! from what the migration context already knows: renamed import paths,
//! relocated symbols and module roots that need a manifest. A repair pass
//! applies every fix, tidies when asked, then rebuilds at most once.

pub mod classify;

use crate::verifier::Verifier;
use restage_adapters::util::resolve_in_project;
use restage_core::{
    BuildError, BuildErrorKind, BuildResult, FailedFix, Fix, FixKind, FixResult, MigrationContext,
    SymbolRelocation,
};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

pub use classify::parse_build_errors;

pub const EXACT_RENAME_CONFIDENCE: f64 = 0.9;
pub const PREFIX_RENAME_CONFIDENCE: f64 = 0.75;
pub const MANIFEST_CONFIDENCE: f64 = 0.7;
pub const SYMBOL_CONFIDENCE: f64 = 0.8;

const SOURCE_EXTENSIONS: &[&str] = &["go", "rs", "ts", "tsx", "js", "jsx", "mjs", "py"];
const SKIP_DIRS: &[&str] = &["node_modules", "target", "vendor", "dist", "build", "__pycache__"];
const MAX_SCAN_FILE_BYTES: u64 = 1_000_000;

/// Fixes proposed for one set of errors.
#[derive(Debug, Clone, Default)]
pub struct FixPlan {
    pub fixes: Vec<Fix>,
    pub unhandled: Vec<BuildError>,
    pub needs_tidy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceLang {
    Go,
    Rust,
    Script,
    Python,
}

impl SourceLang {
    fn of(file: &str) -> Option<Self> {
        match Path::new(file).extension()?.to_str()? {
            "go" => Some(SourceLang::Go),
            "rs" => Some(SourceLang::Rust),
            "ts" | "tsx" | "js" | "jsx" | "mjs" => Some(SourceLang::Script),
            "py" => Some(SourceLang::Python),
            _ => None,
        }
    }

    fn separator(&self) -> &'static str {
        match self {
            SourceLang::Rust => "::",
            _ => ".",
        }
    }
}

/// Per-file view of pending edits so fixes to one file compose.
struct Overlay<'a> {
    root: &'a Path,
    bodies: BTreeMap<String, String>,
}

impl<'a> Overlay<'a> {
    fn new(root: &'a Path) -> Self {
        Self {
            root,
            bodies: BTreeMap::new(),
        }
    }

    fn current(&mut self, file: &str) -> Option<String> {
        if let Some(body) = self.bodies.get(file) {
            return Some(body.clone());
        }
        let path = resolve_in_project(self.root, Path::new(file)).ok()?;
        let body = fs::read_to_string(path.absolute).ok()?;
        self.bodies.insert(file.to_string(), body.clone());
        Some(body)
    }

    fn update(&mut self, file: &str, body: String) {
        self.bodies.insert(file.to_string(), body);
    }
}

#[derive(Debug, Clone)]
pub struct BuildFixer {
    project_root: PathBuf,
    dry_run: bool,
}

impl BuildFixer {
    pub fn new(project_root: &Path, dry_run: bool) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            dry_run,
        }
    }

    /// Propose fixes for `errors`. Nothing is written.
    pub fn plan(&self, errors: &[BuildError], context: &MigrationContext) -> FixPlan {
        let mut plan = FixPlan::default();
        let mut overlay = Overlay::new(&self.project_root);
        let mut by_kind: BTreeMap<BuildErrorKind, Vec<&BuildError>> = BTreeMap::new();
        for error in errors {
            by_kind.entry(error.kind).or_default().push(error);
        }

        // Manifests first so later rewrites see the final module layout.
        if let Some(dep_errors) = by_kind.get(&BuildErrorKind::Dependency) {
            plan.needs_tidy = true;
            plan.fixes.extend(self.plan_manifests(context));
            tracing::debug!(errors = dep_errors.len(), "dependency errors: manifests + tidy");
        }

        let mut done_imports: HashSet<(String, String)> = HashSet::new();
        for error in by_kind.get(&BuildErrorKind::Import).into_iter().flatten() {
            let fixes = self.plan_import(error, context, &mut overlay, &mut done_imports);
            match fixes {
                Some(fixes) => plan.fixes.extend(fixes),
                None => plan.unhandled.push((*error).clone()),
            }
        }

        let mut done_symbols: HashSet<(String, String)> = HashSet::new();
        for error in by_kind.get(&BuildErrorKind::Type).into_iter().flatten() {
            match self.plan_symbol(error, context, &mut overlay, &mut done_symbols) {
                Some(fixes) => plan.fixes.extend(fixes),
                None => plan.unhandled.push((*error).clone()),
            }
        }

        plan.unhandled.extend(
            by_kind
                .get(&BuildErrorKind::Syntax)
                .into_iter()
                .flatten()
                .map(|e| (*e).clone()),
        );

        tracing::info!(
            fixes = plan.fixes.len(),
            unhandled = plan.unhandled.len(),
            tidy = plan.needs_tidy,
            "build fix plan ready"
        );
        plan
    }

    fn plan_manifests(&self, context: &MigrationContext) -> Vec<Fix> {
        context
            .modules
            .iter()
            .filter_map(|module| {
                let file = Path::new(&module.dir)
                    .join(&context.manifest.file_name)
                    .to_string_lossy()
                    .to_string();
                let resolved = resolve_in_project(&self.project_root, Path::new(&file)).ok()?;
                if resolved.absolute.exists() {
                    return None;
                }
                Some(Fix {
                    kind: FixKind::Config,
                    description: format!("create {} for module {}", file, module.name),
                    patch_body: context.manifest.render(&module.name),
                    file,
                    confidence: MANIFEST_CONFIDENCE,
                })
            })
            .collect()
    }

    /// `None` means the error cannot be addressed.
    fn plan_import(
        &self,
        error: &BuildError,
        context: &MigrationContext,
        overlay: &mut Overlay<'_>,
        done: &mut HashSet<(String, String)>,
    ) -> Option<Vec<Fix>> {
        let old_path = error.context.as_deref()?;
        let (new_path, exact) = context.rename_for(old_path)?;
        let confidence = if exact {
            EXACT_RENAME_CONFIDENCE
        } else {
            PREFIX_RENAME_CONFIDENCE
        };

        let files = if error.file.is_empty() {
            self.files_mentioning(old_path)
        } else {
            vec![normalize(&error.file)]
        };

        let mut fixes = Vec::new();
        let mut already_done = false;
        for file in files {
            if !done.insert((file.clone(), old_path.to_string())) {
                already_done = true;
                continue;
            }
            let Some(body) = overlay.current(&file) else {
                continue;
            };
            let rewritten = rewrite_import(&body, old_path, &new_path);
            if rewritten == body {
                continue;
            }
            overlay.update(&file, rewritten.clone());
            fixes.push(Fix {
                kind: FixKind::Import,
                description: format!("rewrite import \"{}\" -> \"{}\" in {}", old_path, new_path, file),
                file,
                patch_body: rewritten,
                confidence,
            });
        }
        (!fixes.is_empty() || already_done).then_some(fixes)
    }

    fn plan_symbol(
        &self,
        error: &BuildError,
        context: &MigrationContext,
        overlay: &mut Overlay<'_>,
        done: &mut HashSet<(String, String)>,
    ) -> Option<Vec<Fix>> {
        if error.file.is_empty() {
            return None;
        }
        let subject = error.context.as_deref()?;
        let (old_qualifier, symbol) = match subject.rsplit_once(&['.', ':'][..]) {
            Some((q, s)) => (Some(q.trim_end_matches(':')), s),
            None => (None, subject),
        };
        let relocation = context.symbols.get(symbol)?;
        let file = normalize(&error.file);
        if !done.insert((file.clone(), subject.to_string())) {
            return Some(Vec::new());
        }
        let lang = SourceLang::of(&file)?;
        let body = overlay.current(&file)?;

        let qualified = rewrite_symbol(&body, old_qualifier, symbol, relocation, lang);
        let rewritten = add_import(&qualified, relocation, lang);
        if rewritten == body {
            return None;
        }
        overlay.update(&file, rewritten.clone());
        Some(vec![Fix {
            kind: FixKind::Type,
            description: format!(
                "qualify {} as {}{}{} in {}",
                symbol,
                relocation.qualifier,
                lang.separator(),
                symbol,
                file
            ),
            file,
            patch_body: rewritten,
            confidence: SYMBOL_CONFIDENCE,
        }])
    }

    /// Project source files containing `import_path` in quotes.
    fn files_mentioning(&self, import_path: &str) -> Vec<String> {
        let needles = [format!("\"{}\"", import_path), format!("'{}'", import_path)];
        let walker = WalkDir::new(&self.project_root)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                e.depth() == 0 || !(name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref()))
            });

        let mut files = Vec::new();
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let is_source = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| SOURCE_EXTENSIONS.contains(&e))
                .unwrap_or(false);
            let small = entry
                .metadata()
                .map(|m| m.len() <= MAX_SCAN_FILE_BYTES)
                .unwrap_or(false);
            if !is_source || !small {
                continue;
            }
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };
            if needles.iter().any(|n| content.contains(n.as_str())) {
                if let Ok(relative) = entry.path().strip_prefix(&self.project_root) {
                    files.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        files.sort();
        files
    }

    /// Write one fix. Config fixes create their file; others must overwrite
    /// an existing one.
    pub fn apply(&self, fix: &Fix) -> Result<(), String> {
        let path = resolve_in_project(&self.project_root, Path::new(&fix.file))?.absolute;
        match fix.kind {
            FixKind::Config => {
                if self.dry_run {
                    return Ok(());
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| format!("failed to create directory: {}", e))?;
                }
            }
            FixKind::Import | FixKind::Dependency | FixKind::Type => {
                if !path.is_file() {
                    return Err(format!("{} does not exist", fix.file));
                }
                if self.dry_run {
                    return Ok(());
                }
            }
        }
        fs::write(&path, &fix.patch_body).map_err(|e| format!("failed to write {}: {}", fix.file, e))
    }

    /// Plan, apply, tidy if needed, then rebuild once.
    ///
    /// The rebuild is skipped when nothing was changed.
    pub fn repair(
        &self,
        failed_build: &BuildResult,
        context: &MigrationContext,
        verifier: &dyn Verifier,
        build_timeout: Duration,
        tidy_timeout: Duration,
    ) -> FixResult {
        let errors = parse_build_errors(&failed_build.errors);
        let plan = self.plan(&errors, context);

        let mut result = FixResult {
            unhandled: plan.unhandled,
            ..Default::default()
        };
        for fix in plan.fixes {
            match self.apply(&fix) {
                Ok(()) => {
                    tracing::info!(
                        kind = fix.kind.as_str(),
                        file = %fix.file,
                        confidence = fix.confidence,
                        "fix applied"
                    );
                    result.applied.push(fix);
                }
                Err(error) => {
                    tracing::warn!(file = %fix.file, error = %error, "fix failed");
                    result.failed.push(FailedFix { fix, error });
                }
            }
        }

        if plan.needs_tidy {
            result.tidy_ran = verifier.tidy(tidy_timeout).is_some();
        }

        if result.applied.is_empty() && !result.tidy_ran {
            tracing::info!("no fix applied; skipping rebuild");
            return result;
        }
        result.rebuild = Some(verifier.build(build_timeout));
        result
    }
}

fn normalize(file: &str) -> String {
    file.trim_start_matches("./").replace('\\', "/")
}

fn rewrite_import(body: &str, old_path: &str, new_path: &str) -> String {
    let mut out = body.to_string();
    for quote in ['"', '\'', '`'] {
        let from = format!("{q}{}{q}", old_path, q = quote);
        let to = format!("{q}{}{q}", new_path, q = quote);
        out = out.replace(&from, &to);
    }
    out
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Replace references to `symbol` with `qualifier<sep>symbol`.
///
/// With `old_qualifier`, only `old_qualifier<sep>symbol` is rewritten.
/// Otherwise bare occurrences are, skipping ones already qualified.
fn rewrite_symbol(
    body: &str,
    old_qualifier: Option<&str>,
    symbol: &str,
    relocation: &SymbolRelocation,
    lang: SourceLang,
) -> String {
    let sep = lang.separator();
    let replacement = format!("{}{}{}", relocation.qualifier, sep, symbol);
    if let Some(old) = old_qualifier {
        return body.replace(&format!("{}{}{}", old, sep, symbol), &replacement);
    }

    let mut out = String::with_capacity(body.len() + 64);
    let mut rest = body;
    while let Some(idx) = rest.find(symbol) {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + symbol.len()..];
        // `out` holds everything up to the match, earlier symbols included.
        let prev = out.chars().next_back();
        let next = after.chars().next();
        let bounded = !prev.map(is_ident_char).unwrap_or(false)
            && !next.map(is_ident_char).unwrap_or(false);
        let qualified = out.ends_with(sep);
        if bounded && !qualified {
            out.push_str(&replacement);
        } else {
            out.push_str(symbol);
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

fn import_line(relocation: &SymbolRelocation, lang: SourceLang) -> String {
    let package = &relocation.package;
    let qualifier = &relocation.qualifier;
    let last = package
        .rsplit(&['/', ':', '.'][..])
        .find(|s| !s.is_empty())
        .unwrap_or(package);
    match lang {
        SourceLang::Go if last == qualifier => format!("\"{}\"", package),
        SourceLang::Go => format!("{} \"{}\"", qualifier, package),
        SourceLang::Rust if last == qualifier => format!("use {};", package),
        SourceLang::Rust => format!("use {} as {};", package, qualifier),
        SourceLang::Script => format!("import * as {} from '{}';", qualifier, package),
        SourceLang::Python => format!("import {} as {}", package, qualifier),
    }
}

/// Add an import for `relocation` unless the file already has one.
fn add_import(body: &str, relocation: &SymbolRelocation, lang: SourceLang) -> String {
    let line = import_line(relocation, lang);
    let already = match lang {
        SourceLang::Go => body.contains(&format!("\"{}\"", relocation.package)),
        _ => body.lines().any(|l| l.trim() == line),
    };
    if already {
        return body.to_string();
    }

    let lines: Vec<&str> = body.lines().collect();
    let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    match lang {
        SourceLang::Go => {
            if let Some(i) = lines.iter().position(|l| l.trim_start().starts_with("import (")) {
                out.insert(i + 1, format!("\t{}", line));
            } else if let Some(i) = lines.iter().position(|l| l.trim_start().starts_with("import ")) {
                out.insert(i + 1, format!("import {}", line));
            } else if let Some(i) = lines.iter().position(|l| l.trim_start().starts_with("package ")) {
                out.insert(i + 1, String::new());
                out.insert(i + 2, format!("import {}", line));
            } else {
                out.insert(0, format!("import {}", line));
            }
        }
        _ => {
            let is_import = |l: &str| {
                let t = l.trim_start();
                t.starts_with("use ") || t.starts_with("import ") || t.starts_with("from ")
            };
            let at = lines.iter().rposition(|l| is_import(*l)).map(|i| i + 1).unwrap_or(0);
            out.insert(at, line);
        }
    }

    let mut joined = out.join("\n");
    if body.ends_with('\n') {
        joined.push('\n');
    }
    joined
}
