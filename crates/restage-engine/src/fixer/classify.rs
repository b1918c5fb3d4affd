//! Turns raw build output lines into classified [`BuildError`]s.

use regex::Regex;
use restage_core::{BuildError, BuildErrorKind};
use std::sync::OnceLock;

struct Patterns {
    /// `file:line:col: message` (go, gcc-style) and `file:line: message`.
    colon: Regex,
    /// `file(line,col): error TS1234: message` (tsc).
    tsc: Regex,
    /// `--> file:line:col` (rustc span line).
    rust_span: Regex,
    /// `error[E0432]: message` (rustc header line).
    rust_header: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        colon: Regex::new(r"^\s*([^\s:()]+\.[A-Za-z0-9]+):(\d+)(?::(\d+))?:\s*(.*)$")
            .expect("valid regex"),
        tsc: Regex::new(r"^\s*([^\s()]+\.[A-Za-z0-9]+)\((\d+),(\d+)\):\s*(?:error\s+TS\d+:\s*)?(.*)$")
            .expect("valid regex"),
        rust_span: Regex::new(r"^\s*-->\s*([^\s:]+):(\d+):(\d+)").expect("valid regex"),
        rust_header: Regex::new(r"^error(?:\[E\d+\])?:\s*(.*)$").expect("valid regex"),
    })
}

const DEPENDENCY_MARKERS: &[&str] = &[
    "go.mod file not found",
    "no required module provides",
    "missing go.sum entry",
    "module declares its path",
    "updates to go.mod needed",
    "cannot find main module",
    "failed to select a version",
    "no matching package named",
    "could not resolve dependency",
];

const IMPORT_MARKERS: &[&str] = &[
    "cannot find package",
    "could not import",
    "unresolved import",
    "cannot find module",
    "no module named",
    "is not in std",
    "is not in goroot",
    "package not found",
    "use of internal package",
];

const TYPE_MARKERS: &[&str] = &[
    "undefined:",
    "cannot find type",
    "cannot find value",
    "cannot find name",
    "cannot find struct",
    "cannot find function",
    "not declared by package",
    "has no field or method",
    "cannot use",
    "mismatched types",
    "is not a type",
];

pub fn classify_message(message: &str) -> BuildErrorKind {
    let lower = message.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));
    if has(DEPENDENCY_MARKERS) {
        BuildErrorKind::Dependency
    } else if has(IMPORT_MARKERS) {
        BuildErrorKind::Import
    } else if has(TYPE_MARKERS) {
        BuildErrorKind::Type
    } else {
        BuildErrorKind::Syntax
    }
}

/// First quoted token in `message`, for `"..."`, `'...'` or backticks.
pub fn quoted(message: &str) -> Option<String> {
    for quote in ['"', '`', '\''] {
        let Some(start) = message.find(quote) else {
            continue;
        };
        let rest = &message[start + quote.len_utf8()..];
        if let Some(end) = rest.find(quote) {
            let token = &rest[..end];
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Import path an import or dependency error refers to.
pub fn import_subject(message: &str) -> Option<String> {
    if let Some(token) = quoted(message) {
        return Some(token);
    }
    let lower = message.to_lowercase();
    let idx = lower.find("package ")?;
    let token = message[idx + "package ".len()..]
        .split(|c: char| c.is_whitespace() || c == ';' || c == ',')
        .next()?;
    (!token.is_empty()).then(|| token.to_string())
}

/// Undefined symbol a type error refers to, possibly `qualifier.Symbol`.
pub fn symbol_subject(message: &str) -> Option<String> {
    if let Some(idx) = message.find("undefined:") {
        let token = message[idx + "undefined:".len()..]
            .split_whitespace()
            .next()?;
        return Some(token.trim_matches(|c: char| c == '(' || c == ')').to_string());
    }
    quoted(message)
}

fn subject_for(kind: BuildErrorKind, message: &str) -> Option<String> {
    match kind {
        BuildErrorKind::Import | BuildErrorKind::Dependency => import_subject(message),
        BuildErrorKind::Type => symbol_subject(message),
        BuildErrorKind::Syntax => None,
    }
}

fn make_error(file: &str, line: u32, column: u32, message: &str) -> BuildError {
    let message = message.trim().to_string();
    let kind = classify_message(&message);
    BuildError {
        file: file.to_string(),
        line,
        column,
        kind,
        context: subject_for(kind, &message),
        message,
    }
}

/// Parse tool output lines into build errors, deduplicated.
///
/// Lines that name no location but still carry an error marker (for
/// example `cannot find package "x"` printed by a package loader) become
/// errors with an empty `file`.
pub fn parse_build_errors(lines: &[String]) -> Vec<BuildError> {
    let p = patterns();
    let mut errors: Vec<BuildError> = Vec::new();
    let mut pending_rust: Option<String> = None;

    for line in lines {
        if let Some(caps) = p.rust_span.captures(line) {
            if let Some(message) = pending_rust.take() {
                let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
                errors.push(make_error(&caps[1], num(2), num(3), &message));
            }
            continue;
        }
        if let Some(message) = pending_rust.take() {
            errors.push(make_error("", 0, 0, &message));
        }
        if let Some(caps) = p.rust_header.captures(line.trim()) {
            pending_rust = Some(caps[1].to_string());
            continue;
        }
        if let Some(caps) = p.tsc.captures(line) {
            let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            errors.push(make_error(&caps[1], num(2), num(3), &caps[4]));
            continue;
        }
        if let Some(caps) = p.colon.captures(line) {
            let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            errors.push(make_error(&caps[1], num(2), num(3), &caps[4]));
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let kind = classify_message(trimmed);
        if kind != BuildErrorKind::Syntax {
            let message = trimmed.trim_start_matches("go: ").trim_start_matches("error: ");
            errors.push(make_error("", 0, 0, message));
        }
    }
    if let Some(message) = pending_rust {
        errors.push(make_error("", 0, 0, &message));
    }

    let mut seen = std::collections::HashSet::new();
    errors.retain(|e| seen.insert((e.file.clone(), e.line, e.column, e.message.clone())));
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &str) -> Vec<String> {
        raw.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_parse_go_errors() {
        let errors = parse_build_errors(&lines(
            "internal/api/handler.go:5:2: cannot find package \"foo/bar\" in any of:\n\
             internal/api/handler.go:12:9: undefined: Invoice\n\
             internal/api/handler.go:20:1: syntax error: unexpected }",
        ));
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].kind, BuildErrorKind::Import);
        assert_eq!(errors[0].context.as_deref(), Some("foo/bar"));
        assert_eq!((errors[0].line, errors[0].column), (5, 2));
        assert_eq!(errors[1].kind, BuildErrorKind::Type);
        assert_eq!(errors[1].context.as_deref(), Some("Invoice"));
        assert_eq!(errors[2].kind, BuildErrorKind::Syntax);
    }

    #[test]
    fn test_parse_locationless_and_dependency_errors() {
        let errors = parse_build_errors(&lines(
            "cannot find package \"foo/bar\"\n\
             go: services/billing/main.go: no required module provides package github.com/acme/billing/domain; to add it:\n\
             exit status 1",
        ));
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].file, "");
        assert_eq!(errors[0].kind, BuildErrorKind::Import);
        assert_eq!(errors[1].kind, BuildErrorKind::Dependency);
        assert_eq!(
            errors[1].context.as_deref(),
            Some("github.com/acme/billing/domain")
        );
    }

    #[test]
    fn test_parse_rustc_and_tsc() {
        let errors = parse_build_errors(&lines(
            "error[E0432]: unresolved import `crate::billing`\n\
             \x20 --> src/main.rs:3:5\n\
             src/app.ts(4,10): error TS2304: Cannot find name 'Invoice'.",
        ));
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].file, "src/main.rs");
        assert_eq!(errors[0].kind, BuildErrorKind::Import);
        assert_eq!(errors[0].context.as_deref(), Some("crate::billing"));
        assert_eq!(errors[1].file, "src/app.ts");
        assert_eq!(errors[1].kind, BuildErrorKind::Type);
        assert_eq!(errors[1].context.as_deref(), Some("Invoice"));
    }

    #[test]
    fn test_qualified_undefined_symbol() {
        assert_eq!(
            symbol_subject("undefined: billing.Invoice"),
            Some("billing.Invoice".to_string())
        );
    }
}
