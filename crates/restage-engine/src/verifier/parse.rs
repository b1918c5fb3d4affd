//! Build and test output parsing.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use std::time::SystemTime;
use walkdir::WalkDir;

const MAX_ERROR_LINES: usize = 200;
const FALLBACK_TAIL_LINES: usize = 20;

fn location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:-->\s*)?[^\s:]+\.[A-Za-z0-9]+:\d+(?::\d+)?[:\s(]").expect("valid regex")
    })
}

fn error_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\berror\b|cannot find|undefined|no required module|not found|^FAIL\b")
            .expect("valid regex")
    })
}

fn warning_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bwarn(ing)?\b").expect("valid regex"))
}

/// Lines of tool output that look like errors.
///
/// When nothing matches, the last lines of output are returned so a failed
/// build always carries some explanation.
pub fn extract_error_lines(output: &str) -> Vec<String> {
    let mut errors: Vec<String> = output
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty()
                && !warning_re().is_match(trimmed)
                && (location_re().is_match(line) || error_marker_re().is_match(trimmed))
        })
        .map(|line| line.trim_end().to_string())
        .take(MAX_ERROR_LINES)
        .collect();

    if errors.is_empty() {
        let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(FALLBACK_TAIL_LINES);
        errors = lines[start..].iter().map(|l| l.trim_end().to_string()).collect();
    }
    errors
}

pub fn extract_warnings(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && warning_re().is_match(line))
        .map(str::to_string)
        .take(MAX_ERROR_LINES)
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCounts {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

/// Pass/fail counts from the first runner format found in `output`.
pub fn parse_test_counts(output: &str) -> Option<TestCounts> {
    parse_cargo(output)
        .or_else(|| parse_jest(output))
        .or_else(|| parse_pytest(output))
        .or_else(|| parse_go(output))
}

fn capture_u32(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn parse_cargo(output: &str) -> Option<TestCounts> {
    static PASSED: OnceLock<Regex> = OnceLock::new();
    static FAILED: OnceLock<Regex> = OnceLock::new();
    let passed_re = PASSED.get_or_init(|| Regex::new(r"(\d+) passed").expect("valid regex"));
    let failed_re = FAILED.get_or_init(|| Regex::new(r"(\d+) failed").expect("valid regex"));

    let mut counts = TestCounts::default();
    let mut found = false;
    for line in output.lines().filter(|l| l.trim_start().starts_with("test result:")) {
        found = true;
        counts.passed += capture_u32(passed_re, line).unwrap_or(0);
        counts.failed += capture_u32(failed_re, line).unwrap_or(0);
    }
    counts.total = counts.passed + counts.failed;
    found.then_some(counts)
}

fn parse_jest(output: &str) -> Option<TestCounts> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^Tests:\s+(?:(\d+) failed, )?(?:\d+ skipped, )?(?:(\d+) passed, )?(\d+) total")
            .expect("valid regex")
    });
    output.lines().find_map(|line| {
        let caps = re.captures(line.trim())?;
        let num = |i: usize| {
            caps.get(i)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .unwrap_or(0)
        };
        Some(TestCounts {
            failed: num(1),
            passed: num(2),
            total: num(3),
        })
    })
}

fn parse_pytest(output: &str) -> Option<TestCounts> {
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    static PASSED: OnceLock<Regex> = OnceLock::new();
    static FAILED: OnceLock<Regex> = OnceLock::new();
    let summary_re = SUMMARY.get_or_init(|| {
        Regex::new(r"^=+ .*\b\d+ (passed|failed|error).* in [\d.]+s").expect("valid regex")
    });
    let passed_re = PASSED.get_or_init(|| Regex::new(r"(\d+) passed").expect("valid regex"));
    let failed_re =
        FAILED.get_or_init(|| Regex::new(r"(\d+) (?:failed|errors?)").expect("valid regex"));

    let line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| summary_re.is_match(l))?;
    let passed = capture_u32(passed_re, line).unwrap_or(0);
    let failed = failed_re
        .captures_iter(line)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<u32>().ok()))
        .sum();
    Some(TestCounts {
        total: passed + failed,
        passed,
        failed,
    })
}

fn parse_go(output: &str) -> Option<TestCounts> {
    let mut passed = 0u32;
    let mut failed = 0u32;
    for line in output.lines().map(str::trim_start) {
        if line.starts_with("--- PASS:") {
            passed += 1;
        } else if line.starts_with("--- FAIL:") {
            failed += 1;
        }
    }
    if passed + failed > 0 {
        return Some(TestCounts {
            total: passed + failed,
            passed,
            failed,
        });
    }

    // Without -v only package summaries are printed.
    for line in output.lines() {
        if line.starts_with("ok  \t") || line.starts_with("ok \t") || line.starts_with("ok\t") {
            passed += 1;
        } else if line.starts_with("FAIL\t") {
            failed += 1;
        }
    }
    (passed + failed > 0).then_some(TestCounts {
        total: passed + failed,
        passed,
        failed,
    })
}

/// Statement coverage from a Go cover profile.
pub fn go_profile_coverage(profile: &str) -> Option<f64> {
    let mut total = 0u64;
    let mut covered = 0u64;
    for line in profile.lines().filter(|l| !l.starts_with("mode:")) {
        let mut fields = line.rsplitn(3, ' ');
        let count = fields.next().and_then(|v| v.parse::<u64>().ok());
        let statements = fields.next().and_then(|v| v.parse::<u64>().ok());
        if let (Some(count), Some(statements)) = (count, statements) {
            total += statements;
            if count > 0 {
                covered += statements;
            }
        }
    }
    (total > 0).then(|| covered as f64 * 100.0 / total as f64)
}

/// Line coverage from an istanbul `coverage-summary.json`.
pub fn istanbul_summary_coverage(json: &str) -> Option<f64> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    let total = value.get("total")?;
    ["lines", "statements"]
        .iter()
        .find_map(|key| total.get(key)?.get("pct")?.as_f64())
}

/// Mean of `coverage: N% of statements` lines.
pub fn coverage_from_output(output: &str) -> Option<f64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"coverage: (\d+(?:\.\d+)?)% of statements").expect("valid regex")
    });
    let values: Vec<f64> = re
        .captures_iter(output)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect();
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Coverage from artifacts written at or after `since`, then from output.
pub fn find_coverage(project_root: &Path, since: SystemTime, output: &str) -> Option<f64> {
    let walker = WalkDir::new(project_root)
        .max_depth(3)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !(e.depth() > 0 && (name.starts_with('.') || name == "node_modules" || name == "target"))
        });

    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let fresh = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .map(|modified| modified >= since)
            .unwrap_or(false);
        if !fresh {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let parsed = match name.as_ref() {
            "coverage.out" => go_profile_coverage(&content),
            "coverage-summary.json" => istanbul_summary_coverage(&content),
            _ => None,
        };
        if parsed.is_some() {
            return parsed;
        }
    }
    coverage_from_output(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_go_errors() {
        let output = "# example.com/app/internal/api\n\
            internal/api/handler.go:5:2: cannot find package \"foo/bar\" in any of:\n\
            \t/usr/local/go/src/foo/bar (from $GOROOT)\n\
            internal/api/handler.go:12:9: undefined: Invoice\n";
        let errors = extract_error_lines(output);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("internal/api/handler.go:5:2"));
        assert!(errors[1].contains("undefined: Invoice"));
    }

    #[test]
    fn test_extract_falls_back_to_tail() {
        let errors = extract_error_lines("something odd happened\nexit status 1\n");
        assert_eq!(errors, vec!["something odd happened", "exit status 1"]);
    }

    #[test]
    fn test_warnings_are_not_errors() {
        let output = "warning: unused variable `x`\nsrc/lib.rs:3:5: error[E0425]: cannot find value\n";
        assert_eq!(extract_warnings(output), vec!["warning: unused variable `x`"]);
        assert_eq!(extract_error_lines(output).len(), 1);
    }

    #[test]
    fn test_parse_go_verbose_counts() {
        let output = "=== RUN   TestA\n--- PASS: TestA (0.00s)\n=== RUN   TestB\n--- FAIL: TestB (0.01s)\n    --- PASS: TestB/sub (0.00s)\nFAIL\tex.com/a\t0.1s\n";
        assert_eq!(
            parse_test_counts(output),
            Some(TestCounts { total: 3, passed: 2, failed: 1 })
        );
    }

    #[test]
    fn test_parse_go_package_lines() {
        let output = "ok  \tex.com/a\t0.1s\nok  \tex.com/b\t0.2s\nFAIL\tex.com/c\t0.3s\n";
        assert_eq!(
            parse_test_counts(output),
            Some(TestCounts { total: 3, passed: 2, failed: 1 })
        );
    }

    #[test]
    fn test_parse_cargo_sums_suites() {
        let output = "test result: ok. 5 passed; 0 failed; 0 ignored\n\
                      test result: FAILED. 2 passed; 1 failed; 0 ignored\n";
        assert_eq!(
            parse_test_counts(output),
            Some(TestCounts { total: 8, passed: 7, failed: 1 })
        );
    }

    #[test]
    fn test_parse_jest_and_pytest() {
        assert_eq!(
            parse_test_counts("Tests:       1 failed, 4 passed, 5 total\n"),
            Some(TestCounts { total: 5, passed: 4, failed: 1 })
        );
        assert_eq!(
            parse_test_counts("Tests:       7 passed, 7 total\n"),
            Some(TestCounts { total: 7, passed: 7, failed: 0 })
        );
        assert_eq!(
            parse_test_counts("===== 2 failed, 10 passed in 1.23s =====\n"),
            Some(TestCounts { total: 12, passed: 10, failed: 2 })
        );
        assert_eq!(parse_test_counts("nothing to see"), None);
    }

    #[test]
    fn test_go_profile_coverage() {
        let profile = "mode: set\n\
            ex.com/a/x.go:3.14,5.2 2 1\n\
            ex.com/a/x.go:7.14,9.2 2 0\n";
        assert_eq!(go_profile_coverage(profile), Some(50.0));
        assert_eq!(go_profile_coverage("mode: set\n"), None);
    }

    #[test]
    fn test_istanbul_and_output_coverage() {
        let json = r#"{"total":{"lines":{"total":10,"covered":8,"pct":80}}}"#;
        assert_eq!(istanbul_summary_coverage(json), Some(80.0));
        let output = "ok  \ta\t0.1s\tcoverage: 60.0% of statements\nok  \tb\t0.1s\tcoverage: 80.0% of statements\n";
        assert_eq!(coverage_from_output(output), Some(70.0));
    }

    #[test]
    fn test_find_coverage_ignores_stale_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("coverage.out"), "mode: set\nx.go:1.1,2.2 4 1\n").unwrap();
        let later = SystemTime::now() + std::time::Duration::from_secs(3600);
        assert_eq!(find_coverage(dir.path(), later, ""), None);
        assert_eq!(
            find_coverage(dir.path(), SystemTime::UNIX_EPOCH, ""),
            Some(100.0)
        );
    }
}
