//! Line-oriented signal extraction.
//!
//! Extracts typed signals from watcher output using regex patterns for:
//! - jest-style per-test result lines (`✓ name`, `✕ name`)
//! - run summary lines (`Tests: 1 failed, 4 passed, 5 total`)
//! - compile status (`Compiled successfully`, `Failed to compile`, `ERROR in ...`)
//! - server readiness (`Listening on port 3000`)
//! - runtime error lines (`Error: ...`)
//!
//! Lines that match nothing are dropped without comment; the extractor is a
//! filter, not a validator. One extractor instance serves one stream, since
//! test-name accumulation carries state between lines.

use super::types::{SignalKind, TestRunSummary};
use regex::Regex;
use std::sync::LazyLock;

// Compile regexes once using LazyLock
static TEST_PASS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:✓|√|✔)\s+(.+?)(?:\s+\(\d+\s*m?s\))?\s*$").unwrap());

static TEST_FAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:✕|×|✗)\s+(.+?)(?:\s+\(\d+\s*m?s\))?\s*$").unwrap());

static SUMMARY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^Tests:\s+(?:(\d+)\s+failed,\s+)?(?:(\d+)\s+skipped,\s+)?(\d+)\s+passed,\s+(\d+)\s+total",
    )
    .unwrap()
});

static COMPILE_OK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)compiled successfully").unwrap());

static COMPILE_FAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)failed to compile").unwrap());

static COMPILE_ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ERROR in\s+(.+)$").unwrap());

static SERVER_READY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)listening on (?:port\s+)?:?(\d{2,5})").unwrap());

static RUNTIME_ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^((?:[A-Z][A-Za-z]*)?Error):\s+(.+)$").unwrap());

/// Stateful extractor for one log stream. Feed it lines in file order; it
/// emits zero or more signals per line.
#[derive(Debug, Default)]
pub struct LineExtractor {
    /// Test names seen since the last summary, passing and failing.
    pending_names: Vec<String>,
    /// Failure text accumulated since the last summary.
    pending_failures: Vec<String>,
    /// Compile errors being collected after a `Failed to compile` marker.
    pending_compile_errors: Option<Vec<String>>,
}

impl LineExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one complete line. Returned signals preserve log order.
    pub fn extract(&mut self, line: &str) -> Vec<SignalKind> {
        let mut out = Vec::new();

        if let Some(cap) = TEST_PASS_REGEX.captures(line) {
            self.pending_names.push(cap[1].trim().to_string());
            return out;
        }

        if let Some(cap) = TEST_FAIL_REGEX.captures(line) {
            let name = cap[1].trim().to_string();
            self.pending_failures.push(name.clone());
            self.pending_names.push(name);
            return out;
        }

        if let Some(cap) = SUMMARY_REGEX.captures(line) {
            if let Some(pending) = self.take_pending_compile() {
                out.push(pending);
            }
            let failed = cap.get(1).map_or(0, |m| m.as_str().parse().unwrap_or(0));
            let passed = cap.get(3).map_or(0, |m| m.as_str().parse().unwrap_or(0));
            let total = cap.get(4).map_or(0, |m| m.as_str().parse().unwrap_or(0));
            out.push(SignalKind::TestRunSummary(TestRunSummary {
                total,
                passed,
                failed,
                test_names: std::mem::take(&mut self.pending_names),
                failure_messages: std::mem::take(&mut self.pending_failures),
            }));
            return out;
        }

        if COMPILE_OK_REGEX.is_match(line) {
            if let Some(pending) = self.take_pending_compile() {
                out.push(pending);
            }
            out.push(SignalKind::CompileStatus {
                ok: true,
                errors: Vec::new(),
            });
            return out;
        }

        if COMPILE_FAIL_REGEX.is_match(line) {
            if let Some(pending) = self.take_pending_compile() {
                out.push(pending);
            }
            // Start collecting ERROR lines; emitted at the next marker or
            // batch boundary so the error text rides along.
            self.pending_compile_errors = Some(Vec::new());
            return out;
        }

        if let Some(cap) = COMPILE_ERROR_REGEX.captures(line) {
            if let Some(errors) = self.pending_compile_errors.as_mut() {
                errors.push(cap[1].trim().to_string());
            }
            return out;
        }

        if let Some(cap) = SERVER_READY_REGEX.captures(line) {
            if let Ok(port) = cap[1].parse::<u16>() {
                out.push(SignalKind::ServerReady { port });
            }
            return out;
        }

        if let Some(cap) = RUNTIME_ERROR_REGEX.captures(line) {
            out.push(SignalKind::RuntimeError {
                message: format!("{}: {}", &cap[1], cap[2].trim()),
            });
            return out;
        }

        out
    }

    /// Flush a pending compile failure. The tailer calls this after each
    /// poll batch so a `Failed to compile` block at the tail of the file is
    /// not held back waiting for a line that never comes.
    pub fn end_of_batch(&mut self) -> Option<SignalKind> {
        self.take_pending_compile()
    }

    fn take_pending_compile(&mut self) -> Option<SignalKind> {
        self.pending_compile_errors
            .take()
            .map(|errors| SignalKind::CompileStatus { ok: false, errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(lines: &[&str]) -> Vec<SignalKind> {
        let mut extractor = LineExtractor::new();
        let mut signals: Vec<SignalKind> = lines
            .iter()
            .flat_map(|line| extractor.extract(line))
            .collect();
        signals.extend(extractor.end_of_batch());
        signals
    }

    #[test]
    fn test_failing_run_summary() {
        let signals = run(&[
            "  ✓ returns 200 for known id (12 ms)",
            "  ✕ attaches a trace id [ac: trace id matches pattern] (3 ms)",
            "",
            "Tests:       1 failed, 1 passed, 2 total",
        ]);
        assert_eq!(signals.len(), 1);
        let SignalKind::TestRunSummary(summary) = &signals[0] else {
            panic!("expected a test run summary, got {:?}", signals[0]);
        };
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.total, 2);
        assert_eq!(
            summary.test_names,
            vec![
                "returns 200 for known id",
                "attaches a trace id [ac: trace id matches pattern]"
            ]
        );
        assert_eq!(
            summary.failure_messages,
            vec!["attaches a trace id [ac: trace id matches pattern]"]
        );
    }

    #[test]
    fn test_all_passing_summary_without_failed_segment() {
        let signals = run(&["  ✓ a", "  ✓ b", "Tests:       2 passed, 2 total"]);
        let SignalKind::TestRunSummary(summary) = &signals[0] else {
            panic!("expected a test run summary");
        };
        assert!(summary.is_green());
        assert_eq!(summary.total, 2);
    }

    #[test]
    fn test_skipped_segment_is_tolerated() {
        let signals = run(&["Tests:       1 failed, 2 skipped, 3 passed, 6 total"]);
        let SignalKind::TestRunSummary(summary) = &signals[0] else {
            panic!("expected a test run summary");
        };
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.total, 6);
    }

    #[test]
    fn test_names_reset_between_runs() {
        let mut extractor = LineExtractor::new();
        extractor.extract("  ✕ first run test");
        extractor.extract("Tests:       1 failed, 0 passed, 1 total");
        extractor.extract("  ✓ second run test");
        let signals = extractor.extract("Tests:       1 passed, 1 total");
        let SignalKind::TestRunSummary(summary) = &signals[0] else {
            panic!("expected a test run summary");
        };
        assert_eq!(summary.test_names, vec!["second run test"]);
        assert!(summary.failure_messages.is_empty());
    }

    #[test]
    fn test_compile_success() {
        let signals = run(&["Compiled successfully in 412ms"]);
        assert_eq!(
            signals,
            vec![SignalKind::CompileStatus {
                ok: true,
                errors: vec![]
            }]
        );
    }

    #[test]
    fn test_compile_failure_collects_error_lines() {
        let signals = run(&[
            "Failed to compile.",
            "",
            "ERROR in src/handlers/user.ts:42:7",
            "ERROR in src/handlers/user.ts:58:11",
        ]);
        assert_eq!(
            signals,
            vec![SignalKind::CompileStatus {
                ok: false,
                errors: vec![
                    "src/handlers/user.ts:42:7".to_string(),
                    "src/handlers/user.ts:58:11".to_string(),
                ],
            }]
        );
    }

    #[test]
    fn test_compile_failure_flushed_by_next_marker() {
        let signals = run(&[
            "Failed to compile.",
            "ERROR in src/index.ts:1:1",
            "Compiled successfully in 98ms",
        ]);
        assert_eq!(signals.len(), 2);
        assert!(matches!(
            signals[0],
            SignalKind::CompileStatus { ok: false, .. }
        ));
        assert!(matches!(
            signals[1],
            SignalKind::CompileStatus { ok: true, .. }
        ));
    }

    #[test]
    fn test_server_ready_variants() {
        for line in [
            "Listening on port 3000",
            "Server listening on :8080",
            "[api] listening on port 4010",
        ] {
            let signals = run(&[line]);
            assert!(
                matches!(signals[0], SignalKind::ServerReady { .. }),
                "line {line:?} should parse as server-ready"
            );
        }
    }

    #[test]
    fn test_runtime_error_line() {
        let signals = run(&["TypeError: Cannot read properties of undefined (reading 'id')"]);
        assert_eq!(
            signals,
            vec![SignalKind::RuntimeError {
                message: "TypeError: Cannot read properties of undefined (reading 'id')".into()
            }]
        );
    }

    #[test]
    fn test_unrecognized_lines_are_dropped() {
        let signals = run(&[
            "> api@1.0.0 test",
            "> jest --watchAll",
            "ts-node starting...",
            "",
            "Snapshots:   0 total",
            "Time:        1.2 s",
        ]);
        assert!(signals.is_empty());
    }
}
