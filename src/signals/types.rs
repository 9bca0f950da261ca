//! Signal types for phase progress tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::actors::ReviewIssue;

/// A parsed test run, the primary evidence unit for RED/GREEN/REFACTOR.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRunSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    /// Names of every test present in the run, passing or failing.
    pub test_names: Vec<String>,
    /// Names of the failing tests plus any captured failure text.
    pub failure_messages: Vec<String>,
}

impl TestRunSummary {
    /// A run with zero failures.
    pub fn is_green(&self) -> bool {
        self.failed == 0
    }

    /// Set view of the test names, for baseline comparison.
    pub fn name_set(&self) -> BTreeSet<&str> {
        self.test_names.iter().map(String::as_str).collect()
    }

    /// True when every name in `baseline` is still present in this run.
    /// Deleting or skipping a baseline test to fake success fails this.
    pub fn covers(&self, baseline: &[String]) -> bool {
        let names = self.name_set();
        baseline.iter().all(|n| names.contains(n.as_str()))
    }
}

/// What a signal says. `ReviewCompleted` is injected by the review seam
/// rather than parsed from a log line; it shares the envelope so the audit
/// trail stays uniform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalKind {
    TestRunSummary(TestRunSummary),
    CompileStatus {
        ok: bool,
        errors: Vec<String>,
    },
    ServerReady {
        port: u16,
    },
    RuntimeError {
        message: String,
    },
    ProcessCrashed {
        exit_code: Option<i32>,
    },
    /// Synthesized when a phase's maximum signal wait elapses.
    Timeout {
        waited_secs: u64,
    },
    ReviewCompleted {
        issues: Vec<ReviewIssue>,
    },
}

/// A unit of evidence from one stream, tagged for ordering and idempotent
/// application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Stream identity, e.g. "api.test-output".
    pub stream: String,
    /// Byte offset in the log file just past the line that produced this.
    pub offset: u64,
    /// Strictly increasing per stream; resets with the epoch.
    pub seq: u64,
    /// Bumped on process restart and log truncation so stale in-flight
    /// signals are discernible.
    pub epoch: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: SignalKind,
}

impl Signal {
    pub fn new(stream: impl Into<String>, offset: u64, seq: u64, epoch: u64, kind: SignalKind) -> Self {
        Self {
            stream: stream.into(),
            offset,
            seq,
            epoch,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Idempotency key: replaying the same appended content yields the same key.
    pub fn key(&self) -> String {
        format!("{}@{}:{}", self.stream, self.epoch, self.offset)
    }

    /// Short description for audit excerpts and escalation records.
    pub fn describe(&self) -> String {
        let what = match &self.kind {
            SignalKind::TestRunSummary(s) => {
                format!("tests {} failed / {} passed / {} total", s.failed, s.passed, s.total)
            }
            SignalKind::CompileStatus { ok: true, .. } => "compiled ok".to_string(),
            SignalKind::CompileStatus { ok: false, errors } => {
                format!("compile failed ({} errors)", errors.len())
            }
            SignalKind::ServerReady { port } => format!("server ready on port {port}"),
            SignalKind::RuntimeError { message } => format!("runtime error: {message}"),
            SignalKind::ProcessCrashed { exit_code } => {
                format!("process crashed (exit {exit_code:?})")
            }
            SignalKind::Timeout { waited_secs } => format!("timeout after {waited_secs}s"),
            SignalKind::ReviewCompleted { issues } => {
                format!("review completed ({} issues)", issues.len())
            }
        };
        format!("[{}] {}", self.key(), what)
    }
}
