//! External actor seams.
//!
//! The orchestrator decides *whether, when, and how* to advance a work item;
//! the actual editing and the review judgment live behind these traits. The
//! orchestrator never inspects diff content — it hands the actor a phase and
//! a signal context, then watches the log streams for the consequences.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use crate::workitem::{Phase, WorkItem};

/// Severity classification for review issues, ordered from most to least
/// critical.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Correctness or security problem; always actionable.
    Error,
    #[default]
    Warning,
    Info,
    Note,
}

impl IssueSeverity {
    /// True when this issue is at or above `threshold` (more or equally
    /// critical). `Error` is at least everything.
    pub fn is_at_least(&self, threshold: IssueSeverity) -> bool {
        *self <= threshold
    }
}

impl fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Note => "note",
        };
        write!(f, "{s}")
    }
}

/// A single issue raised by the review actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: IssueSeverity,
    pub message: String,
    #[serde(default)]
    pub location: Option<String>,
}

impl ReviewIssue {
    pub fn new(severity: IssueSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Complete output of one review pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewCompleted {
    pub issues: Vec<ReviewIssue>,
}

impl ReviewCompleted {
    pub fn clean() -> Self {
        Self::default()
    }

    /// Issues at or above the given severity threshold.
    pub fn blocking_issues(&self, threshold: IssueSeverity) -> Vec<&ReviewIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity.is_at_least(threshold))
            .collect()
    }
}

/// What the actor was looking at when invoked: a short excerpt of the most
/// recent signals, newest last.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalContext {
    pub recent: Vec<String>,
}

/// Result of one code-change invocation. The summary is informational only;
/// the orchestrator judges progress from subsequent signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeOutcome {
    pub change_set_applied: bool,
    pub summary: String,
}

/// The external coding agent. Invoked once per phase attempt.
#[async_trait]
pub trait CodeChangeActor: Send + Sync {
    async fn apply(
        &self,
        phase: Phase,
        item: &WorkItem,
        context: &SignalContext,
    ) -> anyhow::Result<ChangeOutcome>;
}

/// The external reviewer. Invoked with a changeset reference after a clean
/// refactor pass.
#[async_trait]
pub trait ReviewActor: Send + Sync {
    async fn review(&self, changeset_ref: &str) -> anyhow::Result<ReviewCompleted>;
}

/// Change actor backed by an operator-configured shell command. The ticket
/// and signal context travel in environment variables; the command's only
/// obligation is to edit the working tree and exit.
pub struct CommandChangeActor {
    command: String,
    cwd: std::path::PathBuf,
}

impl CommandChangeActor {
    pub fn new(command: impl Into<String>, cwd: std::path::PathBuf) -> Self {
        Self {
            command: command.into(),
            cwd,
        }
    }
}

#[async_trait]
impl CodeChangeActor for CommandChangeActor {
    async fn apply(
        &self,
        phase: Phase,
        item: &WorkItem,
        context: &SignalContext,
    ) -> anyhow::Result<ChangeOutcome> {
        use anyhow::Context as _;
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.cwd)
            .env("VIGIL_PHASE", phase.to_string())
            .env("VIGIL_ITEM", &item.id)
            .env("VIGIL_TITLE", &item.title)
            .env("VIGIL_REQUIREMENT", &item.requirement_text)
            .env("VIGIL_CRITERIA", item.acceptance_criteria.join("\n"))
            .env("VIGIL_CONSTRAINTS", item.constraints.join("\n"))
            .env("VIGIL_RECENT_SIGNALS", context.recent.join("\n"))
            .output()
            .await
            .with_context(|| format!("Failed to run change command: {}", self.command))?;
        let summary: String = String::from_utf8_lossy(&output.stdout)
            .trim()
            .chars()
            .take(400)
            .collect();
        Ok(ChangeOutcome {
            change_set_applied: output.status.success(),
            summary,
        })
    }
}

/// Review actor backed by a shell command printing issues as JSON: either
/// a bare array of issues or `{"issues": [...]}`.
pub struct CommandReviewActor {
    command: String,
    cwd: std::path::PathBuf,
}

impl CommandReviewActor {
    pub fn new(command: impl Into<String>, cwd: std::path::PathBuf) -> Self {
        Self {
            command: command.into(),
            cwd,
        }
    }
}

#[async_trait]
impl ReviewActor for CommandReviewActor {
    async fn review(&self, changeset_ref: &str) -> anyhow::Result<ReviewCompleted> {
        use anyhow::Context as _;
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.cwd)
            .env("VIGIL_CHANGESET", changeset_ref)
            .output()
            .await
            .with_context(|| format!("Failed to run review command: {}", self.command))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(ReviewCompleted::clean());
        }
        if let Ok(review) = serde_json::from_str::<ReviewCompleted>(trimmed) {
            return Ok(review);
        }
        let issues: Vec<ReviewIssue> = serde_json::from_str(trimmed)
            .with_context(|| format!("Review command printed unparseable JSON: {trimmed}"))?;
        Ok(ReviewCompleted { issues })
    }
}

/// Deterministic actor that acknowledges every invocation. The scheduler and
/// machine tests drive phase progress by feeding signals, not by editing
/// code, so "applied" is all the orchestrator needs to hear.
#[derive(Debug, Default)]
pub struct ScriptedChangeActor {
    invocations: Mutex<Vec<Phase>>,
}

impl ScriptedChangeActor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phases this actor has been invoked for, in order.
    pub fn invoked_phases(&self) -> Vec<Phase> {
        self.invocations.lock().expect("actor mutex poisoned").clone()
    }
}

#[async_trait]
impl CodeChangeActor for ScriptedChangeActor {
    async fn apply(
        &self,
        phase: Phase,
        _item: &WorkItem,
        _context: &SignalContext,
    ) -> anyhow::Result<ChangeOutcome> {
        self.invocations
            .lock()
            .expect("actor mutex poisoned")
            .push(phase);
        Ok(ChangeOutcome {
            change_set_applied: true,
            summary: format!("scripted change for {phase}"),
        })
    }
}

/// Review actor that replays a scripted sequence of results, then reports
/// clean reviews once the script is exhausted.
#[derive(Debug, Default)]
pub struct ScriptedReviewActor {
    script: Mutex<VecDeque<ReviewCompleted>>,
}

impl ScriptedReviewActor {
    pub fn new(script: Vec<ReviewCompleted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }
}

#[async_trait]
impl ReviewActor for ScriptedReviewActor {
    async fn review(&self, _changeset_ref: &str) -> anyhow::Result<ReviewCompleted> {
        Ok(self
            .script
            .lock()
            .expect("actor mutex poisoned")
            .pop_front()
            .unwrap_or_else(ReviewCompleted::clean))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(IssueSeverity::Error < IssueSeverity::Warning);
        assert!(IssueSeverity::Warning < IssueSeverity::Info);
        assert!(IssueSeverity::Error.is_at_least(IssueSeverity::Warning));
        assert!(IssueSeverity::Warning.is_at_least(IssueSeverity::Warning));
        assert!(!IssueSeverity::Info.is_at_least(IssueSeverity::Warning));
    }

    #[test]
    fn test_blocking_issues_filters_by_threshold() {
        let review = ReviewCompleted {
            issues: vec![
                ReviewIssue::new(IssueSeverity::Error, "off-by-one").with_location("src/pager.rs:40"),
                ReviewIssue::new(IssueSeverity::Info, "naming nit"),
            ],
        };
        let blocking = review.blocking_issues(IssueSeverity::Warning);
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].message, "off-by-one");
    }

    #[test]
    fn test_clean_review_has_no_blockers() {
        assert!(
            ReviewCompleted::clean()
                .blocking_issues(IssueSeverity::Note)
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_command_change_actor_passes_phase_in_env() {
        let dir = tempfile::tempdir().unwrap();
        let actor = CommandChangeActor::new("echo \"phase=$VIGIL_PHASE item=$VIGIL_ITEM\"", dir.path().to_path_buf());
        let item = crate::ticket::Ticket {
            id: "TCK-1".into(),
            title: "t".into(),
            requirement_text: "r".into(),
            acceptance_criteria: vec!["c".into()],
            constraints: vec![],
            project: "api".into(),
        }
        .into_work_item();
        let outcome = actor
            .apply(Phase::Red, &item, &SignalContext::default())
            .await
            .unwrap();
        assert!(outcome.change_set_applied);
        assert_eq!(outcome.summary, "phase=red item=TCK-1");
    }

    #[tokio::test]
    async fn test_command_review_actor_parses_issue_array() {
        let dir = tempfile::tempdir().unwrap();
        let actor = CommandReviewActor::new(
            r#"echo '[{"severity":"error","message":"leaks body"}]'"#,
            dir.path().to_path_buf(),
        );
        let review = actor.review("abc123").await.unwrap();
        assert_eq!(review.issues.len(), 1);
        assert_eq!(review.issues[0].severity, IssueSeverity::Error);
    }

    #[tokio::test]
    async fn test_command_review_actor_empty_output_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let actor = CommandReviewActor::new("true", dir.path().to_path_buf());
        let review = actor.review("abc123").await.unwrap();
        assert!(review.issues.is_empty());
    }

    #[tokio::test]
    async fn test_scripted_review_actor_replays_then_goes_clean() {
        let actor = ScriptedReviewActor::new(vec![ReviewCompleted {
            issues: vec![ReviewIssue::new(IssueSeverity::Error, "bad")],
        }]);
        let first = actor.review("cs-1").await.unwrap();
        assert_eq!(first.issues.len(), 1);
        let second = actor.review("cs-2").await.unwrap();
        assert!(second.issues.is_empty());
    }
}
