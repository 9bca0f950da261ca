//! Escalation policy.
//!
//! Pure decision logic, separated so the bounds are testable without a
//! running machine. The distinction it draws: ABORT means the environment
//! itself failed (a supervised process died, nothing further can be
//! observed); ESCALATE means the environment is healthy but the work needs
//! a human judgment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::signals::SignalKind;
use crate::workitem::Phase;

/// Why a work item was frozen for human attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    AmbiguousRequirement,
    CannotAchieveRed,
    CannotAchieveGreen,
    RegressionLoop,
    ReviewFailed,
    ExternalDependencyUnavailable,
    AttentionBudgetExpired,
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AmbiguousRequirement => "ambiguous requirement",
            Self::CannotAchieveRed => "cannot achieve red",
            Self::CannotAchieveGreen => "cannot achieve green",
            Self::RegressionLoop => "regression loop",
            Self::ReviewFailed => "review failed",
            Self::ExternalDependencyUnavailable => "external dependency unavailable",
            Self::AttentionBudgetExpired => "attention budget expired",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Escalate(EscalationReason),
    Abort,
}

/// Check a work item after a counted attempt. `attempts` is the count
/// including the attempt just made; `limit` is the configured bound for the
/// phase; `trigger` is the signal that ended the attempt, when there was one.
pub fn decide(phase: Phase, attempts: u32, limit: u32, trigger: Option<&SignalKind>) -> Verdict {
    // Environment failure trumps retry budgets.
    if let Some(SignalKind::ProcessCrashed { .. }) = trigger {
        return Verdict::Abort;
    }
    if attempts >= limit {
        return Verdict::Escalate(exhaustion_reason(phase, trigger));
    }
    Verdict::Continue
}

fn exhaustion_reason(phase: Phase, trigger: Option<&SignalKind>) -> EscalationReason {
    // Repeated timeouts mean the watcher never produced evidence; that is
    // an external problem, not a failure of the change itself.
    if let Some(SignalKind::Timeout { .. }) = trigger {
        return EscalationReason::ExternalDependencyUnavailable;
    }
    match phase {
        Phase::Red => EscalationReason::CannotAchieveRed,
        Phase::Green => EscalationReason::CannotAchieveGreen,
        Phase::Refactor => EscalationReason::RegressionLoop,
        Phase::Review => EscalationReason::ReviewFailed,
        _ => EscalationReason::AmbiguousRequirement,
    }
}

/// Durable record written when an item freezes, with enough context for the
/// human to act without replaying the logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub work_item_id: String,
    pub reason: EscalationReason,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
    /// Snapshot reference the working tree was left at, if one exists.
    pub snapshot: Option<String>,
    /// Short excerpt of the most recent signals, newest last.
    pub recent_signals: Vec<String>,
}

impl EscalationRecord {
    pub fn new(
        work_item_id: impl Into<String>,
        reason: EscalationReason,
        phase: Phase,
        snapshot: Option<String>,
        recent_signals: Vec<String>,
    ) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            reason,
            phase,
            timestamp: Utc::now(),
            snapshot,
            recent_signals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::TestRunSummary;

    fn failing_summary() -> SignalKind {
        SignalKind::TestRunSummary(TestRunSummary {
            total: 2,
            passed: 1,
            failed: 1,
            test_names: vec!["a".into(), "b".into()],
            failure_messages: vec!["b".into()],
        })
    }

    #[test]
    fn test_continue_below_limit() {
        assert_eq!(
            decide(Phase::Red, 2, 10, Some(&failing_summary())),
            Verdict::Continue
        );
    }

    #[test]
    fn test_escalates_at_limit_with_phase_reason() {
        assert_eq!(
            decide(Phase::Red, 10, 10, Some(&failing_summary())),
            Verdict::Escalate(EscalationReason::CannotAchieveRed)
        );
        assert_eq!(
            decide(Phase::Green, 10, 10, Some(&failing_summary())),
            Verdict::Escalate(EscalationReason::CannotAchieveGreen)
        );
        assert_eq!(
            decide(Phase::Refactor, 3, 3, Some(&failing_summary())),
            Verdict::Escalate(EscalationReason::RegressionLoop)
        );
        assert_eq!(
            decide(Phase::Review, 10, 10, None),
            Verdict::Escalate(EscalationReason::ReviewFailed)
        );
    }

    #[test]
    fn test_crash_aborts_regardless_of_attempts() {
        assert_eq!(
            decide(
                Phase::Green,
                1,
                10,
                Some(&SignalKind::ProcessCrashed { exit_code: Some(1) })
            ),
            Verdict::Abort
        );
    }

    #[test]
    fn test_exhausted_timeouts_blame_the_environment() {
        assert_eq!(
            decide(
                Phase::Red,
                10,
                10,
                Some(&SignalKind::Timeout { waited_secs: 900 })
            ),
            Verdict::Escalate(EscalationReason::ExternalDependencyUnavailable)
        );
    }

    #[test]
    fn test_record_serialization() {
        let record = EscalationRecord::new(
            "TCK-1",
            EscalationReason::RegressionLoop,
            Phase::Refactor,
            Some("abc123".into()),
            vec!["[api.test-output@1:300] tests 1 failed / 4 passed / 5 total".into()],
        );
        let json = serde_json::to_string_pretty(&record).unwrap();
        assert!(json.contains("regression_loop"));
        let parsed: EscalationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.reason, EscalationReason::RegressionLoop);
        assert_eq!(parsed.phase, Phase::Refactor);
    }
}
