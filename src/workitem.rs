//! The WorkItem entity and its phase graph.
//!
//! A WorkItem is one ticket's end-to-end delivery cycle. Its phase only
//! changes through [`WorkItem::transition`], which enforces the legal edge
//! set and appends to the item's audit trail, so the trail is always a valid
//! path through the graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::policy::EscalationReason;
use crate::signals::Signal;

/// Lifecycle phase of a work item. `Queued` is the pre-phase holding state;
/// `Done` and `Aborted` are terminal; `Escalated` is frozen, not terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Queued,
    Red,
    Green,
    Refactor,
    Review,
    Done,
    Escalated,
    Aborted,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    /// A phase the machine actively works in (has an attempt budget).
    pub fn is_working(&self) -> bool {
        matches!(self, Self::Red | Self::Green | Self::Refactor | Self::Review)
    }

    /// Legal edges of the phase graph.
    pub fn can_transition_to(&self, to: Phase) -> bool {
        use Phase::*;
        match (self, to) {
            (Queued, Red) => true,
            (Red, Green) => true,
            (Green, Refactor) => true,
            (Refactor, Review) => true,
            (Review, Done) => true,
            // Review issues or unmapped acceptance criteria send work back.
            (Review, Refactor) => true,
            // Any non-terminal state may escalate or abort.
            (Queued | Red | Green | Refactor | Review, Escalated | Aborted) => true,
            // Human resume re-enters a working phase.
            (Escalated, Red | Green | Refactor | Review) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Red => "red",
            Self::Green => "green",
            Self::Refactor => "refactor",
            Self::Review => "review",
            Self::Done => "done",
            Self::Escalated => "escalated",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Illegal phase transition {from} -> {to}")]
pub struct TransitionError {
    pub from: Phase,
    pub to: Phase,
}

/// One audit-trail entry: a single edge taken through the phase graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub timestamp: DateTime<Utc>,
    pub from: Phase,
    pub to: Phase,
    /// Idempotency key of the signal that triggered the edge, or a named
    /// cause ("intake", "resume", "budget") for non-signal edges.
    pub trigger: String,
}

/// Per-phase attempt counters. Monotonic within a phase; reset only by an
/// explicit human resume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCounters {
    pub red: u32,
    pub green: u32,
    pub refactor: u32,
    pub review: u32,
}

impl AttemptCounters {
    pub fn get(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Red => self.red,
            Phase::Green => self.green,
            Phase::Refactor => self.refactor,
            Phase::Review => self.review,
            _ => 0,
        }
    }

    fn bump(&mut self, phase: Phase) -> u32 {
        let slot = match phase {
            Phase::Red => &mut self.red,
            Phase::Green => &mut self.green,
            Phase::Refactor => &mut self.refactor,
            Phase::Review => &mut self.review,
            _ => return 0,
        };
        *slot += 1;
        *slot
    }
}

/// How an incoming signal relates to what this item has already applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    /// Not seen before; apply it.
    Fresh,
    /// Same epoch, already-applied sequence number; skip silently.
    Duplicate,
    /// Belongs to a superseded epoch; discard.
    Stale,
}

/// One ticket's delivery cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub requirement_text: String,
    pub acceptance_criteria: Vec<String>,
    pub constraints: Vec<String>,
    /// Key into the configured project table; the project working tree is
    /// exclusively owned by this item while it is active.
    pub project: String,
    pub phase: Phase,
    pub attempts: AttemptCounters,
    pub escalation_reason: Option<EscalationReason>,
    /// Phase that escalated, so resume can default to it.
    pub escalated_from: Option<Phase>,
    /// Snapshot reference captured at the GREEN boundary, for rollback.
    pub green_snapshot: Option<String>,
    /// Test names present when RED was validated; GREEN and REFACTOR must
    /// keep covering this set.
    pub red_test_names: Vec<String>,
    /// Per-stream high-water mark `(epoch, seq)` of applied signals.
    pub applied: BTreeMap<String, (u64, u64)>,
    pub trail: Vec<TransitionRecord>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Move to `to`, recording the trail entry. Refuses illegal edges.
    pub fn transition(&mut self, to: Phase, trigger: impl Into<String>) -> Result<(), TransitionError> {
        if !self.phase.can_transition_to(to) {
            return Err(TransitionError {
                from: self.phase,
                to,
            });
        }
        if to == Phase::Escalated {
            self.escalated_from = Some(self.phase);
        }
        self.trail.push(TransitionRecord {
            timestamp: Utc::now(),
            from: self.phase,
            to,
            trigger: trigger.into(),
        });
        self.phase = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Count one attempt in the current phase; returns the new count.
    pub fn record_attempt(&mut self) -> u32 {
        self.updated_at = Utc::now();
        self.attempts.bump(self.phase)
    }

    /// Classify a signal against the applied high-water marks. The caller
    /// applies `Fresh` signals and then calls [`WorkItem::mark_applied`].
    pub fn signal_disposition(&self, signal: &Signal) -> SignalDisposition {
        match self.applied.get(&signal.stream) {
            None => SignalDisposition::Fresh,
            Some((epoch, seq)) => {
                if signal.epoch < *epoch {
                    SignalDisposition::Stale
                } else if signal.epoch == *epoch && signal.seq <= *seq {
                    SignalDisposition::Duplicate
                } else {
                    SignalDisposition::Fresh
                }
            }
        }
    }

    pub fn mark_applied(&mut self, signal: &Signal) {
        self.applied
            .insert(signal.stream.clone(), (signal.epoch, signal.seq));
    }

    /// Human resume: reset attempt counters, clear the escalation, and
    /// re-enter `target` (default: the phase that escalated; items frozen
    /// at intake restart in RED).
    pub fn resume(&mut self, target: Option<Phase>) -> Result<Phase, TransitionError> {
        let to = target
            .or_else(|| self.escalated_from.filter(Phase::is_working))
            .unwrap_or(Phase::Red);
        self.transition(to, "resume")?;
        self.attempts = AttemptCounters::default();
        self.escalation_reason = None;
        self.escalated_from = None;
        Ok(to)
    }

    /// Validate that the recorded trail is a legal path through the graph.
    pub fn trail_is_valid(&self) -> bool {
        let mut current = Phase::Queued;
        for record in &self.trail {
            if record.from != current || !record.from.can_transition_to(record.to) {
                return false;
            }
            current = record.to;
        }
        current == self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalKind;

    pub(crate) fn make_item() -> WorkItem {
        WorkItem {
            id: "TCK-1".into(),
            title: "Trace ids on responses".into(),
            requirement_text: "Responses carry a trace id".into(),
            acceptance_criteria: vec!["returns 200".into(), "trace id matches pattern".into()],
            constraints: vec![],
            project: "api".into(),
            phase: Phase::Queued,
            attempts: AttemptCounters::default(),
            escalation_reason: None,
            escalated_from: None,
            green_snapshot: None,
            red_test_names: vec![],
            applied: BTreeMap::new(),
            trail: vec![],
            cancel_requested: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn signal(stream: &str, offset: u64, seq: u64, epoch: u64) -> Signal {
        Signal::new(stream, offset, seq, epoch, SignalKind::ServerReady { port: 3000 })
    }

    #[test]
    fn test_happy_path_edges_are_legal() {
        let mut item = make_item();
        item.transition(Phase::Red, "intake").unwrap();
        item.transition(Phase::Green, "s1").unwrap();
        item.transition(Phase::Refactor, "s2").unwrap();
        item.transition(Phase::Review, "s3").unwrap();
        item.transition(Phase::Done, "s4").unwrap();
        assert!(item.trail_is_valid());
        assert!(item.phase.is_terminal());
    }

    #[test]
    fn test_illegal_edge_is_rejected_and_not_recorded() {
        let mut item = make_item();
        let err = item.transition(Phase::Done, "nope").unwrap_err();
        assert_eq!(err.from, Phase::Queued);
        assert_eq!(err.to, Phase::Done);
        assert!(item.trail.is_empty());
        assert_eq!(item.phase, Phase::Queued);
    }

    #[test]
    fn test_red_cannot_skip_to_refactor() {
        let mut item = make_item();
        item.transition(Phase::Red, "intake").unwrap();
        assert!(item.transition(Phase::Refactor, "skip").is_err());
    }

    #[test]
    fn test_review_can_bounce_back_to_refactor() {
        let mut item = make_item();
        item.transition(Phase::Red, "intake").unwrap();
        item.transition(Phase::Green, "s").unwrap();
        item.transition(Phase::Refactor, "s").unwrap();
        item.transition(Phase::Review, "s").unwrap();
        item.transition(Phase::Refactor, "review issues").unwrap();
        assert!(item.trail_is_valid());
    }

    #[test]
    fn test_attempts_are_monotonic_and_reset_only_by_resume() {
        let mut item = make_item();
        item.transition(Phase::Red, "intake").unwrap();
        assert_eq!(item.record_attempt(), 1);
        assert_eq!(item.record_attempt(), 2);
        assert_eq!(item.attempts.get(Phase::Red), 2);

        item.transition(Phase::Escalated, "budget").unwrap();
        assert_eq!(item.attempts.get(Phase::Red), 2);
        assert_eq!(item.escalated_from, Some(Phase::Red));

        let resumed_to = item.resume(None).unwrap();
        assert_eq!(resumed_to, Phase::Red);
        assert_eq!(item.attempts, AttemptCounters::default());
        assert!(item.escalation_reason.is_none());
    }

    #[test]
    fn test_resume_honors_explicit_target_phase() {
        let mut item = make_item();
        item.transition(Phase::Red, "intake").unwrap();
        item.transition(Phase::Green, "s").unwrap();
        item.transition(Phase::Escalated, "budget").unwrap();
        let to = item.resume(Some(Phase::Red)).unwrap();
        assert_eq!(to, Phase::Red);
        assert_eq!(item.phase, Phase::Red);
        assert!(item.trail_is_valid());
    }

    #[test]
    fn test_signal_disposition_fresh_duplicate_stale() {
        let mut item = make_item();
        let first = signal("api.test-output", 100, 1, 1);
        assert_eq!(item.signal_disposition(&first), SignalDisposition::Fresh);
        item.mark_applied(&first);

        // Same epoch, same seq: duplicate (replay after crash).
        assert_eq!(item.signal_disposition(&first), SignalDisposition::Duplicate);

        // Same epoch, later seq: fresh.
        let later = signal("api.test-output", 220, 2, 1);
        assert_eq!(item.signal_disposition(&later), SignalDisposition::Fresh);
        item.mark_applied(&later);

        // Older epoch: stale, belongs to a superseded process handle.
        let stale = signal("api.test-output", 900, 9, 0);
        assert_eq!(item.signal_disposition(&stale), SignalDisposition::Stale);

        // New epoch after restart: fresh even with a low seq.
        let restarted = signal("api.test-output", 10, 1, 2);
        assert_eq!(item.signal_disposition(&restarted), SignalDisposition::Fresh);
    }

    #[test]
    fn test_trail_validity_detects_tampering() {
        let mut item = make_item();
        item.transition(Phase::Red, "intake").unwrap();
        item.trail.push(TransitionRecord {
            timestamp: Utc::now(),
            from: Phase::Red,
            to: Phase::Done,
            trigger: "forged".into(),
        });
        assert!(!item.trail_is_valid());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut item = make_item();
        item.transition(Phase::Red, "intake").unwrap();
        item.record_attempt();
        let json = serde_json::to_string_pretty(&item).unwrap();
        let parsed: WorkItem = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.phase, Phase::Red);
        assert_eq!(parsed.attempts.red, 1);
        assert_eq!(parsed.trail.len(), 1);
    }
}
