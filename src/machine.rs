//! The phase state machine.
//!
//! Drives one WorkItem through RED, GREEN, REFACTOR, and REVIEW on log
//! evidence alone. Each working-phase attempt is: invoke the change actor,
//! block for the next decisive signal, evaluate it against the phase's
//! validity rule, then either advance, count a failed attempt, or hand the
//! item to the escalation policy. Every transition is persisted before the
//! machine proceeds, so a crash never loses an edge.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::actors::{CodeChangeActor, ReviewActor, SignalContext};
use crate::config::Config;
use crate::policy::{self, EscalationReason, EscalationRecord, Verdict};
use crate::signals::{Signal, SignalKind, TestRunSummary};
use crate::snapshot::Snapshotter;
use crate::store::StateStore;
use crate::workitem::{Phase, SignalDisposition, WorkItem};

const RECENT_SIGNALS: usize = 20;

/// Operator steering, observed only between atomic steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlFlags {
    pub pause: bool,
    pub cancel: bool,
}

/// How one run of the machine ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineOutcome {
    Done,
    Escalated(EscalationReason),
    Aborted,
    /// Operator pause; the item keeps its phase and can be rerun.
    Paused,
}

/// Decisive evidence that ends one wait.
enum Decisive {
    Summary(TestRunSummary, String),
    CompileFailed(String),
    Crashed(Signal),
    Timeout(String),
    Interrupted,
}

pub struct PhaseMachine {
    config: Config,
    store: StateStore,
    snapshotter: Arc<dyn Snapshotter>,
    change_actor: Arc<dyn CodeChangeActor>,
    review_actor: Arc<dyn ReviewActor>,
    recent: Vec<String>,
    last_summary: Option<TestRunSummary>,
    timer_seq: u64,
    review_seq: u64,
}

impl PhaseMachine {
    pub fn new(
        config: Config,
        store: StateStore,
        snapshotter: Arc<dyn Snapshotter>,
        change_actor: Arc<dyn CodeChangeActor>,
        review_actor: Arc<dyn ReviewActor>,
    ) -> Self {
        Self {
            config,
            store,
            snapshotter,
            change_actor,
            review_actor,
            recent: Vec::new(),
            last_summary: None,
            timer_seq: 0,
            review_seq: 0,
        }
    }

    /// Drive `item` until it reaches a resting state. Signals arrive on
    /// `signals` in stream order; `control` carries operator steering.
    pub async fn run(
        &mut self,
        item: &mut WorkItem,
        signals: &mut mpsc::Receiver<Signal>,
        control: &mut watch::Receiver<ControlFlags>,
    ) -> Result<MachineOutcome> {
        loop {
            let flags = *control.borrow();
            if flags.cancel || item.cancel_requested {
                self.commit(item, Phase::Aborted, "cancel")?;
                return Ok(MachineOutcome::Aborted);
            }
            if flags.pause {
                self.store.save_work_item(item)?;
                return Ok(MachineOutcome::Paused);
            }

            match item.phase {
                Phase::Queued => {
                    self.commit(item, Phase::Red, "intake")?;
                }
                Phase::Red => {
                    if let Some(outcome) = self.attempt_red(item, signals, control).await? {
                        return Ok(outcome);
                    }
                }
                Phase::Green => {
                    if let Some(outcome) = self.attempt_green(item, signals, control).await? {
                        return Ok(outcome);
                    }
                }
                Phase::Refactor => {
                    if let Some(outcome) = self.attempt_refactor(item, signals, control).await? {
                        return Ok(outcome);
                    }
                }
                Phase::Review => {
                    if let Some(outcome) = self.attempt_review(item, signals, control).await? {
                        return Ok(outcome);
                    }
                }
                Phase::Done => return Ok(MachineOutcome::Done),
                Phase::Escalated => {
                    let reason = item
                        .escalation_reason
                        .unwrap_or(EscalationReason::AmbiguousRequirement);
                    return Ok(MachineOutcome::Escalated(reason));
                }
                Phase::Aborted => return Ok(MachineOutcome::Aborted),
            }
        }
    }

    /// RED: valid evidence is a test run with at least one failure and no
    /// compile error. A fully passing run means the new test does not yet
    /// exercise anything unimplemented, which is a failed attempt.
    async fn attempt_red(
        &mut self,
        item: &mut WorkItem,
        signals: &mut mpsc::Receiver<Signal>,
        control: &mut watch::Receiver<ControlFlags>,
    ) -> Result<Option<MachineOutcome>> {
        self.invoke_change_actor(item).await?;
        match self.next_decisive(item, signals, control).await? {
            Decisive::Summary(summary, key) if summary.failed > 0 => {
                item.red_test_names = summary.test_names.clone();
                self.last_summary = Some(summary);
                self.commit(item, Phase::Green, key)?;
                Ok(None)
            }
            Decisive::Summary(summary, _) => {
                debug!(item = %item.id, "red attempt produced an all-passing run");
                self.last_summary = Some(summary);
                self.count_attempt(item, None)
            }
            Decisive::CompileFailed(_) => self.count_attempt(item, None),
            Decisive::Timeout(key) => self.count_timeout(item, key),
            Decisive::Crashed(signal) => self.abort(item, signal).map(Some),
            Decisive::Interrupted => Ok(Some(MachineOutcome::Paused)),
        }
    }

    /// GREEN: all tests pass and the RED baseline is still present. A run
    /// that "passes" by dropping baseline tests is a failed attempt.
    async fn attempt_green(
        &mut self,
        item: &mut WorkItem,
        signals: &mut mpsc::Receiver<Signal>,
        control: &mut watch::Receiver<ControlFlags>,
    ) -> Result<Option<MachineOutcome>> {
        self.invoke_change_actor(item).await?;
        match self.next_decisive(item, signals, control).await? {
            Decisive::Summary(summary, key)
                if summary.is_green() && summary.covers(&item.red_test_names) =>
            {
                let reference = self
                    .snapshotter
                    .capture(&format!("green {}", item.id))
                    .context("Failed to capture green snapshot")?;
                item.green_snapshot = Some(reference);
                self.last_summary = Some(summary);
                self.commit(item, Phase::Refactor, key)?;
                Ok(None)
            }
            Decisive::Summary(summary, _) => {
                if summary.is_green() {
                    warn!(item = %item.id, "baseline test missing from passing run");
                }
                self.last_summary = Some(summary);
                self.count_attempt(item, None)
            }
            Decisive::CompileFailed(_) => self.count_attempt(item, None),
            Decisive::Timeout(key) => self.count_timeout(item, key),
            Decisive::Crashed(signal) => self.abort(item, signal).map(Some),
            Decisive::Interrupted => Ok(Some(MachineOutcome::Paused)),
        }
    }

    /// REFACTOR: a regression rolls the tree back to the green snapshot and
    /// costs an attempt. A clean pass goes to review; blocking issues cost
    /// an attempt and stay here.
    async fn attempt_refactor(
        &mut self,
        item: &mut WorkItem,
        signals: &mut mpsc::Receiver<Signal>,
        control: &mut watch::Receiver<ControlFlags>,
    ) -> Result<Option<MachineOutcome>> {
        self.invoke_change_actor(item).await?;
        match self.next_decisive(item, signals, control).await? {
            Decisive::Summary(summary, _)
                if summary.is_green() && summary.covers(&item.red_test_names) =>
            {
                self.last_summary = Some(summary);
                let changeset = item.green_snapshot.clone().unwrap_or_default();
                let review = self
                    .review_actor
                    .review(&changeset)
                    .await
                    .context("Review actor failed")?;
                let review_signal = self.wrap_review(review.issues.clone());
                let key = review_signal.key();
                self.observe(item, &review_signal);

                if review.blocking_issues(self.config.severity_threshold).is_empty() {
                    self.commit(item, Phase::Review, key)?;
                    Ok(None)
                } else {
                    info!(item = %item.id, issues = review.issues.len(), "review sent item back");
                    self.count_attempt(item, None)
                }
            }
            Decisive::Summary(summary, key) => {
                self.last_summary = Some(summary);
                if let Some(reference) = item.green_snapshot.clone() {
                    self.snapshotter
                        .rollback(&reference)
                        .context("Failed to roll back to green snapshot")?;
                    info!(item = %item.id, snapshot = %reference, trigger = %key, "regression rolled back");
                }
                self.count_attempt(item, None)
            }
            Decisive::CompileFailed(_) => {
                if let Some(reference) = item.green_snapshot.clone() {
                    self.snapshotter
                        .rollback(&reference)
                        .context("Failed to roll back to green snapshot")?;
                }
                self.count_attempt(item, None)
            }
            Decisive::Timeout(key) => self.count_timeout(item, key),
            Decisive::Crashed(signal) => self.abort(item, signal).map(Some),
            Decisive::Interrupted => Ok(Some(MachineOutcome::Paused)),
        }
    }

    /// REVIEW: every acceptance criterion must map to a passing tagged test
    /// (`[ac: <criterion>]` in the test name) in the latest run.
    async fn attempt_review(
        &mut self,
        item: &mut WorkItem,
        signals: &mut mpsc::Receiver<Signal>,
        control: &mut watch::Receiver<ControlFlags>,
    ) -> Result<Option<MachineOutcome>> {
        if let Some(summary) = &self.last_summary {
            let unmet = unmet_criteria(&item.acceptance_criteria, summary);
            if unmet.is_empty() {
                self.commit(item, Phase::Done, "acceptance criteria satisfied")?;
                return Ok(Some(MachineOutcome::Done));
            }
            debug!(item = %item.id, ?unmet, "acceptance criteria not yet covered");
        }

        // Bounded: each uncovered-criteria round costs a review attempt.
        if let Some(outcome) = self.count_attempt(item, None)? {
            return Ok(Some(outcome));
        }
        self.invoke_change_actor(item).await?;
        match self.next_decisive(item, signals, control).await? {
            Decisive::Summary(summary, _) => {
                self.last_summary = Some(summary);
                Ok(None)
            }
            Decisive::CompileFailed(_) => Ok(None),
            Decisive::Timeout(key) => self.count_timeout(item, key),
            Decisive::Crashed(signal) => self.abort(item, signal).map(Some),
            Decisive::Interrupted => Ok(Some(MachineOutcome::Paused)),
        }
    }

    /// Block for the next signal that settles the current attempt,
    /// discarding stale and duplicate deliveries along the way.
    async fn next_decisive(
        &mut self,
        item: &mut WorkItem,
        signals: &mut mpsc::Receiver<Signal>,
        control: &mut watch::Receiver<ControlFlags>,
    ) -> Result<Decisive> {
        let deadline = Instant::now() + self.config.signal_wait;
        loop {
            let flags = *control.borrow();
            if flags.cancel || flags.pause {
                return Ok(Decisive::Interrupted);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(self.synthesize_timeout(item, self.config.signal_wait));
            }
            tokio::select! {
                maybe = signals.recv() => {
                    let Some(signal) = maybe else {
                        // Every producer is gone; nothing can ever arrive.
                        return Ok(Decisive::Crashed(Signal::new(
                            "supervisor", 0, 0, 0,
                            SignalKind::ProcessCrashed { exit_code: None },
                        )));
                    };
                    match item.signal_disposition(&signal) {
                        SignalDisposition::Stale => {
                            debug!(key = %signal.key(), "discarded stale signal");
                            continue;
                        }
                        SignalDisposition::Duplicate => {
                            debug!(key = %signal.key(), "skipped duplicate signal");
                            continue;
                        }
                        SignalDisposition::Fresh => {}
                    }
                    self.observe(item, &signal);
                    let key = signal.key();
                    match signal.kind {
                        SignalKind::TestRunSummary(summary) => {
                            return Ok(Decisive::Summary(summary, key));
                        }
                        SignalKind::CompileStatus { ok: false, .. } => {
                            return Ok(Decisive::CompileFailed(key));
                        }
                        SignalKind::ProcessCrashed { .. } => {
                            return Ok(Decisive::Crashed(signal));
                        }
                        // Informational; keep waiting.
                        SignalKind::CompileStatus { ok: true, .. }
                        | SignalKind::ServerReady { .. }
                        | SignalKind::RuntimeError { .. }
                        | SignalKind::Timeout { .. }
                        | SignalKind::ReviewCompleted { .. } => continue,
                    }
                }
                _ = control.changed() => continue,
                _ = tokio::time::sleep(remaining) => {
                    return Ok(self.synthesize_timeout(item, self.config.signal_wait));
                }
            }
        }
    }

    fn synthesize_timeout(&mut self, item: &mut WorkItem, waited: Duration) -> Decisive {
        self.timer_seq += 1;
        let signal = Signal::new(
            "timer",
            self.timer_seq,
            self.timer_seq,
            0,
            SignalKind::Timeout {
                waited_secs: waited.as_secs(),
            },
        );
        let key = signal.key();
        self.observe(item, &signal);
        Decisive::Timeout(key)
    }

    /// Wrap a review result in the signal envelope so the trail and recent
    /// excerpt stay uniform.
    fn wrap_review(&mut self, issues: Vec<crate::actors::ReviewIssue>) -> Signal {
        self.review_seq += 1;
        Signal::new(
            "review",
            self.review_seq,
            self.review_seq,
            0,
            SignalKind::ReviewCompleted { issues },
        )
    }

    fn observe(&mut self, item: &mut WorkItem, signal: &Signal) {
        item.mark_applied(signal);
        if self.recent.len() == RECENT_SIGNALS {
            self.recent.remove(0);
        }
        self.recent.push(signal.describe());
    }

    async fn invoke_change_actor(&mut self, item: &WorkItem) -> Result<()> {
        let context = SignalContext {
            recent: self.recent.clone(),
        };
        let outcome = self
            .change_actor
            .apply(item.phase, item, &context)
            .await
            .context("Change actor failed")?;
        debug!(item = %item.id, phase = %item.phase, summary = %outcome.summary, "change actor returned");
        Ok(())
    }

    /// Record a failed attempt and consult the policy. `Some(outcome)` ends
    /// the run; `None` means try again in the same phase.
    fn count_attempt(
        &mut self,
        item: &mut WorkItem,
        trigger: Option<&SignalKind>,
    ) -> Result<Option<MachineOutcome>> {
        let attempts = item.record_attempt();
        let limit = self.config.attempts.for_phase(item.phase);
        match policy::decide(item.phase, attempts, limit, trigger) {
            Verdict::Continue => {
                self.store.save_work_item(item)?;
                Ok(None)
            }
            Verdict::Escalate(reason) => self.escalate(item, reason).map(Some),
            Verdict::Abort => {
                self.commit(item, Phase::Aborted, "environment failure")?;
                Ok(Some(MachineOutcome::Aborted))
            }
        }
    }

    fn count_timeout(&mut self, item: &mut WorkItem, key: String) -> Result<Option<MachineOutcome>> {
        let kind = SignalKind::Timeout {
            waited_secs: self.config.signal_wait.as_secs(),
        };
        debug!(item = %item.id, trigger = %key, "no decisive signal before the wait expired");
        self.count_attempt(item, Some(&kind))
    }

    fn escalate(&mut self, item: &mut WorkItem, reason: EscalationReason) -> Result<MachineOutcome> {
        item.escalation_reason = Some(reason);
        let record = EscalationRecord::new(
            item.id.clone(),
            reason,
            item.phase,
            item.green_snapshot.clone(),
            self.recent.clone(),
        );
        self.store.save_escalation(&record)?;
        self.commit(item, Phase::Escalated, reason.to_string())?;
        warn!(item = %item.id, %reason, "escalated for human attention");
        Ok(MachineOutcome::Escalated(reason))
    }

    fn abort(&mut self, item: &mut WorkItem, signal: Signal) -> Result<MachineOutcome> {
        self.commit(item, Phase::Aborted, signal.key())?;
        warn!(item = %item.id, trigger = %signal.describe(), "aborted on environment failure");
        Ok(MachineOutcome::Aborted)
    }

    /// Transition + persist as one step: trail line first, then document.
    fn commit(&self, item: &mut WorkItem, to: Phase, trigger: impl Into<String>) -> Result<()> {
        item.transition(to, trigger)
            .context("Illegal phase transition")?;
        if let Some(record) = item.trail.last() {
            self.store.append_trail(&item.id, record)?;
        }
        self.store.save_work_item(item)?;
        Ok(())
    }
}

/// Acceptance criteria with no passing `[ac: …]`-tagged test in `summary`.
fn unmet_criteria<'a>(criteria: &'a [String], summary: &TestRunSummary) -> Vec<&'a str> {
    criteria
        .iter()
        .filter(|criterion| {
            let tag = format!("[ac: {criterion}]");
            !summary.test_names.iter().any(|name| {
                name.contains(&tag) && !summary.failure_messages.contains(name)
            })
        })
        .map(String::as_str)
        .collect()
}
