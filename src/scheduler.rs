//! The attention-window scheduler.
//!
//! One window owns the queue for at most the unattended budget. Items on
//! distinct projects run concurrently; a project's working tree is only
//! ever touched by one item at a time. The scheduler itself never fails on
//! an item failure: every ending, good or bad, becomes a line in the
//! hand-off report.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::machine::{ControlFlags, MachineOutcome};
use crate::policy::{EscalationReason, EscalationRecord};
use crate::store::StateStore;
use crate::workitem::{Phase, WorkItem};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Drives one work item to a resting state. The production driver wires a
/// phase machine to the project's supervisor and tailers; tests substitute
/// scripted drivers.
#[async_trait]
pub trait ItemDriver: Send + Sync {
    async fn drive(
        &self,
        item: &mut WorkItem,
        control: &mut watch::Receiver<ControlFlags>,
    ) -> Result<MachineOutcome>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationLine {
    pub id: String,
    pub reason: EscalationReason,
}

/// What the operator reads when the window closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffReport {
    pub window_id: String,
    pub started_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    /// Summed per-item autonomous working time. Two items that each worked
    /// an hour in parallel report two hours here.
    pub elapsed_autonomous_secs: u64,
    pub completed: Vec<String>,
    pub escalations: Vec<EscalationLine>,
    pub aborted: Vec<String>,
    pub still_queued: Vec<String>,
}

struct DriverExit {
    project: String,
    item: WorkItem,
    outcome: Result<MachineOutcome>,
    active: Duration,
}

pub struct Scheduler {
    store: StateStore,
    driver: Arc<dyn ItemDriver>,
    budget: Duration,
    window_id: String,
}

impl Scheduler {
    pub fn new(
        store: StateStore,
        driver: Arc<dyn ItemDriver>,
        budget: Duration,
        window_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            driver,
            budget,
            window_id: window_id.into(),
        }
    }

    /// Run the window over the persisted queue until exhaustion, budget
    /// expiry, or operator pause. Returns the persisted hand-off report.
    pub async fn run(
        &self,
        control: &mut watch::Receiver<ControlFlags>,
    ) -> Result<HandoffReport> {
        let started_at = Utc::now();
        let window_start = Instant::now();
        let mut queue = self.store.load_queue()?;
        info!(window = %self.window_id, queued = queue.len(), budget_secs = self.budget.as_secs(), "attention window opened");

        let mut elapsed_autonomous = Duration::ZERO;
        let mut completed = Vec::new();
        let mut escalations = Vec::new();
        let mut aborted = Vec::new();
        let mut paused_items: Vec<String> = Vec::new();

        // One control channel per in-flight item so cancel can be targeted.
        let mut active: HashMap<String, (String, watch::Sender<ControlFlags>)> = HashMap::new();
        let mut join_set: JoinSet<DriverExit> = JoinSet::new();
        let mut budget_expired = false;
        let mut paused = false;
        let mut operator_gone = false;

        loop {
            let flags = *control.borrow();
            paused = paused || flags.pause;
            if !budget_expired && window_start.elapsed() >= self.budget {
                budget_expired = true;
                warn!(window = %self.window_id, "unattended budget expired");
                // In-flight items stop at their next safe checkpoint.
                for (_, tx) in active.values() {
                    let _ = tx.send(ControlFlags {
                        pause: true,
                        cancel: false,
                    });
                }
            }

            if !paused && !budget_expired {
                self.launch_eligible(&mut queue, &mut active, &mut join_set)?;
            }
            if paused {
                for (_, tx) in active.values() {
                    let _ = tx.send(ControlFlags {
                        pause: true,
                        cancel: false,
                    });
                }
            }

            if join_set.is_empty() {
                if queue.is_empty() || paused || budget_expired {
                    break;
                }
                // Queue non-empty but nothing launchable: all remaining
                // items share a busy project. Cannot happen with an empty
                // active map, so fall through to the wait.
            }

            tokio::select! {
                Some(joined) = join_set.join_next(), if !join_set.is_empty() => {
                    let exit = joined.map_err(|e| anyhow::anyhow!("item driver panicked: {e}"))?;
                    active.remove(&exit.project);
                    elapsed_autonomous += exit.active;
                    self.settle(exit, &mut completed, &mut escalations, &mut aborted, &mut paused_items, &mut queue)?;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    self.poll_operator_flags(&mut paused, &active)?;
                }
                changed = control.changed(), if !operator_gone => {
                    if changed.is_err() {
                        operator_gone = true;
                    }
                }
            }
        }

        if budget_expired {
            self.escalate_remaining(&mut queue, &mut escalations)?;
        }

        let mut still_queued: Vec<String> = paused_items;
        still_queued.extend(queue.iter().cloned());
        // Paused items go back to the front, keeping their relative order.
        for id in still_queued.iter().rev() {
            if !queue.contains(id) {
                queue.push_front(id.clone());
            }
        }
        self.store.save_queue(&queue)?;

        let report = HandoffReport {
            window_id: self.window_id.clone(),
            started_at,
            closed_at: Utc::now(),
            elapsed_autonomous_secs: elapsed_autonomous.as_secs(),
            completed,
            escalations,
            aborted,
            still_queued,
        };
        self.store.save_report(&self.window_id, &report)?;
        info!(
            window = %self.window_id,
            completed = report.completed.len(),
            escalated = report.escalations.len(),
            "attention window closed"
        );
        Ok(report)
    }

    /// Start every queued item whose project is idle.
    fn launch_eligible(
        &self,
        queue: &mut VecDeque<String>,
        active: &mut HashMap<String, (String, watch::Sender<ControlFlags>)>,
        join_set: &mut JoinSet<DriverExit>,
    ) -> Result<()> {
        let mut deferred = VecDeque::new();
        while let Some(id) = queue.pop_front() {
            let item = match self.store.load_work_item(&id) {
                Ok(item) => item,
                Err(err) => {
                    warn!(item = %id, error = %err, "dropping unloadable queue entry");
                    continue;
                }
            };
            if item.phase.is_terminal() || item.phase == Phase::Escalated {
                continue;
            }
            if active.contains_key(&item.project) {
                deferred.push_back(id);
                continue;
            }
            let (tx, mut rx) = watch::channel(ControlFlags::default());
            if item.cancel_requested {
                let _ = tx.send(ControlFlags {
                    pause: false,
                    cancel: true,
                });
            }
            active.insert(item.project.clone(), (id.clone(), tx));
            let driver = Arc::clone(&self.driver);
            let project = item.project.clone();
            info!(item = %id, project = %project, "item started");
            join_set.spawn(async move {
                let begun = Instant::now();
                let mut item = item;
                let outcome = driver.drive(&mut item, &mut rx).await;
                DriverExit {
                    project,
                    item,
                    outcome,
                    active: begun.elapsed(),
                }
            });
        }
        *queue = deferred;
        self.store.save_queue(queue)?;
        Ok(())
    }

    /// Account one finished driver into the report buckets.
    fn settle(
        &self,
        exit: DriverExit,
        completed: &mut Vec<String>,
        escalations: &mut Vec<EscalationLine>,
        aborted: &mut Vec<String>,
        paused_items: &mut Vec<String>,
        queue: &mut VecDeque<String>,
    ) -> Result<()> {
        let DriverExit {
            project,
            mut item,
            outcome,
            ..
        } = exit;
        let id = item.id.clone();
        match outcome {
            Ok(MachineOutcome::Done) => completed.push(id),
            Ok(MachineOutcome::Escalated(reason)) => {
                escalations.push(EscalationLine { id, reason })
            }
            Ok(MachineOutcome::Aborted) => {
                aborted.push(id);
                self.strand_project_queue(&project, queue, aborted)?;
            }
            Ok(MachineOutcome::Paused) => paused_items.push(id),
            Err(err) => {
                // Driver failure is an environment failure: the machine
                // never got to commit, so the abort is persisted here.
                warn!(item = %id, error = %err, "item driver failed");
                if !item.phase.is_terminal()
                    && item.transition(Phase::Aborted, "driver failure").is_ok()
                {
                    if let Some(record) = item.trail.last() {
                        self.store.append_trail(&id, record)?;
                    }
                    self.store.save_work_item(&item)?;
                }
                aborted.push(id);
                self.strand_project_queue(&project, queue, aborted)?;
            }
        }
        Ok(())
    }

    /// Environment failure poisons the rest of the project's queue: every
    /// queued item on `project` is aborted durably and reported.
    fn strand_project_queue(
        &self,
        project: &str,
        queue: &mut VecDeque<String>,
        aborted: &mut Vec<String>,
    ) -> Result<()> {
        let stranded: Vec<String> = queue
            .iter()
            .filter(|qid| {
                self.store
                    .load_work_item(qid)
                    .map(|i| i.project == project)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for qid in stranded {
            queue.retain(|q| q != &qid);
            if let Ok(mut stranded_item) = self.store.load_work_item(&qid) {
                if stranded_item
                    .transition(Phase::Aborted, "project environment failed")
                    .is_ok()
                {
                    if let Some(record) = stranded_item.trail.last() {
                        self.store.append_trail(&qid, record)?;
                    }
                    self.store.save_work_item(&stranded_item)?;
                }
            }
            aborted.push(qid);
        }
        Ok(())
    }

    /// Operator steering arrives through the store from other processes.
    fn poll_operator_flags(
        &self,
        paused: &mut bool,
        active: &HashMap<String, (String, watch::Sender<ControlFlags>)>,
    ) -> Result<()> {
        if let Some(session) = self.store.load_session()? {
            if session.pause_requested {
                *paused = true;
            }
        }
        for (id, tx) in active.values() {
            if let Ok(item) = self.store.load_work_item(id) {
                if item.cancel_requested {
                    let _ = tx.send(ControlFlags {
                        pause: false,
                        cancel: true,
                    });
                }
            }
        }
        Ok(())
    }

    /// Budget expiry: items never started this window freeze for the human.
    fn escalate_remaining(
        &self,
        queue: &mut VecDeque<String>,
        escalations: &mut Vec<EscalationLine>,
    ) -> Result<()> {
        while let Some(id) = queue.pop_front() {
            let Ok(mut item) = self.store.load_work_item(&id) else {
                continue;
            };
            if item.phase.is_terminal() {
                continue;
            }
            let reason = EscalationReason::AttentionBudgetExpired;
            item.escalation_reason = Some(reason);
            if item.transition(Phase::Escalated, "budget").is_ok() {
                if let Some(record) = item.trail.last() {
                    self.store.append_trail(&id, record)?;
                }
                self.store.save_work_item(&item)?;
                self.store.save_escalation(&EscalationRecord::new(
                    id.clone(),
                    reason,
                    Phase::Queued,
                    None,
                    Vec::new(),
                ))?;
                escalations.push(EscalationLine { id, reason });
            }
        }
        Ok(())
    }
}
