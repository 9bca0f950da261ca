//! Open an attention window over the queue.
//!
//! This is where the pieces get wired per project: supervisor for the test
//! watcher and dev server, one tailer per stream feeding the item's signal
//! queue, a crash forwarder, and the phase machine on top.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use vigil::actors::{
    CodeChangeActor, CommandChangeActor, CommandReviewActor, ReviewActor, ScriptedChangeActor,
    ScriptedReviewActor,
};
use vigil::config::Config;
use vigil::errors::{SessionError, StoreError};
use vigil::machine::{ControlFlags, MachineOutcome, PhaseMachine};
use vigil::scheduler::{HandoffReport, ItemDriver, Scheduler};
use vigil::signals::{Signal, SignalKind};
use vigil::snapshot::GitSnapshotter;
use vigil::store::{Session, StateStore};
use vigil::supervisor::{ProcessSupervisor, RestartPolicy};
use vigil::tailer::LogTailer;
use vigil::workitem::WorkItem;

const TAIL_INTERVAL: Duration = Duration::from_millis(250);
const SIGNAL_QUEUE_DEPTH: usize = 256;

pub async fn cmd_run(config: Config, budget: Duration) -> Result<()> {
    config.ensure_directories()?;
    let store = StateStore::new(&config);
    let _lock = match store.acquire_lock() {
        Ok(lock) => lock,
        Err(StoreError::Locked) => {
            let started_at = store
                .load_session()?
                .map(|s| s.started_at.to_rfc3339())
                .unwrap_or_else(|| "unknown".into());
            return Err(SessionError::AlreadyActive { started_at }.into());
        }
        Err(err) => return Err(err.into()),
    };

    // A leftover session document with the lock free means the previous
    // window died; recovery below picks its items back up.
    if store.load_session()?.is_some() {
        info!("found stale session, recovering");
    }
    let session = Session::new(budget.as_secs());
    store.save_session(&session)?;

    let (items, queue) = store.recover()?;
    info!(items = items.len(), queued = queue.len(), "state recovered");

    let driver = Arc::new(ProjectItemDriver {
        config: config.clone(),
        store: store.clone(),
    });
    let scheduler = Scheduler::new(store.clone(), driver, budget, session.id.to_string());
    let (_control_tx, mut control_rx) = watch::channel(ControlFlags::default());

    let result = scheduler.run(&mut control_rx).await;
    store.clear_session()?;
    let report = result?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &HandoffReport) {
    println!();
    println!(
        "Attention window {} closed after {}m autonomous work",
        report.window_id,
        report.elapsed_autonomous_secs / 60
    );
    if !report.completed.is_empty() {
        println!(
            "  {} completed: {}",
            console::style("ok").green().bold(),
            report.completed.join(", ")
        );
    }
    for line in &report.escalations {
        println!(
            "  {} escalated: {} ({})",
            console::style("!").yellow().bold(),
            line.id,
            line.reason
        );
    }
    if !report.aborted.is_empty() {
        println!(
            "  {} aborted: {}",
            console::style("x").red().bold(),
            report.aborted.join(", ")
        );
    }
    if !report.still_queued.is_empty() {
        println!("  still queued: {}", report.still_queued.join(", "));
    }
    println!();
}

/// Production driver: supervises the project's processes and runs the
/// phase machine against their log streams.
struct ProjectItemDriver {
    config: Config,
    store: StateStore,
}

#[async_trait]
impl ItemDriver for ProjectItemDriver {
    async fn drive(
        &self,
        item: &mut WorkItem,
        control: &mut watch::Receiver<ControlFlags>,
    ) -> Result<MachineOutcome> {
        let project = self
            .config
            .projects
            .get(&item.project)
            .cloned()
            .with_context(|| format!("Project '{}' is not configured", item.project))?;

        let (supervisor, mut events) = ProcessSupervisor::new();
        let supervisor = Arc::new(supervisor);

        let test_stream = format!("{}.test-output", item.project);
        let test_log = self.config.stream_log_path(&item.project, "test-output");
        supervisor
            .start(
                &test_stream,
                &project.test_command,
                project.root.clone(),
                test_log.clone(),
                RestartPolicy::Never,
            )
            .await?;

        let (tx, mut rx) = mpsc::channel(SIGNAL_QUEUE_DEPTH);
        let mut tail_tasks = Vec::new();
        tail_tasks.push(tokio::spawn(
            LogTailer::new(test_stream.clone(), test_log, &self.config.cursors_dir)?
                .run(tx.clone(), TAIL_INTERVAL),
        ));

        if let Some(server_command) = &project.server_command {
            let server_stream = format!("{}.dev-server", item.project);
            let server_log = self.config.stream_log_path(&item.project, "dev-server");
            supervisor
                .start(
                    &server_stream,
                    server_command,
                    project.root.clone(),
                    server_log.clone(),
                    RestartPolicy::Backoff {
                        max_restarts: 3,
                        base_delay: Duration::from_secs(2),
                    },
                )
                .await?;
            tail_tasks.push(tokio::spawn(
                LogTailer::new(server_stream, server_log, &self.config.cursors_dir)?
                    .run(tx.clone(), TAIL_INTERVAL),
            ));
        }

        // Unexpected exits become crash signals on their own stream.
        let crash_tx = tx.clone();
        tokio::spawn(async move {
            let mut seq = 0u64;
            while let Some(event) = events.recv().await {
                seq += 1;
                let signal = Signal::new(
                    format!("{}.crash", event.name),
                    seq,
                    seq,
                    event.epoch,
                    SignalKind::ProcessCrashed {
                        exit_code: event.exit_code,
                    },
                );
                if crash_tx.send(signal).await.is_err() {
                    return;
                }
            }
        });
        drop(tx);

        let change_actor: Arc<dyn CodeChangeActor> = match &project.change_command {
            Some(command) => Arc::new(CommandChangeActor::new(command, project.root.clone())),
            None => {
                warn!(project = %item.project, "no change_command configured; phases will wait on existing watchers only");
                Arc::new(ScriptedChangeActor::new())
            }
        };
        let review_actor: Arc<dyn ReviewActor> = match &project.review_command {
            Some(command) => Arc::new(CommandReviewActor::new(command, project.root.clone())),
            None => Arc::new(ScriptedReviewActor::new(Vec::new())),
        };
        let snapshotter = Arc::new(GitSnapshotter::new(&project.root)?);

        let mut machine = PhaseMachine::new(
            self.config.clone(),
            self.store.clone(),
            snapshotter,
            change_actor,
            review_actor,
        );
        let outcome = machine.run(item, &mut rx, control).await;

        supervisor.shutdown().await;
        drop(rx);
        for task in tail_tasks {
            task.abort();
        }
        outcome
    }
}
