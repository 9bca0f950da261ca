//! Long-lived process supervision.
//!
//! The supervisor owns the test watcher and dev server for each project.
//! It never interprets their output; it appends every line to the durable
//! stream log (where the tailer picks it up) and keeps a small ring buffer
//! of recent lines for escalation context. An unexpected exit is reported
//! on the event channel; whether that aborts the queue is the policy's
//! call, not the supervisor's.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::errors::SupervisorError;

const RING_BUFFER_LINES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Starting,
    Running,
    Crashed { exit_code: Option<i32> },
    Stopped,
}

/// Restart behavior after an unexpected exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    Backoff {
        max_restarts: u32,
        base_delay: Duration,
    },
}

/// Emitted on the supervisor's event channel when a process exits without
/// being stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    pub name: String,
    /// Start-generation of the process that exited.
    pub epoch: u64,
    pub exit_code: Option<i32>,
}

/// Snapshot of one supervised process, safe to hand across tasks.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub name: String,
    pub pid: Option<u32>,
    pub command: String,
    pub cwd: PathBuf,
    pub log_path: PathBuf,
    pub epoch: u64,
    pub status: ProcessStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct Health {
    pub running: bool,
    pub exit_code: Option<i32>,
}

struct ProcInner {
    status: ProcessStatus,
    pid: Option<u32>,
    epoch: u64,
    recent: VecDeque<String>,
}

struct Supervised {
    command: String,
    cwd: PathBuf,
    log_path: PathBuf,
    inner: Mutex<ProcInner>,
    stop_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl Supervised {
    fn handle(&self, name: &str) -> ProcessHandle {
        let inner = self.inner.lock().expect("supervisor mutex poisoned");
        ProcessHandle {
            name: name.to_string(),
            pid: inner.pid,
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            log_path: self.log_path.clone(),
            epoch: inner.epoch,
            status: inner.status,
        }
    }
}

pub struct ProcessSupervisor {
    processes: Mutex<HashMap<String, Arc<Supervised>>>,
    event_tx: mpsc::UnboundedSender<ProcessEvent>,
}

impl ProcessSupervisor {
    /// Build a supervisor plus the channel its exit events arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                processes: Mutex::new(HashMap::new()),
                event_tx,
            },
            event_rx,
        )
    }

    /// Start a named process. Idempotent: if the name is already running,
    /// the existing handle is returned untouched.
    pub async fn start(
        &self,
        name: &str,
        command: &str,
        cwd: PathBuf,
        log_path: PathBuf,
        policy: RestartPolicy,
    ) -> Result<ProcessHandle, SupervisorError> {
        // A restart over a crashed or stopped name supersedes the previous
        // generation, so its in-flight signals stay discernibly stale.
        let mut epoch = 0;
        if let Some(existing) = self.lookup(name) {
            let handle = existing.handle(name);
            if matches!(handle.status, ProcessStatus::Starting | ProcessStatus::Running) {
                return Ok(handle);
            }
            epoch = handle.epoch + 1;
        }

        // Probe-spawn here so a bad command surfaces synchronously instead
        // of as a crash event.
        let mut child = spawn(command, &cwd)?;
        let pid = child.id();

        let log_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|source| SupervisorError::LogOpenFailed {
                path: log_path.clone(),
                source,
            })?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let supervised = Arc::new(Supervised {
            command: command.to_string(),
            cwd: cwd.clone(),
            log_path: log_path.clone(),
            inner: Mutex::new(ProcInner {
                status: ProcessStatus::Running,
                pid,
                epoch,
                recent: VecDeque::with_capacity(RING_BUFFER_LINES),
            }),
            stop_tx,
            stopped: AtomicBool::new(false),
        });

        self.processes
            .lock()
            .expect("supervisor mutex poisoned")
            .insert(name.to_string(), Arc::clone(&supervised));

        info!(process = name, pid, command, "supervised process started");

        tokio::spawn(monitor(
            name.to_string(),
            Arc::clone(&supervised),
            child,
            log_file,
            stop_rx,
            policy,
            self.event_tx.clone(),
        ));

        Ok(supervised.handle(name))
    }

    /// Stop a process deliberately. A stopped exit emits no crash event.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let supervised = self
            .lookup(name)
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))?;
        supervised.stopped.store(true, Ordering::SeqCst);
        let _ = supervised.stop_tx.send(true);
        Ok(())
    }

    pub fn health(&self, name: &str) -> Result<Health, SupervisorError> {
        let supervised = self
            .lookup(name)
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))?;
        let inner = supervised.inner.lock().expect("supervisor mutex poisoned");
        Ok(match inner.status {
            ProcessStatus::Starting | ProcessStatus::Running => Health {
                running: true,
                exit_code: None,
            },
            ProcessStatus::Crashed { exit_code } => Health {
                running: false,
                exit_code,
            },
            ProcessStatus::Stopped => Health {
                running: false,
                exit_code: None,
            },
        })
    }

    /// Most recent output lines, oldest first.
    pub fn recent_lines(&self, name: &str) -> Result<Vec<String>, SupervisorError> {
        let supervised = self
            .lookup(name)
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))?;
        let inner = supervised.inner.lock().expect("supervisor mutex poisoned");
        Ok(inner.recent.iter().cloned().collect())
    }

    pub fn handle(&self, name: &str) -> Result<ProcessHandle, SupervisorError> {
        self.lookup(name)
            .map(|s| s.handle(name))
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))
    }

    /// Stop every supervised process.
    pub async fn shutdown(&self) {
        let names: Vec<String> = {
            let processes = self.processes.lock().expect("supervisor mutex poisoned");
            processes.keys().cloned().collect()
        };
        for name in names {
            let _ = self.stop(&name).await;
        }
    }

    fn lookup(&self, name: &str) -> Option<Arc<Supervised>> {
        self.processes
            .lock()
            .expect("supervisor mutex poisoned")
            .get(name)
            .cloned()
    }
}

fn spawn(command: &str, cwd: &std::path::Path) -> Result<tokio::process::Child, SupervisorError> {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SupervisorError::SpawnFailed {
            command: command.to_string(),
            source,
        })
}

/// Owns the child across restarts: drains output into the log, waits for
/// exit, applies the restart policy, reports unexpected exits.
async fn monitor(
    name: String,
    supervised: Arc<Supervised>,
    mut child: tokio::process::Child,
    mut log_file: tokio::fs::File,
    mut stop_rx: watch::Receiver<bool>,
    policy: RestartPolicy,
    event_tx: mpsc::UnboundedSender<ProcessEvent>,
) {
    let mut restarts: u32 = 0;
    loop {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut out_lines = stdout.map(|s| BufReader::new(s).lines());
        let mut err_lines = stderr.map(|s| BufReader::new(s).lines());

        let exit_code = loop {
            tokio::select! {
                line = next_line(&mut out_lines) => {
                    match line {
                        Some(line) => record_line(&supervised, &mut log_file, &line).await,
                        None => out_lines = None,
                    }
                }
                line = next_line(&mut err_lines) => {
                    match line {
                        Some(line) => record_line(&supervised, &mut log_file, &line).await,
                        None => err_lines = None,
                    }
                }
                status = child.wait() => {
                    // Drain whatever is left in the pipes.
                    if let Some(reader) = &mut out_lines {
                        while let Ok(Some(line)) = reader.next_line().await {
                            record_line(&supervised, &mut log_file, &line).await;
                        }
                    }
                    if let Some(reader) = &mut err_lines {
                        while let Ok(Some(line)) = reader.next_line().await {
                            record_line(&supervised, &mut log_file, &line).await;
                        }
                    }
                    break status.ok().and_then(|s| s.code());
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        let _ = child.kill().await;
                        let mut inner = supervised.inner.lock().expect("supervisor mutex poisoned");
                        inner.status = ProcessStatus::Stopped;
                        inner.pid = None;
                        return;
                    }
                }
            }
        };

        if supervised.stopped.load(Ordering::SeqCst) {
            let mut inner = supervised.inner.lock().expect("supervisor mutex poisoned");
            inner.status = ProcessStatus::Stopped;
            inner.pid = None;
            return;
        }

        let epoch = {
            let mut inner = supervised.inner.lock().expect("supervisor mutex poisoned");
            inner.status = ProcessStatus::Crashed { exit_code };
            inner.pid = None;
            inner.epoch
        };
        warn!(process = %name, exit_code, epoch, "supervised process exited unexpectedly");
        let _ = event_tx.send(ProcessEvent {
            name: name.clone(),
            epoch,
            exit_code,
        });

        match policy {
            RestartPolicy::Never => return,
            RestartPolicy::Backoff {
                max_restarts,
                base_delay,
            } => {
                if restarts >= max_restarts {
                    return;
                }
                let delay = base_delay * 2u32.saturating_pow(restarts);
                restarts += 1;
                tokio::time::sleep(delay).await;
                if supervised.stopped.load(Ordering::SeqCst) {
                    return;
                }
                match spawn(&supervised.command, &supervised.cwd) {
                    Ok(next) => {
                        let mut inner =
                            supervised.inner.lock().expect("supervisor mutex poisoned");
                        inner.status = ProcessStatus::Running;
                        inner.pid = next.id();
                        inner.epoch += 1;
                        drop(inner);
                        info!(process = %name, attempt = restarts, "restarted after backoff");
                        child = next;
                    }
                    Err(err) => {
                        warn!(process = %name, error = %err, "restart failed");
                        return;
                    }
                }
            }
        }
    }
}

type Lines<R> = tokio::io::Lines<BufReader<R>>;

/// Next line from an optional exhausted-able reader; pends forever once the
/// reader is gone so it never wins the select again.
async fn next_line<R: tokio::io::AsyncRead + Unpin>(lines: &mut Option<Lines<R>>) -> Option<String> {
    match lines {
        Some(reader) => match reader.next_line().await {
            Ok(Some(line)) => Some(line),
            _ => None,
        },
        None => std::future::pending().await,
    }
}

async fn record_line(supervised: &Supervised, log_file: &mut tokio::fs::File, line: &str) {
    if log_file
        .write_all(format!("{line}\n").as_bytes())
        .await
        .is_ok()
    {
        let _ = log_file.flush().await;
    }
    let mut inner = supervised.inner.lock().expect("supervisor mutex poisoned");
    if inner.recent.len() == RING_BUFFER_LINES {
        inner.recent.pop_front();
    }
    inner.recent.push_back(line.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::time::timeout;

    const EVENT_WAIT: Duration = Duration::from_secs(5);

    fn log_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(format!("{name}.log"))
    }

    #[tokio::test]
    async fn test_output_reaches_log_and_ring_buffer() {
        let dir = tempdir().unwrap();
        let (supervisor, mut events) = ProcessSupervisor::new();
        supervisor
            .start(
                "echo",
                "printf 'first\\nsecond\\n'",
                dir.path().to_path_buf(),
                log_path(&dir, "echo"),
                RestartPolicy::Never,
            )
            .await
            .unwrap();

        // Exit arrives after the pipes are drained.
        timeout(EVENT_WAIT, events.recv()).await.unwrap().unwrap();

        let logged = std::fs::read_to_string(log_path(&dir, "echo")).unwrap();
        assert!(logged.contains("first\n"));
        assert!(logged.contains("second\n"));
        assert_eq!(
            supervisor.recent_lines("echo").unwrap(),
            vec!["first", "second"]
        );
    }

    #[tokio::test]
    async fn test_unexpected_exit_emits_event_with_code() {
        let dir = tempdir().unwrap();
        let (supervisor, mut events) = ProcessSupervisor::new();
        supervisor
            .start(
                "failing",
                "exit 3",
                dir.path().to_path_buf(),
                log_path(&dir, "failing"),
                RestartPolicy::Never,
            )
            .await
            .unwrap();

        let event = timeout(EVENT_WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(event.name, "failing");
        assert_eq!(event.exit_code, Some(3));
        assert_eq!(event.epoch, 0);

        let health = supervisor.health("failing").unwrap();
        assert!(!health.running);
        assert_eq!(health.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_running() {
        let dir = tempdir().unwrap();
        let (supervisor, _events) = ProcessSupervisor::new();
        let first = supervisor
            .start(
                "sleeper",
                "sleep 30",
                dir.path().to_path_buf(),
                log_path(&dir, "sleeper"),
                RestartPolicy::Never,
            )
            .await
            .unwrap();
        let second = supervisor
            .start(
                "sleeper",
                "sleep 30",
                dir.path().to_path_buf(),
                log_path(&dir, "sleeper"),
                RestartPolicy::Never,
            )
            .await
            .unwrap();
        assert_eq!(first.pid, second.pid);
        supervisor.stop("sleeper").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_emits_no_crash_event() {
        let dir = tempdir().unwrap();
        let (supervisor, mut events) = ProcessSupervisor::new();
        supervisor
            .start(
                "sleeper",
                "sleep 30",
                dir.path().to_path_buf(),
                log_path(&dir, "sleeper"),
                RestartPolicy::Never,
            )
            .await
            .unwrap();
        supervisor.stop("sleeper").await.unwrap();

        // Give the monitor a moment to observe the kill.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(events.try_recv().is_err());
        assert!(!supervisor.health("sleeper").unwrap().running);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synchronous() {
        let dir = tempdir().unwrap();
        let (supervisor, _events) = ProcessSupervisor::new();
        // sh itself spawns fine; a missing cwd does not.
        let result = supervisor
            .start(
                "broken",
                "true",
                dir.path().join("does-not-exist"),
                log_path(&dir, "broken"),
                RestartPolicy::Never,
            )
            .await;
        assert!(matches!(result, Err(SupervisorError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_backoff_restart_bumps_epoch() {
        let dir = tempdir().unwrap();
        let (supervisor, mut events) = ProcessSupervisor::new();
        supervisor
            .start(
                "flappy",
                "exit 1",
                dir.path().to_path_buf(),
                log_path(&dir, "flappy"),
                RestartPolicy::Backoff {
                    max_restarts: 1,
                    base_delay: Duration::from_millis(10),
                },
            )
            .await
            .unwrap();

        let first = timeout(EVENT_WAIT, events.recv()).await.unwrap().unwrap();
        let second = timeout(EVENT_WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(first.epoch, 0);
        assert_eq!(second.epoch, 1);
    }

    #[tokio::test]
    async fn test_fresh_start_over_crashed_name_bumps_epoch() {
        let dir = tempdir().unwrap();
        let (supervisor, mut events) = ProcessSupervisor::new();
        supervisor
            .start(
                "watcher",
                "exit 1",
                dir.path().to_path_buf(),
                log_path(&dir, "watcher"),
                RestartPolicy::Never,
            )
            .await
            .unwrap();
        let first = timeout(EVENT_WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(first.epoch, 0);

        let handle = supervisor
            .start(
                "watcher",
                "exit 1",
                dir.path().to_path_buf(),
                log_path(&dir, "watcher"),
                RestartPolicy::Never,
            )
            .await
            .unwrap();
        assert_eq!(handle.epoch, 1);
        let second = timeout(EVENT_WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(second.epoch, 1);
    }

    #[tokio::test]
    async fn test_unknown_process_errors() {
        let (supervisor, _events) = ProcessSupervisor::new();
        assert!(matches!(
            supervisor.health("ghost"),
            Err(SupervisorError::UnknownProcess(_))
        ));
        assert!(matches!(
            supervisor.stop("ghost").await,
            Err(SupervisorError::UnknownProcess(_))
        ));
    }
}
