//! Durable state under `.vigil/`.
//!
//! Every document is pretty-printed JSON written through a temp file and
//! rename, so a crash mid-write never leaves a half document. The per-item
//! audit trail is the one exception: an append-only pipe-delimited line
//! file (`timestamp|from|to|trigger`), because appends survive crashes
//! without rewrite and the trail must never be rewritten anyway.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::StoreError;
use crate::policy::EscalationRecord;
use crate::workitem::{Phase, TransitionRecord, WorkItem};

/// The active attention window, persisted so `status`/`pause`/`cancel` in
/// other processes can see and steer it. Presence of the document means a
/// session is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub budget_secs: u64,
    /// Set by `vigil pause`; the scheduler checks it between phase steps.
    pub pause_requested: bool,
}

impl Session {
    pub fn new(budget_secs: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            budget_secs,
            pause_requested: false,
        }
    }
}

/// Exclusive hold on a state directory. Released on drop.
pub struct SessionLock {
    file: File,
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Filesystem-backed store for work items, the queue, escalations, the
/// session document, and audit trails.
#[derive(Debug, Clone)]
pub struct StateStore {
    workitems_dir: PathBuf,
    escalations_dir: PathBuf,
    audit_dir: PathBuf,
    reports_dir: PathBuf,
    queue_file: PathBuf,
    session_file: PathBuf,
    lock_file: PathBuf,
}

impl StateStore {
    pub fn new(config: &Config) -> Self {
        Self {
            workitems_dir: config.workitems_dir.clone(),
            escalations_dir: config.escalations_dir.clone(),
            audit_dir: config.audit_dir.clone(),
            reports_dir: config.reports_dir.clone(),
            queue_file: config.queue_file.clone(),
            session_file: config.session_file.clone(),
            lock_file: config.lock_file.clone(),
        }
    }

    /// Take the advisory lock so two orchestrators cannot share `.vigil/`.
    pub fn acquire_lock(&self) -> Result<SessionLock, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_file)
            .map_err(|source| StoreError::WriteFailed {
                path: self.lock_file.clone(),
                source,
            })?;
        file.try_lock_exclusive().map_err(|_| StoreError::Locked)?;
        Ok(SessionLock { file })
    }

    // -- work items --

    pub fn save_work_item(&self, item: &WorkItem) -> Result<(), StoreError> {
        self.write_json(&self.workitem_path(&item.id), item)
    }

    pub fn load_work_item(&self, id: &str) -> Result<WorkItem, StoreError> {
        let path = self.workitem_path(id);
        if !path.exists() {
            return Err(StoreError::WorkItemNotFound(id.to_string()));
        }
        self.read_json(&path)
    }

    pub fn list_work_items(&self) -> Result<Vec<WorkItem>, StoreError> {
        let mut items = Vec::new();
        if !self.workitems_dir.exists() {
            return Ok(items);
        }
        let entries =
            std::fs::read_dir(&self.workitems_dir).map_err(|source| StoreError::ReadFailed {
                path: self.workitems_dir.clone(),
                source,
            })?;
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::ReadFailed {
                path: self.workitems_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                items.push(self.read_json(&path)?);
            }
        }
        items.sort_by(|a: &WorkItem, b: &WorkItem| a.created_at.cmp(&b.created_at));
        Ok(items)
    }

    fn workitem_path(&self, id: &str) -> PathBuf {
        self.workitems_dir.join(format!("{id}.json"))
    }

    // -- audit trail --

    /// Append one transition to the item's durable trail.
    pub fn append_trail(&self, id: &str, record: &TransitionRecord) -> Result<(), StoreError> {
        let path = self.audit_dir.join(format!("{id}.log"));
        let line = format!(
            "{}|{}|{}|{}\n",
            record.timestamp.to_rfc3339(),
            record.from,
            record.to,
            record.trigger
        );
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| StoreError::WriteFailed {
                path: path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|source| StoreError::WriteFailed { path, source })
    }

    /// Read a trail back as `(timestamp, from, to, trigger)` tuples.
    pub fn read_trail(&self, id: &str) -> Result<Vec<(String, String, String, String)>, StoreError> {
        let path = self.audit_dir.join(format!("{id}.log"));
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content =
            std::fs::read_to_string(&path).map_err(|source| StoreError::ReadFailed {
                path: path.clone(),
                source,
            })?;
        let mut records = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let mut parts = line.splitn(4, '|');
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(ts), Some(from), Some(to), Some(trigger)) => records.push((
                    ts.to_string(),
                    from.to_string(),
                    to.to_string(),
                    trigger.to_string(),
                )),
                _ => continue,
            }
        }
        Ok(records)
    }

    // -- queue --

    pub fn load_queue(&self) -> Result<VecDeque<String>, StoreError> {
        if !self.queue_file.exists() {
            return Ok(VecDeque::new());
        }
        self.read_json(&self.queue_file)
    }

    pub fn save_queue(&self, queue: &VecDeque<String>) -> Result<(), StoreError> {
        self.write_json(&self.queue_file, queue)
    }

    pub fn enqueue(&self, id: &str) -> Result<(), StoreError> {
        let mut queue = self.load_queue()?;
        if !queue.contains(&id.to_string()) {
            queue.push_back(id.to_string());
        }
        self.save_queue(&queue)
    }

    // -- escalations --

    pub fn save_escalation(&self, record: &EscalationRecord) -> Result<(), StoreError> {
        let path = self
            .escalations_dir
            .join(format!("{}.json", record.work_item_id));
        self.write_json(&path, record)
    }

    pub fn load_escalation(&self, id: &str) -> Result<Option<EscalationRecord>, StoreError> {
        let path = self.escalations_dir.join(format!("{id}.json"));
        if !path.exists() {
            return Ok(None);
        }
        self.read_json(&path).map(Some)
    }

    pub fn clear_escalation(&self, id: &str) -> Result<(), StoreError> {
        let path = self.escalations_dir.join(format!("{id}.json"));
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|source| StoreError::WriteFailed { path, source })?;
        }
        Ok(())
    }

    // -- session --

    pub fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        self.write_json(&self.session_file, session)
    }

    pub fn load_session(&self) -> Result<Option<Session>, StoreError> {
        if !self.session_file.exists() {
            return Ok(None);
        }
        self.read_json(&self.session_file).map(Some)
    }

    pub fn clear_session(&self) -> Result<(), StoreError> {
        if self.session_file.exists() {
            std::fs::remove_file(&self.session_file).map_err(|source| StoreError::WriteFailed {
                path: self.session_file.clone(),
                source,
            })?;
        }
        Ok(())
    }

    // -- reports --

    pub fn save_report<T: Serialize>(&self, name: &str, report: &T) -> Result<(), StoreError> {
        let path = self.reports_dir.join(format!("{name}.json"));
        self.write_json(&path, report)
    }

    /// Rebuild runnable state after an orchestrator restart: items frozen
    /// mid-phase go back to the front of the queue at their current phase.
    pub fn recover(&self) -> Result<(Vec<WorkItem>, VecDeque<String>), StoreError> {
        let items = self.list_work_items()?;
        let mut queue = self.load_queue()?;
        for item in items.iter().rev() {
            let interrupted = item.phase.is_working() || item.phase == Phase::Queued;
            if interrupted && !queue.contains(&item.id) {
                queue.push_front(item.id.clone());
            }
        }
        self.save_queue(&queue)?;
        Ok((items, queue))
    }

    // -- plumbing --

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| StoreError::Other(anyhow::Error::new(e).context("serialize document")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| StoreError::WriteFailed {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| StoreError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T, StoreError> {
        let content = std::fs::read_to_string(path).map_err(|source| StoreError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::EscalationReason;
    use crate::ticket::Ticket;
    use tempfile::tempdir;

    fn setup() -> (StateStore, Config, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), None).unwrap();
        config.ensure_directories().unwrap();
        (StateStore::new(&config), config, dir)
    }

    fn item(id: &str) -> WorkItem {
        Ticket {
            id: id.into(),
            title: "t".into(),
            requirement_text: "r".into(),
            acceptance_criteria: vec!["c".into()],
            constraints: vec![],
            project: "api".into(),
        }
        .into_work_item()
    }

    #[test]
    fn test_work_item_roundtrip() {
        let (store, _config, _dir) = setup();
        let mut wi = item("TCK-1");
        wi.transition(Phase::Red, "intake").unwrap();
        store.save_work_item(&wi).unwrap();

        let loaded = store.load_work_item("TCK-1").unwrap();
        assert_eq!(loaded.phase, Phase::Red);
        assert_eq!(loaded.trail.len(), 1);
    }

    #[test]
    fn test_missing_work_item_is_not_found() {
        let (store, _config, _dir) = setup();
        assert!(matches!(
            store.load_work_item("ghost"),
            Err(StoreError::WorkItemNotFound(id)) if id == "ghost"
        ));
    }

    #[test]
    fn test_corrupt_document_is_reported_with_path() {
        let (store, config, _dir) = setup();
        std::fs::write(config.workitems_dir.join("bad.json"), "{ nope").unwrap();
        assert!(matches!(
            store.load_work_item("bad"),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_trail_append_and_read() {
        let (store, _config, _dir) = setup();
        let mut wi = item("TCK-2");
        wi.transition(Phase::Red, "intake").unwrap();
        wi.transition(Phase::Green, "api.test-output@1:300").unwrap();
        for record in &wi.trail {
            store.append_trail(&wi.id, record).unwrap();
        }

        let trail = store.read_trail("TCK-2").unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].1, "queued");
        assert_eq!(trail[0].2, "red");
        assert_eq!(trail[1].3, "api.test-output@1:300");
    }

    #[test]
    fn test_queue_is_fifo_and_deduplicated() {
        let (store, _config, _dir) = setup();
        store.enqueue("a").unwrap();
        store.enqueue("b").unwrap();
        store.enqueue("a").unwrap();
        let queue = store.load_queue().unwrap();
        assert_eq!(queue, VecDeque::from(["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_escalation_roundtrip_and_clear() {
        let (store, _config, _dir) = setup();
        let record = EscalationRecord::new(
            "TCK-3",
            EscalationReason::CannotAchieveRed,
            Phase::Red,
            None,
            vec![],
        );
        store.save_escalation(&record).unwrap();
        let loaded = store.load_escalation("TCK-3").unwrap().unwrap();
        assert_eq!(loaded.reason, EscalationReason::CannotAchieveRed);

        store.clear_escalation("TCK-3").unwrap();
        assert!(store.load_escalation("TCK-3").unwrap().is_none());
    }

    #[test]
    fn test_session_lifecycle() {
        let (store, _config, _dir) = setup();
        assert!(store.load_session().unwrap().is_none());

        let session = Session::new(3600);
        store.save_session(&session).unwrap();
        let active = store.load_session().unwrap().unwrap();
        assert_eq!(active.id, session.id);
        assert!(!active.pause_requested);

        store.clear_session().unwrap();
        assert!(store.load_session().unwrap().is_none());
    }

    #[test]
    fn test_lock_is_exclusive() {
        let (store, _config, _dir) = setup();
        let _held = store.acquire_lock().unwrap();
        assert!(matches!(store.acquire_lock(), Err(StoreError::Locked)));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let (store, _config, _dir) = setup();
        drop(store.acquire_lock().unwrap());
        assert!(store.acquire_lock().is_ok());
    }

    #[test]
    fn test_recover_requeues_interrupted_items() {
        let (store, _config, _dir) = setup();
        let mut active = item("TCK-active");
        active.transition(Phase::Red, "intake").unwrap();
        let mut done = item("TCK-done");
        done.transition(Phase::Red, "intake").unwrap();
        done.transition(Phase::Green, "s").unwrap();
        done.transition(Phase::Refactor, "s").unwrap();
        done.transition(Phase::Review, "s").unwrap();
        done.transition(Phase::Done, "s").unwrap();
        store.save_work_item(&active).unwrap();
        store.save_work_item(&done).unwrap();
        store.enqueue("TCK-queued-only").unwrap();
        store.save_work_item(&item("TCK-queued-only")).unwrap();

        let (items, queue) = store.recover().unwrap();
        assert_eq!(items.len(), 3);
        assert!(queue.contains(&"TCK-active".to_string()));
        assert!(queue.contains(&"TCK-queued-only".to_string()));
        assert!(!queue.contains(&"TCK-done".to_string()));
        // Interrupted mid-phase work goes to the front.
        assert_eq!(queue.front().map(String::as_str), Some("TCK-active"));
    }
}
