//! Log tailing with durable cursors.
//!
//! One tailer owns one append-only log file. It polls for newly appended
//! bytes, feeds complete lines through the extractor, and persists its
//! cursor after every emitted batch. Delivery is at-least-once: a crash
//! between emit and persist replays the tail of the batch with identical
//! `(epoch, seq)` tags, which the consumer discards as duplicates.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::signals::{LineExtractor, Signal};

/// Persisted read position for one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Byte offset just past the last fully consumed line.
    pub offset: u64,
    /// File identity at the time of the last poll (inode on unix), for
    /// rotation detection.
    pub file_id: Option<u64>,
    /// Bumped on truncation or identity change; seq restarts with it.
    pub epoch: u64,
    /// Last sequence number handed out in this epoch.
    pub seq: u64,
}

pub struct LogTailer {
    stream: String,
    log_path: PathBuf,
    cursor_path: PathBuf,
    cursor: Cursor,
    /// Bytes of a trailing line not yet terminated by a newline. Never
    /// reflected in the persisted offset, so a restart re-reads them.
    partial: Vec<u8>,
    extractor: LineExtractor,
}

impl LogTailer {
    /// Open a tailer for `stream`, resuming from a persisted cursor when
    /// one exists.
    pub fn new(stream: impl Into<String>, log_path: PathBuf, cursors_dir: &Path) -> Result<Self> {
        let stream = stream.into();
        let cursor_path = cursors_dir.join(format!("{stream}.json"));
        let cursor = if cursor_path.exists() {
            let content = std::fs::read_to_string(&cursor_path)
                .with_context(|| format!("Failed to read cursor {}", cursor_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Corrupt cursor {}", cursor_path.display()))?
        } else {
            Cursor::default()
        };
        Ok(Self {
            stream,
            log_path,
            cursor_path,
            cursor,
            partial: Vec::new(),
            extractor: LineExtractor::new(),
        })
    }

    pub fn epoch(&self) -> u64 {
        self.cursor.epoch
    }

    /// Read whatever was appended since the last poll and turn it into
    /// signals. Persists the cursor before returning.
    pub fn poll(&mut self) -> Result<Vec<Signal>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }
        let metadata = std::fs::metadata(&self.log_path)
            .with_context(|| format!("Failed to stat {}", self.log_path.display()))?;
        let file_id = file_identity(&metadata);
        let len = metadata.len();

        // The held partial bytes count as consumed for truncation purposes:
        // a file shorter than offset + partial can no longer contain them.
        let rotated = len < self.cursor.offset + self.partial.len() as u64
            || (self.cursor.file_id.is_some() && file_id != self.cursor.file_id);
        if rotated {
            warn!(
                stream = %self.stream,
                epoch = self.cursor.epoch + 1,
                "log rotated or truncated, restarting from byte 0"
            );
            self.cursor.offset = 0;
            self.cursor.epoch += 1;
            self.cursor.seq = 0;
            self.partial.clear();
            self.extractor = LineExtractor::new();
        }
        self.cursor.file_id = file_id;

        let read_from = self.cursor.offset + self.partial.len() as u64;
        if len <= read_from {
            return Ok(Vec::new());
        }

        let mut file = std::fs::File::open(&self.log_path)
            .with_context(|| format!("Failed to open {}", self.log_path.display()))?;
        file.seek(SeekFrom::Start(read_from))?;
        let mut fresh = Vec::with_capacity((len - read_from) as usize);
        file.read_to_end(&mut fresh)?;

        let mut buffer = std::mem::take(&mut self.partial);
        buffer.extend_from_slice(&fresh);

        let mut signals = Vec::new();
        let mut consumed = 0usize;
        while let Some(newline_at) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let line_end = consumed + newline_at + 1;
            let line = String::from_utf8_lossy(&buffer[consumed..line_end - 1]);
            let line_offset = self.cursor.offset + line_end as u64;
            for kind in self.extractor.extract(line.trim_end_matches('\r')) {
                self.cursor.seq += 1;
                signals.push(Signal::new(
                    self.stream.clone(),
                    line_offset,
                    self.cursor.seq,
                    self.cursor.epoch,
                    kind,
                ));
            }
            consumed = line_end;
        }
        self.partial = buffer.split_off(consumed);
        self.cursor.offset += consumed as u64;

        if let Some(kind) = self.extractor.end_of_batch() {
            self.cursor.seq += 1;
            signals.push(Signal::new(
                self.stream.clone(),
                self.cursor.offset,
                self.cursor.seq,
                self.cursor.epoch,
                kind,
            ));
        }

        self.persist_cursor()?;
        if !signals.is_empty() {
            debug!(stream = %self.stream, count = signals.len(), "emitted signal batch");
        }
        Ok(signals)
    }

    /// Poll on an interval, pushing signals into `tx` until the receiver
    /// goes away.
    pub async fn run(mut self, tx: mpsc::Sender<Signal>, interval: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                return Ok(());
            }
            for signal in self.poll()? {
                if tx.send(signal).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    fn persist_cursor(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.cursor)?;
        let tmp = self.cursor_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write cursor {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.cursor_path)
            .with_context(|| format!("Failed to persist cursor {}", self.cursor_path.display()))?;
        Ok(())
    }
}

#[cfg(unix)]
fn file_identity(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn file_identity(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}
