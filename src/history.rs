//! Bounded in-memory message history with CSV export.
//!
//! Keeps the most recent messages (sent and received) in a ring buffer so a
//! long-running session with a chatty broker cannot grow without bound. The
//! cap is adjustable at runtime through the advanced settings; shrinking it
//! drops the oldest entries immediately.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("failed to write export file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write CSV record: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Sent => write!(f, "sent"),
            Direction::Received => write!(f, "received"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub direction: Direction,
    pub payload: String,
}

impl HistoryEntry {
    pub fn now(channel: impl Into<String>, direction: Direction, payload: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            channel: channel.into(),
            direction,
            payload: payload.into(),
        }
    }
}

/// Ring buffer of recent messages, oldest evicted first.
#[derive(Debug)]
pub struct MessageHistory {
    inner: Mutex<Ring>,
}

#[derive(Debug)]
struct Ring {
    entries: VecDeque<HistoryEntry>,
    cap: usize,
}

impl MessageHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Ring {
                entries: VecDeque::with_capacity(cap.min(1024)),
                cap: cap.max(1),
            }),
        }
    }

    pub fn push(&self, entry: HistoryEntry) {
        let mut ring = self.lock();
        while ring.entries.len() >= ring.cap {
            ring.entries.pop_front();
        }
        ring.entries.push_back(entry);
    }

    /// Changes the cap, dropping the oldest entries if the buffer is over it.
    pub fn set_cap(&self, cap: usize) {
        let mut ring = self.lock();
        ring.cap = cap.max(1);
        while ring.entries.len() > ring.cap {
            ring.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Writes the buffered history to `path` as CSV and returns the number of
    /// exported rows. Columns: timestamp, channel, direction, payload.
    pub fn export_csv(&self, path: &Path) -> Result<usize, HistoryError> {
        let entries = self.entries();
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["timestamp", "channel", "direction", "payload"])?;
        for entry in &entries {
            writer.write_record([
                entry.timestamp.to_rfc3339(),
                entry.channel.clone(),
                entry.direction.to_string(),
                entry.payload.clone(),
            ])?;
        }
        writer.flush().map_err(HistoryError::Io)?;
        info!("exported {} history entries to {}", entries.len(), path.display());
        Ok(entries.len())
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(payload: &str) -> HistoryEntry {
        HistoryEntry::now("test/topic", Direction::Received, payload)
    }

    #[test]
    fn oldest_entries_are_evicted_at_cap() {
        let history = MessageHistory::new(3);
        for i in 0..5 {
            history.push(entry(&format!("msg-{i}")));
        }

        let payloads: Vec<String> = history.entries().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec!["msg-2", "msg-3", "msg-4"]);
    }

    #[test]
    fn shrinking_cap_drops_oldest() {
        let history = MessageHistory::new(10);
        for i in 0..6 {
            history.push(entry(&format!("msg-{i}")));
        }
        history.set_cap(2);

        let payloads: Vec<String> = history.entries().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec!["msg-4", "msg-5"]);
    }

    #[test]
    fn clear_empties_the_buffer() {
        let history = MessageHistory::new(5);
        history.push(entry("one"));
        history.clear();
        assert!(history.is_empty());
    }

    #[test]
    fn export_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.csv");

        let history = MessageHistory::new(10);
        history.push(HistoryEntry::now("a", Direction::Sent, "ping"));
        history.push(HistoryEntry::now("b", Direction::Received, "pong, with comma"));

        let exported = history.export_csv(&path).unwrap();
        assert_eq!(exported, 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), "timestamp,channel,direction,payload");
        assert!(content.contains("a,sent,ping"));
        assert!(content.contains("\"pong, with comma\""));
    }
}
