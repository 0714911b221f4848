//! Per-entity log artifacts on disk plus bounded in-memory tails.
//!
//! Layout: `<root>/{jobs,workers,queues}/<id>.log`, append-only with a
//! timestamp prefix per line. The in-memory tail ring backs SSE replay and
//! is bounded at 1024 lines or 64 KiB, whichever fills first.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::events::LogKind;

pub const TAIL_MAX_LINES: usize = 1024;
pub const TAIL_MAX_BYTES: usize = 64 * 1024;
pub const TRUNCATED_MARKER: &str = "[truncated]";

#[derive(Debug, Default)]
struct TailRing {
    lines: VecDeque<String>,
    bytes: usize,
    /// Set while the ring is dropping lines so the marker is stamped once
    /// per overflow run.
    truncating: bool,
}

impl TailRing {
    fn push(&mut self, line: String) {
        self.bytes += line.len();
        self.lines.push_back(line);
        let mut dropped = false;
        while self.lines.len() > TAIL_MAX_LINES || self.bytes > TAIL_MAX_BYTES {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len();
                dropped = true;
            } else {
                break;
            }
        }
        if dropped && !self.truncating {
            self.truncating = true;
            let marker = TRUNCATED_MARKER.to_string();
            self.bytes += marker.len();
            self.lines.push_front(marker);
        } else if !dropped {
            self.truncating = false;
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

pub struct LogStore {
    root: PathBuf,
    tails: Mutex<HashMap<(LogKind, String), TailRing>>,
}

impl LogStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            tails: Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, kind: LogKind, id: &str) -> PathBuf {
        self.root.join(kind.to_string()).join(format!("{id}.log"))
    }

    /// Append one line to the entity's artifact and tail ring. The line is
    /// stamped with the current UTC time in the file but kept verbatim in
    /// the tail.
    pub async fn append(&self, kind: LogKind, id: &str, line: &str) -> Result<()> {
        let path = self.path(kind, id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let stamped = format!("[{}] {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"), line);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(stamped.as_bytes()).await?;

        let mut tails = self.tails.lock().unwrap();
        tails
            .entry((kind, id.to_string()))
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    /// Full artifact content; empty string when nothing was written yet.
    pub async fn read(&self, kind: LogKind, id: &str) -> Result<String> {
        let path = self.path(kind, id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Truncate the artifact and drop the tail.
    pub async fn clear(&self, kind: LogKind, id: &str) -> Result<()> {
        let path = self.path(kind, id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, b"").await?;
        self.tails.lock().unwrap().remove(&(kind, id.to_string()));
        Ok(())
    }

    /// Remove the artifact entirely; used when the owning entity is deleted.
    pub async fn remove(&self, kind: LogKind, id: &str) -> Result<()> {
        let path = self.path(kind, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.tails.lock().unwrap().remove(&(kind, id.to_string()));
        Ok(())
    }

    /// Snapshot of the tail ring, oldest first.
    pub fn tail(&self, kind: LogKind, id: &str) -> Vec<String> {
        self.tails
            .lock()
            .unwrap()
            .get(&(kind, id.to_string()))
            .map(|ring| ring.snapshot())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_ring_bounds_lines() {
        let mut ring = TailRing::default();
        for i in 0..(TAIL_MAX_LINES + 10) {
            ring.push(format!("line {i}"));
        }
        let snapshot = ring.snapshot();
        assert!(snapshot.len() <= TAIL_MAX_LINES + 1);
        assert_eq!(snapshot[0], TRUNCATED_MARKER);
        assert_eq!(snapshot.last().unwrap(), &format!("line {}", TAIL_MAX_LINES + 9));
    }

    #[test]
    fn tail_ring_bounds_bytes() {
        let mut ring = TailRing::default();
        let big = "x".repeat(8 * 1024);
        for _ in 0..10 {
            ring.push(big.clone());
        }
        assert!(ring.bytes <= TAIL_MAX_BYTES + TRUNCATED_MARKER.len() + big.len());
        assert_eq!(ring.snapshot()[0], TRUNCATED_MARKER);
    }

    #[tokio::test]
    async fn append_read_clear_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path().to_path_buf());

        store.append(LogKind::Job, "j1", "hello").await.unwrap();
        store.append(LogKind::Job, "j1", "world").await.unwrap();

        let content = store.read(LogKind::Job, "j1").await.unwrap();
        assert!(content.contains("hello"));
        assert!(content.contains("world"));
        assert_eq!(store.tail(LogKind::Job, "j1"), vec!["hello", "world"]);

        store.clear(LogKind::Job, "j1").await.unwrap();
        assert_eq!(store.read(LogKind::Job, "j1").await.unwrap(), "");
        assert!(store.tail(LogKind::Job, "j1").is_empty());
    }

    #[tokio::test]
    async fn read_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path().to_path_buf());
        assert_eq!(store.read(LogKind::Worker, "none").await.unwrap(), "");
    }
}
