//! In-process pub/sub feeding the SSE subscribers and the dispatch loop.
//!
//! Four event families travel the bus: job, worker, and queue updates plus
//! log lines. Every event carries a per-topic monotonic sequence number so
//! reconnecting subscribers can tell where a stream resumed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};

use crate::model::{Job, Queue, Worker};

/// Capacity of the broadcast ring. Laggy receivers get `Lagged` and resync
/// from a snapshot rather than blocking producers.
const BUS_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Job,
    Worker,
    Queue,
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogKind::Job => write!(f, "jobs"),
            LogKind::Worker => write!(f, "workers"),
            LogKind::Queue => write!(f, "queues"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    JobUpdate(Job),
    WorkerUpdate(Worker),
    QueueUpdate(Queue),
    LogLine {
        kind: LogKind,
        entity_id: String,
        line: String,
    },
}

/// An event plus its per-topic sequence number.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub seq: u64,
    pub event: Event,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
    /// Sequence counters for the three list topics.
    jobs_seq: Arc<AtomicU64>,
    workers_seq: Arc<AtomicU64>,
    queues_seq: Arc<AtomicU64>,
    /// Per-entity log sequence counters, keyed by (kind, id).
    log_seqs: Arc<Mutex<HashMap<(LogKind, String), u64>>>,
    wakeup: Arc<Notify>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            jobs_seq: Arc::new(AtomicU64::new(0)),
            workers_seq: Arc::new(AtomicU64::new(0)),
            queues_seq: Arc::new(AtomicU64::new(0)),
            log_seqs: Arc::new(Mutex::new(HashMap::new())),
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Wait until any state-changing event is published. Used by the
    /// dispatch loop alongside its watchdog tick.
    pub async fn dispatch_wakeup(&self) {
        self.wakeup.notified().await;
    }

    /// Wake the dispatcher without publishing an event (e.g. after the
    /// health monitor flips a worker offline and back).
    pub fn nudge_dispatcher(&self) {
        self.wakeup.notify_one();
    }

    pub fn publish_job(&self, job: Job) {
        let seq = self.jobs_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.send(Envelope {
            seq,
            event: Event::JobUpdate(job),
        });
        self.wakeup.notify_one();
    }

    pub fn publish_worker(&self, worker: Worker) {
        let seq = self.workers_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.send(Envelope {
            seq,
            event: Event::WorkerUpdate(worker),
        });
        self.wakeup.notify_one();
    }

    pub fn publish_queue(&self, queue: Queue) {
        let seq = self.queues_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.send(Envelope {
            seq,
            event: Event::QueueUpdate(queue),
        });
        self.wakeup.notify_one();
    }

    pub fn publish_log(&self, kind: LogKind, entity_id: impl Into<String>, line: impl Into<String>) {
        let entity_id = entity_id.into();
        let seq = {
            let mut seqs = self.log_seqs.lock().unwrap();
            let counter = seqs.entry((kind, entity_id.clone())).or_insert(0);
            *counter += 1;
            *counter
        };
        self.send(Envelope {
            seq,
            event: Event::LogLine {
                kind,
                entity_id,
                line: line.into(),
            },
        });
    }

    /// Current sequence for a list topic; new subscribers stamp their
    /// initial snapshot with it.
    pub fn list_seq(&self, kind: LogKind) -> u64 {
        match kind {
            LogKind::Job => self.jobs_seq.load(Ordering::Relaxed),
            LogKind::Worker => self.workers_seq.load(Ordering::Relaxed),
            LogKind::Queue => self.queues_seq.load(Ordering::Relaxed),
        }
    }

    fn send(&self, envelope: Envelope) {
        // Err means no subscribers, which is fine.
        let _ = self.tx.send(envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobStatus;
    use serde_json::Map;

    fn job() -> Job {
        Job::new("echo".into(), "default".into(), Map::new(), None)
    }

    #[tokio::test]
    async fn sequences_are_monotonic_per_topic() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish_job(job());
        bus.publish_job(job());
        bus.publish_log(LogKind::Job, "j1", "line one");
        bus.publish_log(LogKind::Job, "j1", "line two");
        bus.publish_log(LogKind::Job, "j2", "other job");

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);

        // Log sequences count per entity, not globally.
        let l1 = rx.recv().await.unwrap();
        let l2 = rx.recv().await.unwrap();
        let l3 = rx.recv().await.unwrap();
        assert_eq!((l1.seq, l2.seq, l3.seq), (1, 2, 1));
    }

    #[tokio::test]
    async fn publish_wakes_dispatcher() {
        let bus = EventBus::new();
        let mut j = job();
        j.status = JobStatus::Pending;
        bus.publish_job(j);
        // Wakeup was recorded before we started waiting; this must not hang.
        tokio::time::timeout(std::time::Duration::from_millis(100), bus.dispatch_wakeup())
            .await
            .expect("dispatcher wakeup should be pending");
    }
}
