//! The worker node process.
//!
//! Executes commands handed over by the orchestrator and serves the wire
//! contract: `POST /execute`, `POST /cancel/{job_id}`, `GET /status`,
//! `GET /health`, `GET /logs/{job_id}/stream`, `PUT /config`. Log lines,
//! progress, and the terminal status of each job travel back to the
//! orchestrator over the per-job SSE stream.

pub mod runner;
pub mod server;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerNodeConfig;
use crate::transport::JobStreamEvent;

pub use server::run_worker_node;

/// How long a finished job's stream stays replayable for late subscribers.
const FINISHED_STREAM_RETENTION_SECS: i64 = 300;

/// One frame on a per-job stream: the event plus its sequence number.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub seq: u64,
    pub event: JobStreamEvent,
}

/// Replayable per-job event stream: a tail buffer plus a live broadcast.
pub struct JobStream {
    seq: AtomicU64,
    tail: Mutex<Vec<StreamFrame>>,
    live: broadcast::Sender<StreamFrame>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl Default for JobStream {
    fn default() -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            seq: AtomicU64::new(0),
            tail: Mutex::new(Vec::new()),
            live,
            finished_at: Mutex::new(None),
        }
    }
}

impl JobStream {
    pub fn push(&self, event: JobStreamEvent) {
        let terminal = matches!(event, JobStreamEvent::Status { .. });
        let frame = StreamFrame {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            event,
        };
        self.tail.lock().unwrap().push(frame.clone());
        let _ = self.live.send(frame);
        if terminal {
            *self.finished_at.lock().unwrap() = Some(Utc::now());
        }
    }

    /// Tail snapshot plus a live receiver; subscribers replay the snapshot
    /// first, so no frame is lost across the hand-off.
    pub fn subscribe(&self) -> (Vec<StreamFrame>, broadcast::Receiver<StreamFrame>) {
        // Lock ordering: receiver first, then snapshot, so frames pushed
        // in between appear in the receiver (duplicates are filtered by
        // seq on the consumer side).
        let receiver = self.live.subscribe();
        let snapshot = self.tail.lock().unwrap().clone();
        (snapshot, receiver)
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.lock().unwrap().is_some()
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.finished_at
            .lock()
            .unwrap()
            .map(|t| (now - t).num_seconds() > FINISHED_STREAM_RETENTION_SECS)
            .unwrap_or(false)
    }
}

/// Shared state of the worker node process.
pub struct NodeState {
    pub config: WorkerNodeConfig,
    pub max_jobs: AtomicU32,
    /// Cancellation handles of in-flight jobs.
    running: Mutex<HashMap<Uuid, CancellationToken>>,
    streams: Mutex<HashMap<Uuid, Arc<JobStream>>>,
    pub shutdown: CancellationToken,
}

impl NodeState {
    pub fn new(config: WorkerNodeConfig, shutdown: CancellationToken) -> Self {
        Self {
            max_jobs: AtomicU32::new(config.max_jobs),
            config,
            running: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn current_jobs(&self) -> u32 {
        self.running.lock().unwrap().len() as u32
    }

    /// Admit a new job if there is capacity; returns its cancel token.
    pub fn admit(&self, job_id: Uuid) -> Option<CancellationToken> {
        let mut running = self.running.lock().unwrap();
        if running.contains_key(&job_id) {
            return None;
        }
        if running.len() as u32 >= self.max_jobs.load(Ordering::Relaxed) {
            return None;
        }
        let token = self.shutdown.child_token();
        running.insert(job_id, token.clone());
        Some(token)
    }

    pub fn finish(&self, job_id: Uuid) {
        self.running.lock().unwrap().remove(&job_id);
        self.sweep_streams();
    }

    /// Request cancellation; true if the job was known.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.running.lock().unwrap().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for token in self.running.lock().unwrap().values() {
            token.cancel();
        }
    }

    pub fn stream_for(&self, job_id: Uuid) -> Arc<JobStream> {
        self.streams
            .lock()
            .unwrap()
            .entry(job_id)
            .or_default()
            .clone()
    }

    pub fn existing_stream(&self, job_id: Uuid) -> Option<Arc<JobStream>> {
        self.streams.lock().unwrap().get(&job_id).cloned()
    }

    fn sweep_streams(&self) {
        let now = Utc::now();
        self.streams
            .lock()
            .unwrap()
            .retain(|_, stream| !stream.expired(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobStatus;

    fn state() -> NodeState {
        let config = WorkerNodeConfig {
            name: "test".into(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            orchestrator_url: "http://127.0.0.1:8420".into(),
            max_jobs: 2,
            callback_token: None,
        };
        NodeState::new(config, CancellationToken::new())
    }

    #[test]
    fn admission_respects_capacity() {
        let state = state();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        assert!(state.admit(a).is_some());
        assert!(state.admit(b).is_some());
        assert!(state.admit(c).is_none());
        state.finish(a);
        assert!(state.admit(c).is_some());
    }

    #[test]
    fn duplicate_execute_is_refused() {
        let state = state();
        let id = Uuid::new_v4();
        assert!(state.admit(id).is_some());
        assert!(state.admit(id).is_none());
    }

    #[test]
    fn stream_replays_tail_to_late_subscribers() {
        let state = state();
        let id = Uuid::new_v4();
        let stream = state.stream_for(id);
        stream.push(JobStreamEvent::LogLine("one".into()));
        stream.push(JobStreamEvent::Progress(50));
        stream.push(JobStreamEvent::Status {
            status: JobStatus::Completed,
            result: None,
            error_message: None,
        });

        let (tail, _rx) = stream.subscribe();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].seq, 1);
        assert!(stream.is_finished());
    }

    #[test]
    fn cancel_unknown_job_is_false() {
        let state = state();
        assert!(!state.cancel(Uuid::new_v4()));
    }
}
