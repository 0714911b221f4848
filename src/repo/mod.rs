//! Durable storage behind a repository trait.
//!
//! The orchestration core depends only on this interface; `memory` backs
//! tests and the dev profile, `sql` talks to SQLite or PostgreSQL through
//! the sqlx Any driver. The two dispatch-critical operations are
//! [`Repository::reserve_job`] and [`Repository::release_job`]: reserve is
//! an atomic check-and-set that provides the no-double-dispatch guarantee.

pub mod memory;
pub mod sql;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    DispatchStrategy, Job, JobSpec, JobStatus, Queue, QueuePriority, QueueState, Session, User,
    Worker, WorkerState, WorkerStatus,
};

pub use memory::MemoryRepository;
pub use sql::SqlRepository;

#[derive(Debug, Clone, Default)]
pub struct NewSpec {
    pub name: String,
    pub description: Option<String>,
    pub command: String,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SpecPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub command: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewQueue {
    pub name: String,
    pub description: Option<String>,
    pub priority: QueuePriority,
    pub strategy: DispatchStrategy,
    pub state: QueueState,
    pub is_default: bool,
    pub time_limit_secs: i64,
}

#[derive(Debug, Clone, Default)]
pub struct QueuePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<QueuePriority>,
    pub strategy: Option<DispatchStrategy>,
    pub is_default: Option<bool>,
    pub time_limit_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatistics {
    pub total: u64,
    pub by_status: HashMap<String, u64>,
    /// Job counts per spec name, largest first.
    pub by_spec: Vec<(String, u64)>,
}

/// Pagination request; pages are 1-based.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: u32,
    pub per_page: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
        }
    }
}

impl Page {
    pub fn offset(&self) -> u64 {
        (self.page.max(1) as u64 - 1) * self.per_page as u64
    }

    pub fn limit(&self) -> u64 {
        self.per_page.clamp(1, 500) as u64
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    // --- specs ---
    async fn create_spec(&self, spec: NewSpec) -> Result<JobSpec>;
    async fn get_spec(&self, id: i64) -> Result<Option<JobSpec>>;
    async fn get_spec_by_name(&self, name: &str) -> Result<Option<JobSpec>>;
    async fn list_specs(&self, page: Page) -> Result<(Vec<JobSpec>, u64)>;
    async fn update_spec(&self, id: i64, patch: SpecPatch) -> Result<JobSpec>;
    async fn delete_spec(&self, id: i64) -> Result<()>;

    // --- jobs ---
    async fn insert_job(&self, job: &Job) -> Result<()>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;
    async fn list_jobs(&self, page: Page, exclude: &[JobStatus]) -> Result<(Vec<Job>, u64)>;
    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>>;
    async fn running_jobs_for_worker(&self, worker_name: &str) -> Result<Vec<Job>>;
    async fn count_running_for_worker(&self, worker_name: &str) -> Result<u32>;
    /// Oldest Pending job on the queue; creation-time order with job id as
    /// the tie-break.
    async fn oldest_pending_job(&self, queue_name: &str) -> Result<Option<Job>>;
    async fn count_pending_for_queue(&self, queue_name: &str) -> Result<u64>;
    async fn count_jobs_for_spec(&self, spec_name: &str, status: JobStatus) -> Result<u64>;

    /// Atomically move a Pending job to Running on the given worker,
    /// provided the worker still has spare capacity. Returns the updated
    /// job, or None when the compare-and-set lost.
    async fn reserve_job(&self, job_id: Uuid, worker: &Worker) -> Result<Option<Job>>;
    /// Roll a Running job back to Pending after a failed hand-off.
    async fn release_job(&self, job_id: Uuid) -> Result<Option<Job>>;
    /// Move a Pending job to another queue. None when the job was no
    /// longer Pending.
    async fn move_job(&self, job_id: Uuid, queue_name: &str) -> Result<Option<Job>>;
    /// Monotonic progress write; ignored unless the job is Running and the
    /// value is an increase.
    async fn set_job_progress(&self, job_id: Uuid, progress: u8) -> Result<Option<Job>>;
    /// Terminal transition honoring the state machine (Running to any
    /// terminal, Pending to Cancelled). Returns None when rejected, which
    /// makes terminal states absorbing.
    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: Option<Map<String, Value>>,
        error_message: Option<String>,
    ) -> Result<Option<Job>>;
    async fn delete_job(&self, id: Uuid) -> Result<()>;
    async fn job_statistics(&self) -> Result<JobStatistics>;
    /// Startup recovery: all jobs still Running from a previous process
    /// flip to Failed with the given reason.
    async fn recover_interrupted_jobs(&self, reason: &str) -> Result<Vec<Job>>;
    async fn terminal_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;

    // --- queues ---
    async fn create_queue(&self, queue: NewQueue) -> Result<Queue>;
    async fn get_queue(&self, id: i64) -> Result<Option<Queue>>;
    async fn get_queue_by_name(&self, name: &str) -> Result<Option<Queue>>;
    async fn default_queue(&self) -> Result<Option<Queue>>;
    async fn list_queues(&self, page: Page) -> Result<(Vec<Queue>, u64)>;
    async fn update_queue(&self, id: i64, patch: QueuePatch) -> Result<Queue>;
    async fn set_queue_state(&self, id: i64, state: QueueState) -> Result<Queue>;
    /// Returns the cursor value to use for this selection and advances the
    /// stored cursor, regardless of the dispatch outcome.
    async fn advance_rr_cursor(&self, id: i64) -> Result<u32>;
    async fn delete_queue(&self, id: i64) -> Result<()>;

    // --- queue/worker assignments ---
    /// Returns false when the assignment already existed.
    async fn assign_worker_to_queue(&self, queue_id: i64, worker_id: i64) -> Result<bool>;
    async fn unassign_worker_from_queue(&self, queue_id: i64, worker_id: i64) -> Result<bool>;
    async fn queue_workers(&self, queue_id: i64) -> Result<Vec<Worker>>;
    async fn unassigned_workers(&self, queue_id: i64) -> Result<Vec<Worker>>;

    // --- workers ---
    /// Persists the worker and returns it with its assigned id.
    async fn create_worker(&self, worker: Worker) -> Result<Worker>;
    async fn get_worker(&self, id: i64) -> Result<Option<Worker>>;
    async fn get_worker_by_name(&self, name: &str) -> Result<Option<Worker>>;
    async fn list_workers(&self, page: Page) -> Result<(Vec<Worker>, u64)>;
    async fn update_worker(&self, worker: &Worker) -> Result<()>;
    async fn set_worker_state(&self, id: i64, state: WorkerState) -> Result<Worker>;
    async fn set_worker_status(
        &self,
        id: i64,
        status: WorkerStatus,
        error_message: Option<String>,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<Worker>;
    async fn delete_worker(&self, id: i64) -> Result<()>;

    // --- users and sessions ---
    async fn create_user(&self, user: User) -> Result<User>;
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;
    async fn count_users(&self) -> Result<u64>;
    async fn touch_last_login(&self, user_id: i64) -> Result<()>;
    async fn create_session(
        &self,
        user_id: i64,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Session>;
    async fn get_session(&self, token: &str) -> Result<Option<Session>>;
    async fn delete_session(&self, token: &str) -> Result<()>;
    async fn purge_expired_sessions(&self) -> Result<u64>;

    // --- config ---
    async fn get_config(&self, category: &str) -> Result<HashMap<String, String>>;
    async fn set_config(&self, category: &str, values: &HashMap<String, String>) -> Result<()>;
}
