//! In-memory repository used by tests and the default dev profile.
//!
//! One `RwLock` over the whole store keeps the compare-and-set operations
//! trivially atomic.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::model::{
    Job, JobSpec, JobStatus, Queue, Session, User, Worker, WorkerState, WorkerStatus,
};

use super::{JobStatistics, NewQueue, NewSpec, Page, QueuePatch, Repository, SpecPatch};

#[derive(Default)]
struct Inner {
    specs: HashMap<i64, JobSpec>,
    next_spec_id: i64,
    jobs: HashMap<Uuid, Job>,
    queues: HashMap<i64, Queue>,
    next_queue_id: i64,
    workers: HashMap<i64, Worker>,
    next_worker_id: i64,
    assignments: HashSet<(i64, i64)>,
    users: HashMap<i64, User>,
    next_user_id: i64,
    sessions: HashMap<String, Session>,
    next_session_id: i64,
    config: HashMap<String, HashMap<String, String>>,
}

impl Inner {
    fn running_count(&self, worker_name: &str) -> u32 {
        self.jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running && j.assigned_worker.as_deref() == Some(worker_name)
            })
            .count() as u32
    }
}

#[derive(Default)]
pub struct MemoryRepository {
    inner: RwLock<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn paginate<T: Clone>(items: Vec<T>, page: Page) -> (Vec<T>, u64) {
    let total = items.len() as u64;
    let slice = items
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.limit() as usize)
        .collect();
    (slice, total)
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_spec(&self, spec: NewSpec) -> Result<JobSpec> {
        let mut inner = self.inner.write().unwrap();
        if inner.specs.values().any(|s| s.name == spec.name) {
            return Err(DispatchError::conflict(format!(
                "spec with name '{}' already exists",
                spec.name
            )));
        }
        inner.next_spec_id += 1;
        let now = Utc::now();
        let record = JobSpec {
            id: inner.next_spec_id,
            name: spec.name,
            description: spec.description,
            command: JobSpec::normalize_command(&spec.command),
            created_by: spec.created_by,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        inner.specs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_spec(&self, id: i64) -> Result<Option<JobSpec>> {
        Ok(self.inner.read().unwrap().specs.get(&id).cloned())
    }

    async fn get_spec_by_name(&self, name: &str) -> Result<Option<JobSpec>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .specs
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn list_specs(&self, page: Page) -> Result<(Vec<JobSpec>, u64)> {
        let mut specs: Vec<JobSpec> = self.inner.read().unwrap().specs.values().cloned().collect();
        specs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(paginate(specs, page))
    }

    async fn update_spec(&self, id: i64, patch: SpecPatch) -> Result<JobSpec> {
        let mut inner = self.inner.write().unwrap();
        if let Some(new_name) = &patch.name {
            if inner.specs.values().any(|s| s.id != id && &s.name == new_name) {
                return Err(DispatchError::conflict(format!(
                    "spec with name '{new_name}' already exists"
                )));
            }
        }
        let spec = inner
            .specs
            .get_mut(&id)
            .ok_or_else(|| DispatchError::not_found("spec", id))?;
        if let Some(name) = patch.name {
            spec.name = name;
        }
        if let Some(description) = patch.description {
            spec.description = Some(description);
        }
        if let Some(command) = patch.command {
            spec.command = JobSpec::normalize_command(&command);
        }
        if let Some(is_active) = patch.is_active {
            spec.is_active = is_active;
        }
        spec.updated_at = Utc::now();
        Ok(spec.clone())
    }

    async fn delete_spec(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.specs.remove(&id).is_none() {
            return Err(DispatchError::not_found("spec", id));
        }
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        self.inner.write().unwrap().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.read().unwrap().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, page: Page, exclude: &[JobStatus]) -> Result<(Vec<Job>, u64)> {
        let mut jobs: Vec<Job> = self
            .inner
            .read()
            .unwrap()
            .jobs
            .values()
            .filter(|j| !exclude.contains(&j.status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(paginate(jobs, page))
    }

    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .inner
            .read()
            .unwrap()
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn running_jobs_for_worker(&self, worker_name: &str) -> Result<Vec<Job>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running
                    && j.assigned_worker.as_deref() == Some(worker_name)
            })
            .cloned()
            .collect())
    }

    async fn count_running_for_worker(&self, worker_name: &str) -> Result<u32> {
        Ok(self.inner.read().unwrap().running_count(worker_name))
    }

    async fn oldest_pending_job(&self, queue_name: &str) -> Result<Option<Job>> {
        let inner = self.inner.read().unwrap();
        let mut pending: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.queue_name == queue_name)
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(pending.first().map(|j| (*j).clone()))
    }

    async fn count_pending_for_queue(&self, queue_name: &str) -> Result<u64> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.queue_name == queue_name)
            .count() as u64)
    }

    async fn count_jobs_for_spec(&self, spec_name: &str, status: JobStatus) -> Result<u64> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .jobs
            .values()
            .filter(|j| j.spec_name == spec_name && j.status == status)
            .count() as u64)
    }

    async fn reserve_job(&self, job_id: Uuid, worker: &Worker) -> Result<Option<Job>> {
        let mut inner = self.inner.write().unwrap();
        if inner.running_count(&worker.name) >= worker.max_jobs {
            return Ok(None);
        }
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        job.status = JobStatus::Running;
        job.assigned_worker = Some(worker.name.clone());
        job.started_at = Some(Utc::now());
        Ok(Some(job.clone()))
    }

    async fn release_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let mut inner = self.inner.write().unwrap();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Running {
            return Ok(None);
        }
        job.status = JobStatus::Pending;
        job.assigned_worker = None;
        job.started_at = None;
        job.progress = 0;
        Ok(Some(job.clone()))
    }

    async fn move_job(&self, job_id: Uuid, queue_name: &str) -> Result<Option<Job>> {
        let mut inner = self.inner.write().unwrap();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        job.queue_name = queue_name.to_string();
        Ok(Some(job.clone()))
    }

    async fn set_job_progress(&self, job_id: Uuid, progress: u8) -> Result<Option<Job>> {
        let mut inner = self.inner.write().unwrap();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        let progress = progress.min(100);
        if job.status != JobStatus::Running || progress <= job.progress {
            return Ok(None);
        }
        job.progress = progress;
        Ok(Some(job.clone()))
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: Option<Map<String, Value>>,
        error_message: Option<String>,
    ) -> Result<Option<Job>> {
        let mut inner = self.inner.write().unwrap();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if !status.is_terminal() || !job.status.can_transition_to(status) {
            return Ok(None);
        }
        job.status = status;
        job.result = result;
        job.error_message = error_message;
        job.completed_at = Some(Utc::now());
        if status == JobStatus::Completed {
            job.progress = 100;
        }
        Ok(Some(job.clone()))
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.jobs.remove(&id).is_none() {
            return Err(DispatchError::not_found("job", id));
        }
        Ok(())
    }

    async fn job_statistics(&self) -> Result<JobStatistics> {
        let inner = self.inner.read().unwrap();
        let mut by_status: HashMap<String, u64> = HashMap::new();
        let mut by_spec: HashMap<String, u64> = HashMap::new();
        for job in inner.jobs.values() {
            *by_status.entry(job.status.to_string()).or_insert(0) += 1;
            *by_spec.entry(job.spec_name.clone()).or_insert(0) += 1;
        }
        let mut by_spec: Vec<(String, u64)> = by_spec.into_iter().collect();
        by_spec.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(JobStatistics {
            total: inner.jobs.len() as u64,
            by_status,
            by_spec,
        })
    }

    async fn recover_interrupted_jobs(&self, reason: &str) -> Result<Vec<Job>> {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();
        let mut recovered = Vec::new();
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Failed;
                job.error_message = Some(reason.to_string());
                job.completed_at = Some(now);
                recovered.push(job.clone());
            }
        }
        Ok(recovered)
    }

    async fn terminal_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .jobs
            .values()
            .filter(|j| {
                j.status.is_terminal() && j.completed_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn create_queue(&self, queue: NewQueue) -> Result<Queue> {
        let mut inner = self.inner.write().unwrap();
        if inner.queues.values().any(|q| q.name == queue.name) {
            return Err(DispatchError::conflict(format!(
                "queue with name '{}' already exists",
                queue.name
            )));
        }
        if queue.is_default {
            for q in inner.queues.values_mut() {
                q.is_default = false;
            }
        }
        inner.next_queue_id += 1;
        let now = Utc::now();
        let record = Queue {
            id: inner.next_queue_id,
            name: queue.name,
            description: queue.description,
            priority: queue.priority,
            strategy: queue.strategy,
            state: queue.state,
            is_default: queue.is_default,
            time_limit_secs: queue.time_limit_secs,
            rr_cursor: 0,
            created_at: now,
            updated_at: now,
        };
        inner.queues.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_queue(&self, id: i64) -> Result<Option<Queue>> {
        Ok(self.inner.read().unwrap().queues.get(&id).cloned())
    }

    async fn get_queue_by_name(&self, name: &str) -> Result<Option<Queue>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .queues
            .values()
            .find(|q| q.name == name)
            .cloned())
    }

    async fn default_queue(&self) -> Result<Option<Queue>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .queues
            .values()
            .find(|q| q.is_default)
            .cloned())
    }

    async fn list_queues(&self, page: Page) -> Result<(Vec<Queue>, u64)> {
        let mut queues: Vec<Queue> =
            self.inner.read().unwrap().queues.values().cloned().collect();
        queues.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(paginate(queues, page))
    }

    async fn update_queue(&self, id: i64, patch: QueuePatch) -> Result<Queue> {
        let mut inner = self.inner.write().unwrap();
        if let Some(new_name) = &patch.name {
            if inner.queues.values().any(|q| q.id != id && &q.name == new_name) {
                return Err(DispatchError::conflict(format!(
                    "queue with name '{new_name}' already exists"
                )));
            }
        }
        if patch.is_default == Some(true) {
            for q in inner.queues.values_mut() {
                if q.id != id {
                    q.is_default = false;
                }
            }
        }
        let queue = inner
            .queues
            .get_mut(&id)
            .ok_or_else(|| DispatchError::not_found("queue", id))?;
        if let Some(name) = patch.name {
            queue.name = name;
        }
        if let Some(description) = patch.description {
            queue.description = Some(description);
        }
        if let Some(priority) = patch.priority {
            queue.priority = priority;
        }
        if let Some(strategy) = patch.strategy {
            queue.strategy = strategy;
        }
        if let Some(is_default) = patch.is_default {
            queue.is_default = is_default;
        }
        if let Some(limit) = patch.time_limit_secs {
            queue.time_limit_secs = limit;
        }
        queue.updated_at = Utc::now();
        Ok(queue.clone())
    }

    async fn set_queue_state(&self, id: i64, state: crate::model::QueueState) -> Result<Queue> {
        let mut inner = self.inner.write().unwrap();
        let queue = inner
            .queues
            .get_mut(&id)
            .ok_or_else(|| DispatchError::not_found("queue", id))?;
        queue.state = state;
        queue.updated_at = Utc::now();
        Ok(queue.clone())
    }

    async fn advance_rr_cursor(&self, id: i64) -> Result<u32> {
        let mut inner = self.inner.write().unwrap();
        let queue = inner
            .queues
            .get_mut(&id)
            .ok_or_else(|| DispatchError::not_found("queue", id))?;
        let cursor = queue.rr_cursor;
        queue.rr_cursor = queue.rr_cursor.wrapping_add(1);
        Ok(cursor)
    }

    async fn delete_queue(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.queues.remove(&id).is_none() {
            return Err(DispatchError::not_found("queue", id));
        }
        inner.assignments.retain(|(q, _)| *q != id);
        Ok(())
    }

    async fn assign_worker_to_queue(&self, queue_id: i64, worker_id: i64) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        if !inner.queues.contains_key(&queue_id) {
            return Err(DispatchError::not_found("queue", queue_id));
        }
        if !inner.workers.contains_key(&worker_id) {
            return Err(DispatchError::not_found("worker", worker_id));
        }
        Ok(inner.assignments.insert((queue_id, worker_id)))
    }

    async fn unassign_worker_from_queue(&self, queue_id: i64, worker_id: i64) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .unwrap()
            .assignments
            .remove(&(queue_id, worker_id)))
    }

    async fn queue_workers(&self, queue_id: i64) -> Result<Vec<Worker>> {
        let inner = self.inner.read().unwrap();
        let mut workers: Vec<Worker> = inner
            .assignments
            .iter()
            .filter(|(q, _)| *q == queue_id)
            .filter_map(|(_, w)| inner.workers.get(w).cloned())
            .collect();
        workers.sort_by_key(|w| w.id);
        Ok(workers)
    }

    async fn unassigned_workers(&self, queue_id: i64) -> Result<Vec<Worker>> {
        let inner = self.inner.read().unwrap();
        let assigned: HashSet<i64> = inner
            .assignments
            .iter()
            .filter(|(q, _)| *q == queue_id)
            .map(|(_, w)| *w)
            .collect();
        let mut workers: Vec<Worker> = inner
            .workers
            .values()
            .filter(|w| !assigned.contains(&w.id))
            .cloned()
            .collect();
        workers.sort_by_key(|w| w.id);
        Ok(workers)
    }

    async fn create_worker(&self, mut worker: Worker) -> Result<Worker> {
        let mut inner = self.inner.write().unwrap();
        if inner.workers.values().any(|w| w.name == worker.name) {
            return Err(DispatchError::conflict(format!(
                "worker with name '{}' already exists",
                worker.name
            )));
        }
        inner.next_worker_id += 1;
        worker.id = inner.next_worker_id;
        inner.workers.insert(worker.id, worker.clone());
        Ok(worker)
    }

    async fn get_worker(&self, id: i64) -> Result<Option<Worker>> {
        Ok(self.inner.read().unwrap().workers.get(&id).cloned())
    }

    async fn get_worker_by_name(&self, name: &str) -> Result<Option<Worker>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .workers
            .values()
            .find(|w| w.name == name)
            .cloned())
    }

    async fn list_workers(&self, page: Page) -> Result<(Vec<Worker>, u64)> {
        let mut workers: Vec<Worker> =
            self.inner.read().unwrap().workers.values().cloned().collect();
        workers.sort_by_key(|w| w.id);
        Ok(paginate(workers, page))
    }

    async fn update_worker(&self, worker: &Worker) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner
            .workers
            .values()
            .any(|w| w.id != worker.id && w.name == worker.name)
        {
            return Err(DispatchError::conflict(format!(
                "worker with name '{}' already exists",
                worker.name
            )));
        }
        let slot = inner
            .workers
            .get_mut(&worker.id)
            .ok_or_else(|| DispatchError::not_found("worker", worker.id))?;
        let mut updated = worker.clone();
        updated.updated_at = Utc::now();
        *slot = updated;
        Ok(())
    }

    async fn set_worker_state(&self, id: i64, state: WorkerState) -> Result<Worker> {
        let mut inner = self.inner.write().unwrap();
        let worker = inner
            .workers
            .get_mut(&id)
            .ok_or_else(|| DispatchError::not_found("worker", id))?;
        worker.state = state;
        worker.updated_at = Utc::now();
        Ok(worker.clone())
    }

    async fn set_worker_status(
        &self,
        id: i64,
        status: WorkerStatus,
        error_message: Option<String>,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<Worker> {
        let mut inner = self.inner.write().unwrap();
        let worker = inner
            .workers
            .get_mut(&id)
            .ok_or_else(|| DispatchError::not_found("worker", id))?;
        worker.status = status;
        worker.error_message = error_message;
        if last_seen.is_some() {
            worker.last_seen = last_seen;
        }
        worker.updated_at = Utc::now();
        Ok(worker.clone())
    }

    async fn delete_worker(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.workers.remove(&id).is_none() {
            return Err(DispatchError::not_found("worker", id));
        }
        inner.assignments.retain(|(_, w)| *w != id);
        Ok(())
    }

    async fn create_user(&self, mut user: User) -> Result<User> {
        let mut inner = self.inner.write().unwrap();
        if inner.users.values().any(|u| u.username == user.username) {
            return Err(DispatchError::conflict(format!(
                "user '{}' already exists",
                user.username
            )));
        }
        inner.next_user_id += 1;
        user.id = inner.next_user_id;
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn count_users(&self) -> Result<u64> {
        Ok(self.inner.read().unwrap().users.len() as u64)
    }

    async fn touch_last_login(&self, user_id: i64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.last_login = Some(Utc::now());
        }
        Ok(())
    }

    async fn create_session(
        &self,
        user_id: i64,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Session> {
        let mut inner = self.inner.write().unwrap();
        inner.next_session_id += 1;
        let session = Session {
            id: inner.next_session_id,
            user_id,
            token: token.to_string(),
            expires_at,
            created_at: Utc::now(),
        };
        inner.sessions.insert(token.to_string(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, token: &str) -> Result<Option<Session>> {
        Ok(self.inner.read().unwrap().sessions.get(token).cloned())
    }

    async fn delete_session(&self, token: &str) -> Result<()> {
        self.inner.write().unwrap().sessions.remove(token);
        Ok(())
    }

    async fn purge_expired_sessions(&self) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| !s.is_expired(now));
        Ok((before - inner.sessions.len()) as u64)
    }

    async fn get_config(&self, category: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .config
            .get(category)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_config(&self, category: &str, values: &HashMap<String, String>) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .config
            .entry(category.to_string())
            .or_default()
            .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}
