//! Job lifecycle controller: pending -> running -> terminal, with
//! cancel/retry/move/delete and the event intake from workers.
//!
//! The assigned worker is the sole authority for progress, log lines, and
//! terminal status of a Running job; this controller persists what the
//! worker reports and fans it out.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::events::{EventBus, LogKind};
use crate::logstore::LogStore;
use crate::model::{Job, JobStatus, QueueState};
use crate::repo::{JobStatistics, Page, Repository};
use crate::transport::WorkerClient;

pub struct JobController {
    repo: Arc<dyn Repository>,
    bus: EventBus,
    logs: Arc<LogStore>,
    client: WorkerClient,
}

impl JobController {
    pub fn new(
        repo: Arc<dyn Repository>,
        bus: EventBus,
        logs: Arc<LogStore>,
        client: WorkerClient,
    ) -> Self {
        Self {
            repo,
            bus,
            logs,
            client,
        }
    }

    /// Create a Pending job for the named spec. Falls back to the default
    /// queue when none is given.
    pub async fn run(
        &self,
        spec_name: &str,
        runtime_args: Map<String, Value>,
        created_by: Option<String>,
        queue_name: Option<String>,
    ) -> Result<Job> {
        let spec = self
            .repo
            .get_spec_by_name(spec_name)
            .await?
            .ok_or_else(|| DispatchError::not_found("spec", spec_name))?;
        if !spec.is_active {
            return Err(DispatchError::validation(format!(
                "spec '{spec_name}' is inactive"
            )));
        }

        let queue = match queue_name {
            Some(name) => self
                .repo
                .get_queue_by_name(&name)
                .await?
                .ok_or_else(|| DispatchError::not_found("queue", name))?,
            None => self
                .repo
                .default_queue()
                .await?
                .ok_or(DispatchError::NoDefaultQueue)?,
        };
        if !queue.state.accepts_intake() {
            return Err(DispatchError::conflict(format!(
                "queue '{}' is {} and cannot accept new jobs",
                queue.name, queue.state
            )));
        }

        let job = Job::new(
            spec.name.clone(),
            queue.name.clone(),
            runtime_args,
            created_by,
        );
        self.repo.insert_job(&job).await?;
        self.append_log(&job.id, &format!("Job created on queue '{}'", queue.name))
            .await;
        tracing::info!(job_id = %job.id, spec = %spec.name, queue = %queue.name, "Job created");
        self.bus.publish_job(job.clone());
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<Job> {
        self.repo
            .get_job(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("job", id))
    }

    pub async fn list(&self, page: Page, exclude: &[JobStatus]) -> Result<(Vec<Job>, u64)> {
        self.repo.list_jobs(page, exclude).await
    }

    pub async fn statistics(&self) -> Result<JobStatistics> {
        self.repo.job_statistics().await
    }

    /// Cancel a job. Pending jobs go straight to Cancelled; for Running
    /// jobs the cancel is forwarded to the assigned worker, whose terminal
    /// report is authoritative.
    pub async fn cancel(&self, id: Uuid) -> Result<Job> {
        let job = self.get(id).await?;
        match job.status {
            JobStatus::Pending => {
                let cancelled = self
                    .repo
                    .finish_job(
                        id,
                        JobStatus::Cancelled,
                        None,
                        Some("cancelled before dispatch".to_string()),
                    )
                    .await?
                    .ok_or(DispatchError::NotCancellable)?;
                self.append_log(&id, "Job cancelled before dispatch").await;
                self.bus.publish_job(cancelled.clone());
                Ok(cancelled)
            }
            JobStatus::Running => {
                let worker_name = job
                    .assigned_worker
                    .clone()
                    .ok_or_else(|| DispatchError::conflict("running job has no worker"))?;
                let worker = self
                    .repo
                    .get_worker_by_name(&worker_name)
                    .await?
                    .ok_or_else(|| DispatchError::not_found("worker", worker_name))?;
                self.client.cancel(&worker, id).await?;
                self.append_log(&id, &format!("Cancel requested on worker '{}'", worker.name))
                    .await;
                tracing::info!(job_id = %id, worker = %worker.name, "Cancel forwarded to worker");
                // Status stays Running until the worker reports a terminal
                // state over its event stream.
                Ok(job)
            }
            _ => Err(DispatchError::NotCancellable),
        }
    }

    /// Retry a terminal, non-Completed job: a new Pending job is created
    /// with the same spec and verbatim runtime args; the old job is left
    /// untouched.
    pub async fn retry(&self, id: Uuid) -> Result<Job> {
        let job = self.get(id).await?;
        if !job.status.is_terminal() {
            return Err(DispatchError::conflict(
                "only finished jobs can be retried",
            ));
        }
        if job.status == JobStatus::Completed {
            return Err(DispatchError::conflict(
                "completed jobs cannot be retried",
            ));
        }
        let retry = Job::new(
            job.spec_name.clone(),
            job.queue_name.clone(),
            job.runtime_args.clone(),
            job.created_by.clone(),
        );
        self.repo.insert_job(&retry).await?;
        self.append_log(&retry.id, &format!("Retry of job {id}")).await;
        tracing::info!(job_id = %retry.id, original = %id, "Job retried");
        self.bus.publish_job(retry.clone());
        Ok(retry)
    }

    /// Move a Pending job to another queue.
    pub async fn move_to_queue(&self, id: Uuid, queue_name: &str) -> Result<Job> {
        let queue = self
            .repo
            .get_queue_by_name(queue_name)
            .await?
            .ok_or_else(|| DispatchError::not_found("queue", queue_name))?;
        if queue.state == QueueState::Stopped {
            return Err(DispatchError::conflict(format!(
                "queue '{}' is stopped and cannot accept jobs",
                queue.name
            )));
        }
        let moved = self
            .repo
            .move_job(id, &queue.name)
            .await?
            .ok_or_else(|| {
                DispatchError::conflict("only pending jobs can be moved between queues")
            })?;
        self.append_log(&id, &format!("Moved to queue '{}'", queue.name))
            .await;
        self.bus.publish_job(moved.clone());
        Ok(moved)
    }

    /// Delete a terminal job together with its log artifacts.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let job = self.get(id).await?;
        if !job.status.is_terminal() {
            return Err(DispatchError::conflict(
                "only finished jobs can be deleted",
            ));
        }
        self.repo.delete_job(id).await?;
        self.logs.remove(LogKind::Job, &id.to_string()).await?;
        tracing::info!(job_id = %id, "Job deleted");
        Ok(())
    }

    // --- worker event intake ---

    pub async fn ingest_log(&self, id: Uuid, line: &str) {
        self.append_log(&id, line).await;
    }

    /// Progress is monotonic while Running; stale or out-of-state writes
    /// are dropped.
    pub async fn ingest_progress(&self, id: Uuid, progress: u8) -> Result<()> {
        if let Some(job) = self.repo.set_job_progress(id, progress).await? {
            self.bus.publish_job(job);
        }
        Ok(())
    }

    /// Terminal report from the assigned worker. Terminal states are
    /// absorbing: a second report for the same job is ignored.
    pub async fn ingest_terminal(
        &self,
        id: Uuid,
        status: JobStatus,
        result: Option<Map<String, Value>>,
        error_message: Option<String>,
    ) -> Result<()> {
        let Some(job) = self
            .repo
            .finish_job(id, status, result, error_message)
            .await?
        else {
            tracing::debug!(job_id = %id, status = %status, "terminal report ignored");
            return Ok(());
        };
        self.append_log(&id, &format!("Job finished: {status}")).await;
        tracing::info!(job_id = %id, status = %status, "Job finished");
        self.bus.publish_job(job);
        Ok(())
    }

    /// Age-based sweep of terminal jobs; returns the number deleted.
    pub async fn sweep_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        let expired = self.repo.terminal_jobs_before(cutoff).await?;
        let mut deleted = 0;
        for job in expired {
            self.repo.delete_job(job.id).await?;
            self.logs.remove(LogKind::Job, &job.id.to_string()).await?;
            deleted += 1;
        }
        if deleted > 0 {
            tracing::info!(deleted, "Swept aged-out terminal jobs");
        }
        Ok(deleted)
    }

    async fn append_log(&self, id: &Uuid, line: &str) {
        let key = id.to_string();
        if let Err(e) = self.logs.append(LogKind::Job, &key, line).await {
            tracing::error!(job_id = %id, error = %e, "Failed to write job log");
        }
        self.bus.publish_log(LogKind::Job, key, line);
    }
}
