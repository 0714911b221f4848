//! Queue management: CRUD, the queue state machine, and worker
//! assignments. The dispatch loop lives in [`dispatcher`].

pub mod dispatcher;

use std::sync::Arc;

use crate::error::{DispatchError, Result};
use crate::events::{EventBus, LogKind};
use crate::logstore::LogStore;
use crate::model::{Queue, QueueState, Worker};
use crate::repo::{NewQueue, Page, QueuePatch, Repository};

pub use dispatcher::Dispatcher;

pub struct QueueManager {
    repo: Arc<dyn Repository>,
    bus: EventBus,
    logs: Arc<LogStore>,
}

impl QueueManager {
    pub fn new(repo: Arc<dyn Repository>, bus: EventBus, logs: Arc<LogStore>) -> Self {
        Self { repo, bus, logs }
    }

    pub async fn create(&self, queue: NewQueue) -> Result<Queue> {
        if queue.name.trim().is_empty() {
            return Err(DispatchError::validation("queue name must not be empty"));
        }
        let created = self.repo.create_queue(queue).await?;
        self.log(&created, "Queue created").await;
        tracing::info!(queue = %created.name, priority = %created.priority, "Queue created");
        self.bus.publish_queue(created.clone());
        Ok(created)
    }

    pub async fn get(&self, id: i64) -> Result<Queue> {
        self.repo
            .get_queue(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("queue", id))
    }

    pub async fn list(&self, page: Page) -> Result<(Vec<Queue>, u64)> {
        self.repo.list_queues(page).await
    }

    pub async fn update(&self, id: i64, patch: QueuePatch) -> Result<Queue> {
        let updated = self.repo.update_queue(id, patch).await?;
        self.bus.publish_queue(updated.clone());
        Ok(updated)
    }

    /// Delete a queue. Refused for the default queue and while Pending
    /// jobs still reference it. Running jobs keep their workers.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let queue = self.get(id).await?;
        if queue.is_default {
            return Err(DispatchError::conflict("cannot delete the default queue"));
        }
        let pending = self.repo.count_pending_for_queue(&queue.name).await?;
        if pending > 0 {
            return Err(DispatchError::conflict(format!(
                "queue '{}' still has {pending} pending job(s)",
                queue.name
            )));
        }
        self.repo.delete_queue(id).await?;
        self.logs.remove(LogKind::Queue, &id.to_string()).await?;
        tracing::info!(queue = %queue.name, "Queue deleted");
        Ok(())
    }

    pub async fn start(&self, id: i64) -> Result<Queue> {
        self.set_state(id, QueueState::Started).await
    }

    pub async fn stop(&self, id: i64) -> Result<Queue> {
        self.set_state(id, QueueState::Stopped).await
    }

    pub async fn pause(&self, id: i64) -> Result<Queue> {
        self.set_state(id, QueueState::Paused).await
    }

    async fn set_state(&self, id: i64, state: QueueState) -> Result<Queue> {
        let queue = self.repo.set_queue_state(id, state).await?;
        self.log(&queue, &format!("Queue {state}")).await;
        tracing::info!(queue = %queue.name, state = %state, "Queue state changed");
        self.bus.publish_queue(queue.clone());
        Ok(queue)
    }

    // --- worker assignments ---

    pub async fn assign_worker(&self, queue_id: i64, worker_id: i64) -> Result<bool> {
        let added = self.repo.assign_worker_to_queue(queue_id, worker_id).await?;
        if added {
            let queue = self.get(queue_id).await?;
            self.log(&queue, &format!("Worker {worker_id} assigned")).await;
            tracing::info!(queue = %queue.name, worker_id, "Worker assigned to queue");
            self.bus.publish_queue(queue);
        }
        Ok(added)
    }

    pub async fn assign_workers(&self, queue_id: i64, worker_ids: &[i64]) -> Result<usize> {
        let mut added = 0;
        for worker_id in worker_ids {
            // Unknown workers in a bulk request are skipped, not fatal.
            match self.repo.assign_worker_to_queue(queue_id, *worker_id).await {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(DispatchError::NotFound("worker", _)) => {}
                Err(e) => return Err(e),
            }
        }
        if added > 0 {
            let queue = self.get(queue_id).await?;
            self.log(&queue, &format!("{added} worker(s) assigned")).await;
            self.bus.publish_queue(queue);
        }
        Ok(added)
    }

    /// Removing an assignment never aborts jobs already running on that
    /// worker for this queue.
    pub async fn unassign_worker(&self, queue_id: i64, worker_id: i64) -> Result<bool> {
        let removed = self
            .repo
            .unassign_worker_from_queue(queue_id, worker_id)
            .await?;
        if removed {
            let queue = self.get(queue_id).await?;
            self.log(&queue, &format!("Worker {worker_id} unassigned")).await;
            self.bus.publish_queue(queue);
        }
        Ok(removed)
    }

    pub async fn assigned_workers(&self, queue_id: i64) -> Result<Vec<Worker>> {
        self.get(queue_id).await?;
        self.repo.queue_workers(queue_id).await
    }

    pub async fn assignable_workers(&self, queue_id: i64) -> Result<Vec<Worker>> {
        self.get(queue_id).await?;
        self.repo.unassigned_workers(queue_id).await
    }

    async fn log(&self, queue: &Queue, line: &str) {
        let key = queue.id.to_string();
        if let Err(e) = self.logs.append(LogKind::Queue, &key, line).await {
            tracing::error!(queue = %queue.name, error = %e, "Failed to write queue log");
        }
        self.bus.publish_log(LogKind::Queue, key, line);
    }
}
