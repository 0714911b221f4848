//! Worker health monitor.
//!
//! One loop with a configurable period (5-300 s) probes every worker whose
//! state is started or paused. A successful probe refreshes `last_seen`
//! and clears any error; the third consecutive miss flips the worker
//! offline and wakes the dispatcher so undelivered assignments get
//! reconsidered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, LogKind};
use crate::logstore::LogStore;
use crate::model::{WorkerState, WorkerStatus};
use crate::repo::{Page, Repository};
use crate::transport::WorkerClient;
use crate::workers::LocalProcesses;

/// Consecutive probe misses before a worker is marked offline.
const OFFLINE_AFTER_MISSES: u32 = 3;

/// Shared, hot-swappable monitor period.
#[derive(Clone)]
pub struct MonitorInterval(Arc<AtomicU64>);

impl MonitorInterval {
    pub fn new(secs: u64) -> Self {
        Self(Arc::new(AtomicU64::new(secs)))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, secs: u64) {
        self.0.store(secs, Ordering::Relaxed);
    }
}

pub struct HealthMonitor {
    repo: Arc<dyn Repository>,
    bus: EventBus,
    logs: Arc<LogStore>,
    client: WorkerClient,
    interval: MonitorInterval,
    processes: LocalProcesses,
    misses: Mutex<HashMap<i64, u32>>,
}

impl HealthMonitor {
    pub fn new(
        repo: Arc<dyn Repository>,
        bus: EventBus,
        logs: Arc<LogStore>,
        client: WorkerClient,
        interval: MonitorInterval,
        processes: LocalProcesses,
    ) -> Self {
        Self {
            repo,
            bus,
            logs,
            client,
            interval,
            processes,
            misses: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(interval_secs = self.interval.get(), "Worker health monitor started");
        loop {
            let period = std::time::Duration::from_secs(self.interval.get().max(1));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            if let Err(e) = self.check_all().await {
                tracing::error!(error = %e, "Health monitor cycle failed");
            }
        }
        tracing::info!("Worker health monitor stopped");
    }

    pub async fn check_all(&self) -> crate::error::Result<()> {
        // Local workers whose child process died are stopped outright; no
        // point probing a dead process over HTTP.
        for (worker_id, exit_code) in self.processes.reap_exited() {
            if let Ok(Some(worker)) = self.repo.get_worker(worker_id).await {
                tracing::warn!(worker = %worker.name, exit_code = ?exit_code, "Worker process exited");
                let _ = self.repo.set_worker_state(worker_id, WorkerState::Stopped).await;
                if let Ok(updated) = self
                    .repo
                    .set_worker_status(
                        worker_id,
                        WorkerStatus::Offline,
                        Some(format!("worker process exited (code {exit_code:?})")),
                        None,
                    )
                    .await
                {
                    self.worker_log(&updated, "Worker process exited").await;
                    self.bus.publish_worker(updated);
                }
                self.bus.nudge_dispatcher();
            }
        }

        let (workers, _) = self
            .repo
            .list_workers(Page {
                page: 1,
                per_page: 500,
            })
            .await?;
        for worker in workers {
            if !matches!(worker.state, WorkerState::Started | WorkerState::Paused) {
                continue;
            }
            match self.client.health(&worker).await {
                Ok(()) => {
                    self.misses.lock().unwrap().remove(&worker.id);
                    if worker.status != WorkerStatus::Online
                        || worker.error_message.is_some()
                    {
                        let updated = self
                            .repo
                            .set_worker_status(
                                worker.id,
                                WorkerStatus::Online,
                                None,
                                Some(Utc::now()),
                            )
                            .await?;
                        self.worker_log(&updated, "Worker back online").await;
                        self.bus.publish_worker(updated);
                        self.bus.nudge_dispatcher();
                    } else {
                        // Quiet refresh of last_seen.
                        self.repo
                            .set_worker_status(
                                worker.id,
                                WorkerStatus::Online,
                                None,
                                Some(Utc::now()),
                            )
                            .await?;
                    }
                }
                Err(e) => {
                    let miss_count = {
                        let mut misses = self.misses.lock().unwrap();
                        let count = misses.entry(worker.id).or_insert(0);
                        *count += 1;
                        *count
                    };
                    tracing::debug!(
                        worker = %worker.name,
                        miss_count,
                        error = %e,
                        "Health probe missed"
                    );
                    if miss_count >= OFFLINE_AFTER_MISSES
                        && worker.status != WorkerStatus::Offline
                    {
                        let updated = self
                            .repo
                            .set_worker_status(
                                worker.id,
                                WorkerStatus::Offline,
                                Some(format!(
                                    "health probe failed {miss_count} times: {e}"
                                )),
                                None,
                            )
                            .await?;
                        self.worker_log(
                            &updated,
                            &format!("Worker offline after {miss_count} missed probes"),
                        )
                        .await;
                        tracing::warn!(worker = %updated.name, "Worker marked offline");
                        self.bus.publish_worker(updated);
                        self.bus.nudge_dispatcher();
                    }
                }
            }
        }
        Ok(())
    }

    async fn worker_log(&self, worker: &crate::model::Worker, line: &str) {
        let key = worker.id.to_string();
        if let Err(e) = self.logs.append(LogKind::Worker, &key, line).await {
            tracing::error!(worker = %worker.name, error = %e, "Failed to write worker log");
        }
        self.bus.publish_log(LogKind::Worker, key, line);
    }
}
