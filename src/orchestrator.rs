//! Orchestrator assembly: wires the repository, event bus, managers, and
//! controller together, runs the long-lived loops, and owns startup
//! recovery and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState};
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::jobs::JobController;
use crate::logstore::LogStore;
use crate::model::JobStatus;
use crate::queues::{Dispatcher, QueueManager};
use crate::repo::Repository;
use crate::transport::WorkerClient;
use crate::workers::monitor::MonitorInterval;
use crate::workers::{DeploymentRegistry, HealthMonitor, WorkerManager};

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);
const RETENTION_SWEEP_PERIOD: Duration = Duration::from_secs(3600);

pub struct Orchestrator {
    state: AppState,
    monitor: Arc<HealthMonitor>,
    dispatcher: Arc<Dispatcher>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, repo: Arc<dyn Repository>) -> Result<Self> {
        config.validate()?;
        let bus = EventBus::new();
        let logs = Arc::new(LogStore::new(config.log_root.clone()));
        let client = WorkerClient::new();
        let deployments = Arc::new(DeploymentRegistry::new());

        let jobs = Arc::new(JobController::new(
            repo.clone(),
            bus.clone(),
            logs.clone(),
            client.clone(),
        ));
        let queues = Arc::new(QueueManager::new(repo.clone(), bus.clone(), logs.clone()));
        let workers = Arc::new(WorkerManager::new(
            repo.clone(),
            bus.clone(),
            logs.clone(),
            client.clone(),
            config.clone(),
            deployments.clone(),
        ));
        let monitor_interval = MonitorInterval::new(config.monitor_interval_secs);
        let monitor = Arc::new(HealthMonitor::new(
            repo.clone(),
            bus.clone(),
            logs.clone(),
            client.clone(),
            monitor_interval.clone(),
            workers.processes(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            repo.clone(),
            bus.clone(),
            logs.clone(),
            client.clone(),
            jobs.clone(),
        ));

        let state = AppState {
            repo,
            bus,
            logs,
            jobs,
            queues,
            workers,
            deployments,
            monitor_interval,
            config,
        };
        Ok(Self {
            state,
            monitor,
            dispatcher,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Startup recovery and invariants: the System worker exists, jobs
    /// left Running by a previous process become Failed, and the stored
    /// monitoring interval is applied.
    pub async fn prepare(&self) -> Result<()> {
        self.state.workers.ensure_system_worker().await?;

        let recovered = self
            .state
            .repo
            .recover_interrupted_jobs("OrchestratorShutdown")
            .await?;
        if !recovered.is_empty() {
            tracing::warn!(
                count = recovered.len(),
                "Recovered jobs interrupted by previous shutdown"
            );
            for job in recovered {
                self.state.bus.publish_job(job);
            }
        }

        let stored = self.state.repo.get_config("monitoring").await?;
        if let Some(interval) = stored.get("interval").and_then(|v| v.parse().ok()) {
            if (crate::config::MONITOR_INTERVAL_MIN_SECS
                ..=crate::config::MONITOR_INTERVAL_MAX_SECS)
                .contains(&interval)
            {
                self.state.monitor_interval.set(interval);
            }
        }
        Ok(())
    }

    /// Run all subsystems until the token is cancelled, then drain.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        self.prepare().await?;

        let dispatcher = self.dispatcher.clone();
        let dispatch_cancel = cancel.clone();
        let dispatch_handle = tokio::spawn(async move {
            dispatcher.run(dispatch_cancel).await;
        });

        let monitor = self.monitor.clone();
        let monitor_cancel = cancel.clone();
        let monitor_handle = tokio::spawn(async move {
            monitor.run(monitor_cancel).await;
        });

        if self.state.config.retention_days > 0 {
            let jobs = self.state.jobs.clone();
            let days = self.state.config.retention_days;
            let sweep_cancel = cancel.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(RETENTION_SWEEP_PERIOD);
                loop {
                    tokio::select! {
                        _ = sweep_cancel.cancelled() => break,
                        _ = tick.tick() => {}
                    }
                    if let Err(e) = jobs.sweep_older_than(days).await {
                        tracing::error!(error = %e, "Retention sweep failed");
                    }
                }
            });
        }

        let state = self.state.clone();
        let serve_result = api::serve(state, cancel.clone()).await;

        // Shutdown: stop the loops, then wait briefly for in-flight jobs'
        // terminal events. Whatever is still Running is recovered as
        // Failed on the next startup.
        cancel.cancel();
        let repo = self.state.repo.clone();
        let drained = crate::shutdown::wait_for_drain(SHUTDOWN_DRAIN, || {
            let repo = repo.clone();
            async move {
                repo.jobs_with_status(JobStatus::Running)
                    .await
                    .map(|jobs| jobs.is_empty())
                    .unwrap_or(true)
            }
        })
        .await;
        if !drained {
            tracing::warn!("Shutdown drain timed out with jobs still running");
        }
        let _ = dispatch_handle.await;
        let _ = monitor_handle.await;
        tracing::info!("Orchestrator stopped");
        serve_result
    }
}
