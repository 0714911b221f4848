//! Worker management: CRUD, the worker state machine, local process
//! spawning, and the hooks into health monitoring and remote provisioning.

pub mod monitor;
pub mod provision;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{DispatchError, Result};
use crate::events::{EventBus, LogKind};
use crate::logstore::LogStore;
use crate::model::{
    AuthMethod, JobStatus, Worker, WorkerKind, WorkerState, WorkerStatus, SYSTEM_WORKER,
};
use crate::repo::{Page, Repository};
use crate::transport::WorkerClient;

pub use monitor::HealthMonitor;
pub use provision::{DeploymentRegistry, DeploymentStatus};

/// Child processes of locally spawned workers, shared with the health
/// monitor so it can observe process exits.
#[derive(Clone, Default)]
pub struct LocalProcesses(Arc<Mutex<HashMap<i64, Child>>>);

impl LocalProcesses {
    pub fn insert(&self, worker_id: i64, child: Child) {
        self.0.lock().unwrap().insert(worker_id, child);
    }

    pub fn remove(&self, worker_id: i64) -> Option<Child> {
        self.0.lock().unwrap().remove(&worker_id)
    }

    /// Ids of tracked workers whose child process has exited.
    pub fn reap_exited(&self) -> Vec<(i64, Option<i32>)> {
        let mut exited = Vec::new();
        let mut map = self.0.lock().unwrap();
        map.retain(|worker_id, child| match child.try_wait() {
            Ok(Some(status)) => {
                exited.push((*worker_id, status.code()));
                false
            }
            Ok(None) => true,
            Err(_) => {
                exited.push((*worker_id, None));
                false
            }
        });
        exited
    }
}

/// Parameters for registering a worker.
#[derive(Debug, Clone)]
pub struct NewWorker {
    pub name: String,
    pub kind: WorkerKind,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub port: u16,
    pub ssh_user: Option<String>,
    pub auth_method: Option<AuthMethod>,
    pub ssh_private_key: Option<String>,
    pub password: Option<String>,
    pub provision: bool,
    pub max_jobs: u32,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerPatch {
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub port: Option<u16>,
    pub max_jobs: Option<u32>,
}

pub struct WorkerManager {
    repo: Arc<dyn Repository>,
    bus: EventBus,
    logs: Arc<LogStore>,
    client: WorkerClient,
    config: OrchestratorConfig,
    processes: LocalProcesses,
    deployments: Arc<DeploymentRegistry>,
}

impl WorkerManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        bus: EventBus,
        logs: Arc<LogStore>,
        client: WorkerClient,
        config: OrchestratorConfig,
        deployments: Arc<DeploymentRegistry>,
    ) -> Self {
        Self {
            repo,
            bus,
            logs,
            client,
            config,
            processes: LocalProcesses::default(),
            deployments,
        }
    }

    pub fn processes(&self) -> LocalProcesses {
        self.processes.clone()
    }

    /// Create the reserved System worker if it does not exist yet.
    pub async fn ensure_system_worker(&self) -> Result<Worker> {
        if let Some(worker) = self.repo.get_worker_by_name(SYSTEM_WORKER).await? {
            return Ok(worker);
        }
        let now = Utc::now();
        let worker = self
            .repo
            .create_worker(Worker {
                id: 0,
                name: SYSTEM_WORKER.to_string(),
                kind: WorkerKind::Local,
                hostname: Some("localhost".to_string()),
                ip_address: Some("127.0.0.1".to_string()),
                port: free_local_port(),
                ssh_user: None,
                auth_method: None,
                ssh_private_key: None,
                password: None,
                provision: false,
                max_jobs: 4,
                status: WorkerStatus::Offline,
                state: WorkerState::Stopped,
                last_seen: None,
                error_message: None,
                created_at: now,
                updated_at: now,
            })
            .await?;
        tracing::info!(worker = %worker.name, "System worker created");
        Ok(worker)
    }

    /// Register a worker. Remote workers with `provision=true` get a
    /// background deployment whose id is returned for status polling.
    pub async fn register(&self, new: NewWorker) -> Result<(Worker, Option<Uuid>)> {
        if new.name.trim().is_empty() {
            return Err(DispatchError::validation("worker name must not be empty"));
        }
        if new.max_jobs == 0 {
            return Err(DispatchError::validation("max_jobs must be at least 1"));
        }
        if new.kind == WorkerKind::Remote
            && new.hostname.is_none()
            && new.ip_address.is_none()
        {
            return Err(DispatchError::validation(
                "remote workers need a hostname or ip address",
            ));
        }
        let provision = new.provision && new.kind == WorkerKind::Remote;
        let now = Utc::now();
        let worker = self
            .repo
            .create_worker(Worker {
                id: 0,
                name: new.name,
                kind: new.kind,
                hostname: new.hostname,
                ip_address: new.ip_address,
                port: new.port,
                ssh_user: new.ssh_user,
                auth_method: new.auth_method,
                ssh_private_key: new.ssh_private_key,
                password: new.password,
                provision,
                max_jobs: new.max_jobs,
                status: if provision {
                    WorkerStatus::Provisioning
                } else {
                    WorkerStatus::Offline
                },
                state: WorkerState::Stopped,
                last_seen: None,
                error_message: None,
                created_at: now,
                updated_at: now,
            })
            .await?;
        self.log(&worker, "Worker registered").await;
        tracing::info!(worker = %worker.name, kind = %worker.kind, "Worker registered");
        self.bus.publish_worker(worker.clone());

        let deployment_id = if provision {
            Some(self.spawn_provisioning(worker.clone()))
        } else {
            None
        };
        Ok((worker, deployment_id))
    }

    fn spawn_provisioning(&self, worker: Worker) -> Uuid {
        let deployment_id = self.deployments.begin(&worker.name);
        let provisioner = provision::Provisioner::new(
            self.repo.clone(),
            self.bus.clone(),
            self.logs.clone(),
            self.client.clone(),
            self.deployments.clone(),
            self.config.clone(),
        );
        tokio::spawn(async move {
            provisioner.deploy(worker, deployment_id).await;
        });
        deployment_id
    }

    pub async fn get(&self, id: i64) -> Result<Worker> {
        self.repo
            .get_worker(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("worker", id))
    }

    pub async fn list(&self, page: Page) -> Result<(Vec<Worker>, u64)> {
        self.repo.list_workers(page).await
    }

    /// Current load of a worker, derived from Running jobs.
    pub async fn current_jobs(&self, worker: &Worker) -> Result<u32> {
        self.repo.count_running_for_worker(&worker.name).await
    }

    pub async fn update(&self, id: i64, patch: WorkerPatch) -> Result<Worker> {
        let mut worker = self.get(id).await?;
        if let Some(hostname) = patch.hostname {
            worker.hostname = Some(hostname);
        }
        if let Some(ip) = patch.ip_address {
            worker.ip_address = Some(ip);
        }
        if let Some(port) = patch.port {
            worker.port = port;
        }
        let max_jobs_changed = match patch.max_jobs {
            Some(max_jobs) if max_jobs != worker.max_jobs => {
                if max_jobs == 0 {
                    return Err(DispatchError::validation("max_jobs must be at least 1"));
                }
                worker.max_jobs = max_jobs;
                true
            }
            _ => false,
        };
        self.repo.update_worker(&worker).await?;
        let worker = self.get(id).await?;

        // Push the new limit to a live worker; failure degrades to the
        // next health cycle rather than failing the update.
        if max_jobs_changed && worker.status == WorkerStatus::Online {
            if let Err(e) = self.client.update_config(&worker, worker.max_jobs).await {
                tracing::warn!(worker = %worker.name, error = %e, "Failed to push max_jobs to worker");
            }
        }
        self.bus.publish_worker(worker.clone());
        Ok(worker)
    }

    /// Delete a worker. The System worker is reserved, and a worker with
    /// Running jobs must be stopped first.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let worker = self.get(id).await?;
        if worker.name == SYSTEM_WORKER {
            return Err(DispatchError::conflict(
                "the System worker cannot be deleted",
            ));
        }
        let running = self.repo.count_running_for_worker(&worker.name).await?;
        if running > 0 {
            return Err(DispatchError::conflict(format!(
                "worker '{}' still has {running} running job(s)",
                worker.name
            )));
        }
        if let Some(mut child) = self.processes.remove(id) {
            let _ = child.start_kill();
        }
        self.repo.delete_worker(id).await?;
        self.logs.remove(LogKind::Worker, &id.to_string()).await?;
        tracing::info!(worker = %worker.name, "Worker deleted");
        Ok(())
    }

    /// stopped -> started: spawn the local process or contact the remote
    /// worker; only a successful contact flips the status to online.
    pub async fn start(&self, id: i64) -> Result<Worker> {
        let worker = self.get(id).await?;
        match worker.kind {
            WorkerKind::Local => self.start_local(&worker).await?,
            WorkerKind::Remote => {
                if let Err(e) = self.client.health(&worker).await {
                    let failed = self
                        .repo
                        .set_worker_status(
                            id,
                            WorkerStatus::Offline,
                            Some(format!("start failed: {e}")),
                            None,
                        )
                        .await?;
                    self.bus.publish_worker(failed);
                    return Err(DispatchError::Unavailable(format!(
                        "remote worker '{}' is not reachable: {e}",
                        worker.name
                    )));
                }
            }
        }
        let worker = self.repo.set_worker_state(id, WorkerState::Started).await?;
        let worker = self
            .repo
            .set_worker_status(id, WorkerStatus::Online, None, Some(Utc::now()))
            .await?;
        self.log(&worker, "Worker started").await;
        tracing::info!(worker = %worker.name, "Worker started");
        self.bus.publish_worker(worker.clone());
        Ok(worker)
    }

    /// started/paused -> stopped: in-flight jobs are cancelled, the local
    /// child process is terminated.
    pub async fn stop(&self, id: i64) -> Result<Worker> {
        let worker = self.get(id).await?;
        self.cancel_running_jobs(&worker).await?;
        if let Some(mut child) = self.processes.remove(id) {
            // Give in-flight cancels a moment to reach the process.
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            if let Err(e) = child.start_kill() {
                tracing::warn!(worker = %worker.name, error = %e, "Failed to kill worker process");
            }
        }
        let worker = self.repo.set_worker_state(id, WorkerState::Stopped).await?;
        let worker = self
            .repo
            .set_worker_status(id, WorkerStatus::Offline, None, None)
            .await?;
        self.log(&worker, "Worker stopped").await;
        tracing::info!(worker = %worker.name, "Worker stopped");
        self.bus.publish_worker(worker.clone());
        Ok(worker)
    }

    /// started -> paused: no new dispatches; running jobs continue.
    pub async fn pause(&self, id: i64) -> Result<Worker> {
        let worker = self.repo.set_worker_state(id, WorkerState::Paused).await?;
        self.log(&worker, "Worker paused").await;
        tracing::info!(worker = %worker.name, "Worker paused");
        self.bus.publish_worker(worker.clone());
        Ok(worker)
    }

    /// Startup announcement from a worker process; flips it online without
    /// waiting for the next monitor cycle.
    pub async fn mark_registered(&self, name: &str) -> Result<Worker> {
        let worker = self
            .repo
            .get_worker_by_name(name)
            .await?
            .ok_or_else(|| DispatchError::not_found("worker", name))?;
        let worker = self
            .repo
            .set_worker_status(worker.id, WorkerStatus::Online, None, Some(Utc::now()))
            .await?;
        self.log(&worker, "Worker reported ready").await;
        self.bus.publish_worker(worker.clone());
        Ok(worker)
    }

    async fn cancel_running_jobs(&self, worker: &Worker) -> Result<()> {
        let running = self.repo.running_jobs_for_worker(&worker.name).await?;
        for job in running {
            match self.client.cancel(worker, job.id).await {
                Ok(()) => {
                    tracing::info!(job_id = %job.id, worker = %worker.name, "Cancel sent for stop");
                }
                Err(e) => {
                    // Worker unreachable: flip the job terminal directly so
                    // stop always converges.
                    tracing::warn!(job_id = %job.id, error = %e, "Cancel failed, marking job cancelled");
                    if let Some(cancelled) = self
                        .repo
                        .finish_job(
                            job.id,
                            JobStatus::Cancelled,
                            None,
                            Some(format!("worker '{}' stopped", worker.name)),
                        )
                        .await?
                    {
                        self.bus.publish_job(cancelled);
                    }
                }
            }
        }
        Ok(())
    }

    async fn start_local(&self, worker: &Worker) -> Result<()> {
        let binary = worker_binary()?;
        let mut command = Command::new(binary);
        command
            .arg("--name")
            .arg(&worker.name)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(worker.port.to_string())
            .arg("--orchestrator-url")
            .arg(&self.config.public_url)
            .arg("--max-jobs")
            .arg(worker.max_jobs.to_string())
            .kill_on_drop(true);
        if let Some(token) = &self.config.callback_token {
            command.arg("--token").arg(token);
        }
        let child = command.spawn().map_err(|e| {
            DispatchError::Unavailable(format!("failed to spawn worker process: {e}"))
        })?;
        self.processes.insert(worker.id, child);

        // Wait for the process to answer its health endpoint.
        for _ in 0..20 {
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            if self.client.health(worker).await.is_ok() {
                return Ok(());
            }
        }
        if let Some(mut child) = self.processes.remove(worker.id) {
            let _ = child.start_kill();
        }
        Err(DispatchError::Unavailable(format!(
            "worker '{}' did not become healthy after spawn",
            worker.name
        )))
    }

    async fn log(&self, worker: &Worker, line: &str) {
        let key = worker.id.to_string();
        if let Err(e) = self.logs.append(LogKind::Worker, &key, line).await {
            tracing::error!(worker = %worker.name, error = %e, "Failed to write worker log");
        }
        self.bus.publish_log(LogKind::Worker, key, line);
    }
}

/// Path of the worker binary, expected next to the orchestrator binary.
fn worker_binary() -> Result<std::path::PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| DispatchError::Fatal("cannot locate binary directory".into()))?;
    let candidate = dir.join("dispatch-worker");
    if candidate.exists() {
        Ok(candidate)
    } else {
        // Fall back to PATH lookup.
        Ok(std::path::PathBuf::from("dispatch-worker"))
    }
}

/// Pick an OS-assigned free port for the System worker.
fn free_local_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(8500)
}
