//! Remote worker provisioning over SSH.
//!
//! Deployment runs as a stepwise sequence keyed by a deployment id; each
//! step is recorded in a registry the UI polls. SSH and file transfer
//! shell out to `ssh`/`scp` (password auth goes through `sshpass`), and
//! the whole deployment is bounded by a two-minute timeout. Failure leaves
//! the worker in `state=failed` with a human-readable message.

use std::collections::HashMap;
use std::io::Write;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{DispatchError, Result};
use crate::events::{EventBus, LogKind};
use crate::logstore::LogStore;
use crate::model::{AuthMethod, Worker, WorkerState, WorkerStatus};
use crate::repo::Repository;
use crate::transport::WorkerClient;

const DEPLOY_TIMEOUT: Duration = Duration::from_secs(120);
/// Finished deployments stay pollable for at least this long.
const RETAIN_AFTER_DONE: Duration = Duration::from_secs(300);
const REMOTE_DIR: &str = "~/.dispatch-lite";

const STEPS: [&str; 8] = [
    "Validating connection parameters",
    "Building worker package",
    "Opening SSH channel",
    "Preparing remote environment",
    "Transferring and installing package",
    "Launching worker process",
    "Verifying worker health",
    "Deployment complete",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentOutcome {
    Running,
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatus {
    pub deployment_id: Uuid,
    pub worker_name: String,
    pub outcome: DeploymentOutcome,
    pub step: String,
    pub step_number: usize,
    pub total_steps: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct DeploymentRegistry {
    entries: Mutex<HashMap<Uuid, DeploymentStatus>>,
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, worker_name: &str) -> Uuid {
        let deployment_id = Uuid::new_v4();
        let status = DeploymentStatus {
            deployment_id,
            worker_name: worker_name.to_string(),
            outcome: DeploymentOutcome::Running,
            step: STEPS[0].to_string(),
            step_number: 1,
            total_steps: STEPS.len(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.entries
            .lock()
            .unwrap()
            .insert(deployment_id, status);
        deployment_id
    }

    pub fn update_step(&self, deployment_id: Uuid, step_number: usize) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&deployment_id) {
            entry.step_number = step_number;
            entry.step = STEPS[step_number - 1].to_string();
        }
    }

    pub fn complete(&self, deployment_id: Uuid, outcome: DeploymentOutcome, error: Option<String>) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&deployment_id) {
            entry.outcome = outcome;
            entry.error = error;
            entry.finished_at = Some(Utc::now());
        }
    }

    pub fn get(&self, deployment_id: Uuid) -> Option<DeploymentStatus> {
        self.sweep();
        self.entries.lock().unwrap().get(&deployment_id).cloned()
    }

    fn sweep(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(RETAIN_AFTER_DONE).unwrap_or(chrono::Duration::zero());
        self.entries
            .lock()
            .unwrap()
            .retain(|_, entry| match entry.finished_at {
                Some(finished) => finished > cutoff,
                None => true,
            });
    }
}

pub struct Provisioner {
    repo: Arc<dyn Repository>,
    bus: EventBus,
    logs: Arc<LogStore>,
    client: WorkerClient,
    deployments: Arc<DeploymentRegistry>,
    config: OrchestratorConfig,
}

impl Provisioner {
    pub fn new(
        repo: Arc<dyn Repository>,
        bus: EventBus,
        logs: Arc<LogStore>,
        client: WorkerClient,
        deployments: Arc<DeploymentRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            repo,
            bus,
            logs,
            client,
            deployments,
            config,
        }
    }

    /// Run the deployment to completion, recording progress and leaving
    /// the worker either online/started or failed.
    pub async fn deploy(&self, worker: Worker, deployment_id: Uuid) {
        tracing::info!(worker = %worker.name, %deployment_id, "Remote deployment started");
        let outcome = tokio::time::timeout(DEPLOY_TIMEOUT, self.run_steps(&worker, deployment_id)).await;
        match outcome {
            Ok(Ok(())) => {
                self.deployments
                    .complete(deployment_id, DeploymentOutcome::Success, None);
                let _ = self
                    .repo
                    .set_worker_state(worker.id, WorkerState::Started)
                    .await;
                if let Ok(updated) = self
                    .repo
                    .set_worker_status(worker.id, WorkerStatus::Online, None, Some(Utc::now()))
                    .await
                {
                    self.worker_log(&updated, "Remote deployment succeeded").await;
                    self.bus.publish_worker(updated);
                }
                self.bus.nudge_dispatcher();
                tracing::info!(worker = %worker.name, %deployment_id, "Remote deployment succeeded");
            }
            Ok(Err(e)) => {
                self.fail(&worker, deployment_id, DeploymentOutcome::Error, e.to_string())
                    .await;
            }
            Err(_) => {
                self.fail(
                    &worker,
                    deployment_id,
                    DeploymentOutcome::Timeout,
                    format!("deployment timed out after {}s", DEPLOY_TIMEOUT.as_secs()),
                )
                .await;
            }
        }
    }

    async fn fail(
        &self,
        worker: &Worker,
        deployment_id: Uuid,
        outcome: DeploymentOutcome,
        error: String,
    ) {
        tracing::error!(worker = %worker.name, %deployment_id, error = %error, "Remote deployment failed");
        self.deployments
            .complete(deployment_id, outcome, Some(error.clone()));
        let _ = self
            .repo
            .set_worker_state(worker.id, WorkerState::Failed)
            .await;
        if let Ok(updated) = self
            .repo
            .set_worker_status(worker.id, WorkerStatus::Error, Some(error), None)
            .await
        {
            self.worker_log(&updated, "Remote deployment failed").await;
            self.bus.publish_worker(updated);
        }
    }

    async fn run_steps(&self, worker: &Worker, deployment_id: Uuid) -> Result<()> {
        let ssh = SshTarget::from_worker(worker)?;

        self.step(worker, deployment_id, 1).await;
        // Parameters were validated building the target above.

        self.step(worker, deployment_id, 2).await;
        let package = worker_package()?;

        self.step(worker, deployment_id, 3).await;
        ssh.run("true").await?;

        self.step(worker, deployment_id, 4).await;
        ssh.run(&format!("mkdir -p {REMOTE_DIR}/bin")).await?;

        self.step(worker, deployment_id, 5).await;
        ssh.copy_to(&package, &format!("{REMOTE_DIR}/bin/dispatch-worker"))
            .await?;
        ssh.run(&format!("chmod +x {REMOTE_DIR}/bin/dispatch-worker"))
            .await?;

        self.step(worker, deployment_id, 6).await;
        let token_arg = self
            .config
            .callback_token
            .as_ref()
            .map(|t| format!(" --token '{t}'"))
            .unwrap_or_default();
        ssh.run(&format!(
            "nohup {REMOTE_DIR}/bin/dispatch-worker --name '{}' --host 0.0.0.0 --port {} \
             --orchestrator-url '{}' --max-jobs {}{token_arg} \
             >> {REMOTE_DIR}/worker.log 2>&1 & disown",
            worker.name, worker.port, self.config.public_url, worker.max_jobs
        ))
        .await?;

        self.step(worker, deployment_id, 7).await;
        let mut healthy = false;
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if self.client.health(worker).await.is_ok() {
                healthy = true;
                break;
            }
        }
        if !healthy {
            return Err(DispatchError::Unavailable(format!(
                "worker '{}' did not answer its health probe after launch",
                worker.name
            )));
        }

        self.step(worker, deployment_id, 8).await;
        Ok(())
    }

    async fn step(&self, worker: &Worker, deployment_id: Uuid, number: usize) {
        self.deployments.update_step(deployment_id, number);
        self.worker_log(worker, STEPS[number - 1]).await;
        // Step progress rides the worker update topic for live UIs.
        if let Ok(Some(current)) = self.repo.get_worker(worker.id).await {
            self.bus.publish_worker(current);
        }
    }

    async fn worker_log(&self, worker: &Worker, line: &str) {
        let key = worker.id.to_string();
        if let Err(e) = self.logs.append(LogKind::Worker, &key, line).await {
            tracing::error!(worker = %worker.name, error = %e, "Failed to write worker log");
        }
        self.bus.publish_log(LogKind::Worker, key, line);
    }
}

/// SSH connection parameters resolved from a worker record.
struct SshTarget {
    user_host: String,
    auth: SshAuth,
}

enum SshAuth {
    Key(tempfile::NamedTempFile),
    Password(String),
}

impl SshTarget {
    fn from_worker(worker: &Worker) -> Result<Self> {
        let host = worker
            .ip_address
            .as_deref()
            .or(worker.hostname.as_deref())
            .ok_or_else(|| {
                DispatchError::validation("remote worker needs a hostname or ip address")
            })?;
        let user = worker
            .ssh_user
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| DispatchError::validation("remote worker needs an ssh user"))?;
        let auth = match worker.auth_method {
            Some(AuthMethod::Key) => {
                let key = worker.ssh_private_key.as_deref().ok_or_else(|| {
                    DispatchError::validation("key auth requires an ssh private key")
                })?;
                SshAuth::Key(write_key_file(key)?)
            }
            Some(AuthMethod::Password) => {
                let password = worker.password.as_deref().ok_or_else(|| {
                    DispatchError::validation("password auth requires a password")
                })?;
                SshAuth::Password(password.to_string())
            }
            None => {
                return Err(DispatchError::validation(
                    "remote worker needs an auth method",
                ))
            }
        };
        Ok(Self {
            user_host: format!("{user}@{host}"),
            auth,
        })
    }

    /// Run a remote shell command, failing on non-zero exit.
    async fn run(&self, remote_command: &str) -> Result<()> {
        let mut command = self.base("ssh");
        command.arg(&self.user_host).arg(remote_command);
        self.execute(command, remote_command).await
    }

    /// Copy a local file to the remote host.
    async fn copy_to(&self, local: &std::path::Path, remote: &str) -> Result<()> {
        let mut command = self.base("scp");
        command
            .arg(local)
            .arg(format!("{}:{}", self.user_host, remote));
        self.execute(command, "scp").await
    }

    fn base(&self, program: &str) -> Command {
        let mut command = match &self.auth {
            SshAuth::Password(password) => {
                let mut c = Command::new("sshpass");
                c.arg("-p").arg(password).arg(program);
                c
            }
            SshAuth::Key(_) => Command::new(program),
        };
        if let SshAuth::Key(key_file) = &self.auth {
            command.arg("-i").arg(key_file.path());
        }
        command
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg("-o")
            .arg("BatchMode=no")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    async fn execute(&self, mut command: Command, label: &str) -> Result<()> {
        let output = command.output().await.map_err(|e| {
            DispatchError::Unavailable(format!("failed to run {label}: {e}"))
        })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(DispatchError::Unavailable(format!(
            "{label} failed (exit {:?}): {}",
            output.status.code(),
            stderr.trim()
        )))
    }
}

/// Write the private key to a 0600 temp file for `ssh -i`.
fn write_key_file(key: &str) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(key.as_bytes())?;
    if !key.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

/// The "package" is the worker binary itself, expected next to the
/// orchestrator binary.
fn worker_package() -> Result<std::path::PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| DispatchError::Fatal("cannot locate binary directory".into()))?;
    let candidate = dir.join("dispatch-worker");
    if candidate.exists() {
        Ok(candidate)
    } else {
        Err(DispatchError::Unavailable(
            "dispatch-worker binary not found next to the orchestrator".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_steps_and_completion() {
        let registry = DeploymentRegistry::new();
        let id = registry.begin("w1");

        let status = registry.get(id).unwrap();
        assert_eq!(status.outcome, DeploymentOutcome::Running);
        assert_eq!(status.step_number, 1);

        registry.update_step(id, 4);
        let status = registry.get(id).unwrap();
        assert_eq!(status.step_number, 4);
        assert_eq!(status.step, STEPS[3]);

        registry.complete(id, DeploymentOutcome::Error, Some("ssh failed".into()));
        let status = registry.get(id).unwrap();
        assert_eq!(status.outcome, DeploymentOutcome::Error);
        assert_eq!(status.error.as_deref(), Some("ssh failed"));
        assert!(status.finished_at.is_some());
    }

    #[test]
    fn registry_keeps_fresh_finished_entries() {
        let registry = DeploymentRegistry::new();
        let id = registry.begin("w1");
        registry.complete(id, DeploymentOutcome::Success, None);
        // Just finished: must still be pollable.
        assert!(registry.get(id).is_some());
    }
}
