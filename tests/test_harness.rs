//! Shared helpers for integration tests: seeded entities, a worker node
//! spawner, and polling utilities.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use dispatch_lite::api::AppState;
use dispatch_lite::config::{OrchestratorConfig, WorkerNodeConfig};
use dispatch_lite::model::{
    DispatchStrategy, Job, JobSpec, JobStatus, Queue, QueuePriority, QueueState, Worker,
    WorkerKind, WorkerState, WorkerStatus,
};
use dispatch_lite::node::{run_worker_node, NodeState};
use dispatch_lite::orchestrator::Orchestrator;
use dispatch_lite::repo::{MemoryRepository, NewQueue, NewSpec, Repository};

/// Orchestrator state over a memory repository and a temp log root.
pub fn test_state(log_root: &std::path::Path) -> AppState {
    let config = OrchestratorConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        public_url: "http://127.0.0.1:0".to_string(),
        log_root: log_root.to_path_buf(),
        monitor_interval_secs: 30,
        ..OrchestratorConfig::default()
    };
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    Orchestrator::new(config, repo)
        .expect("orchestrator")
        .state()
        .clone()
}

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("free port")
}

/// Spawn a worker node process in-task; returns its cancel token.
pub fn spawn_worker_node(name: &str, port: u16, max_jobs: u32) -> CancellationToken {
    let shutdown = CancellationToken::new();
    let config = WorkerNodeConfig {
        name: name.to_string(),
        listen_addr: format!("127.0.0.1:{port}").parse().unwrap(),
        orchestrator_url: "http://127.0.0.1:1".to_string(),
        max_jobs,
        callback_token: None,
    };
    let state = Arc::new(NodeState::new(config.clone(), shutdown.clone()));
    tokio::spawn(async move {
        let _ = run_worker_node(config, state).await;
    });
    shutdown
}

pub async fn seed_spec(repo: &dyn Repository, name: &str, command: &str) -> JobSpec {
    repo.create_spec(NewSpec {
        name: name.to_string(),
        description: None,
        command: command.to_string(),
        created_by: Some("tests".to_string()),
    })
    .await
    .expect("spec")
}

pub async fn seed_queue(
    repo: &dyn Repository,
    name: &str,
    strategy: DispatchStrategy,
    state: QueueState,
    is_default: bool,
) -> Queue {
    repo.create_queue(NewQueue {
        name: name.to_string(),
        description: None,
        priority: QueuePriority::Normal,
        strategy,
        state,
        is_default,
        time_limit_secs: 120,
    })
    .await
    .expect("queue")
}

/// An online, started worker pointing at 127.0.0.1:port.
pub async fn seed_worker(repo: &dyn Repository, name: &str, port: u16, max_jobs: u32) -> Worker {
    let now = Utc::now();
    repo.create_worker(Worker {
        id: 0,
        name: name.to_string(),
        kind: WorkerKind::Local,
        hostname: Some("localhost".to_string()),
        ip_address: Some("127.0.0.1".to_string()),
        port,
        ssh_user: None,
        auth_method: None,
        ssh_private_key: None,
        password: None,
        provision: false,
        max_jobs,
        status: WorkerStatus::Online,
        state: WorkerState::Started,
        last_seen: Some(now),
        error_message: None,
        created_at: now,
        updated_at: now,
    })
    .await
    .expect("worker")
}

/// A synthetic Running job pinned to a worker, for load shaping.
pub async fn seed_running_job(repo: &dyn Repository, queue: &str, worker: &str) -> Job {
    let mut job = Job::new(
        "load".to_string(),
        queue.to_string(),
        serde_json::Map::new(),
        None,
    );
    job.status = JobStatus::Running;
    job.assigned_worker = Some(worker.to_string());
    job.started_at = Some(Utc::now());
    repo.insert_job(&job).await.expect("job");
    job
}

/// Poll until the predicate holds or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Poll until the job reaches the wanted status; panics on timeout.
pub async fn wait_for_status(
    repo: &dyn Repository,
    job_id: Uuid,
    wanted: JobStatus,
    timeout: Duration,
) {
    let ok = wait_until(timeout, || async {
        repo.get_job(job_id)
            .await
            .ok()
            .flatten()
            .map(|j| j.status == wanted)
            .unwrap_or(false)
    })
    .await;
    if !ok {
        let job = repo.get_job(job_id).await.unwrap();
        panic!("job never reached {wanted}, currently {:?}", job.map(|j| j.status));
    }
}
