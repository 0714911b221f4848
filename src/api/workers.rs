//! Worker endpoints: CRUD, state control, monitoring configuration,
//! deployment status polling, logs, and the worker registration callback.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{MONITOR_INTERVAL_MAX_SECS, MONITOR_INTERVAL_MIN_SECS};
use crate::error::{DispatchError, Result};
use crate::events::LogKind;
use crate::model::{AuthMethod, Worker, WorkerKind};
use crate::workers::{DeploymentStatus, NewWorker, WorkerPatch};

use super::{AppState, PageQuery};

#[derive(Debug, Deserialize)]
pub struct CreateWorkerRequest {
    pub name: String,
    #[serde(default = "default_kind")]
    pub worker_type: String,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    pub ssh_user: Option<String>,
    pub auth_method: Option<String>,
    pub ssh_private_key: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub provision: bool,
    #[serde(default = "default_max_jobs")]
    pub max_jobs: u32,
}

fn default_kind() -> String {
    "remote".to_string()
}

fn default_port() -> u16 {
    8500
}

fn default_max_jobs() -> u32 {
    10
}

#[derive(Debug, Deserialize)]
pub struct UpdateWorkerRequest {
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub port: Option<u16>,
    pub max_jobs: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct WorkerView {
    #[serde(flatten)]
    pub worker: Worker,
    pub current_jobs: u32,
}

#[derive(Debug, Serialize)]
pub struct WorkerListResponse {
    pub workers: Vec<WorkerView>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Serialize)]
pub struct CreateWorkerResponse {
    #[serde(flatten)]
    pub worker: Worker,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub interval: u64,
}

#[derive(Debug, Deserialize)]
pub struct RegisterCallback {
    pub name: String,
}

pub async fn create_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateWorkerRequest>,
) -> Result<Json<CreateWorkerResponse>> {
    let kind: WorkerKind = request
        .worker_type
        .parse()
        .map_err(DispatchError::Validation)?;
    let auth_method: Option<AuthMethod> = request
        .auth_method
        .as_deref()
        .map(|raw| raw.parse().map_err(DispatchError::Validation))
        .transpose()?;
    let (worker, deployment_id) = state
        .workers
        .register(NewWorker {
            name: request.name,
            kind,
            hostname: request.hostname,
            ip_address: request.ip_address,
            port: request.port,
            ssh_user: request.ssh_user,
            auth_method,
            ssh_private_key: request.ssh_private_key,
            password: request.password,
            provision: request.provision,
            max_jobs: request.max_jobs,
        })
        .await?;
    Ok(Json(CreateWorkerResponse {
        worker: worker.masked(),
        deployment_id,
    }))
}

pub async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<WorkerView>> {
    let worker = state.workers.get(id).await?;
    let current_jobs = state.workers.current_jobs(&worker).await?;
    Ok(Json(WorkerView {
        worker: worker.masked(),
        current_jobs,
    }))
}

pub async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<WorkerListResponse>> {
    let (workers, total) = state.workers.list((&query).into()).await?;
    let mut views = Vec::with_capacity(workers.len());
    for worker in workers {
        let current_jobs = state.workers.current_jobs(&worker).await?;
        views.push(WorkerView {
            worker: worker.masked(),
            current_jobs,
        });
    }
    Ok(Json(WorkerListResponse {
        workers: views,
        total,
        page: query.page,
        per_page: query.per_page,
    }))
}

pub async fn update_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateWorkerRequest>,
) -> Result<Json<Worker>> {
    let worker = state
        .workers
        .update(
            id,
            WorkerPatch {
                hostname: request.hostname,
                ip_address: request.ip_address,
                port: request.port,
                max_jobs: request.max_jobs,
            },
        )
        .await?;
    Ok(Json(worker.masked()))
}

pub async fn delete_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    state.workers.delete(id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub async fn start_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Worker>> {
    Ok(Json(state.workers.start(id).await?.masked()))
}

pub async fn stop_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Worker>> {
    Ok(Json(state.workers.stop(id).await?.masked()))
}

pub async fn pause_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Worker>> {
    Ok(Json(state.workers.pause(id).await?.masked()))
}

pub async fn monitoring_get_handler(State(state): State<AppState>) -> Json<MonitoringConfig> {
    Json(MonitoringConfig {
        interval: state.monitor_interval.get(),
    })
}

/// Update the health-monitor period; applies on the next cycle without a
/// restart and is persisted for the next one.
pub async fn monitoring_put_handler(
    State(state): State<AppState>,
    Json(config): Json<MonitoringConfig>,
) -> Result<Json<MonitoringConfig>> {
    if !(MONITOR_INTERVAL_MIN_SECS..=MONITOR_INTERVAL_MAX_SECS).contains(&config.interval) {
        return Err(DispatchError::validation(format!(
            "interval must be between {MONITOR_INTERVAL_MIN_SECS} and {MONITOR_INTERVAL_MAX_SECS} seconds"
        )));
    }
    state.monitor_interval.set(config.interval);
    let mut values = std::collections::HashMap::new();
    values.insert("interval".to_string(), config.interval.to_string());
    state.repo.set_config("monitoring", &values).await?;
    tracing::info!(interval = config.interval, "Monitoring interval updated");
    Ok(Json(config))
}

pub async fn deployment_status_handler(
    State(state): State<AppState>,
    Path(deployment_id): Path<Uuid>,
) -> Result<Json<DeploymentStatus>> {
    state
        .deployments
        .get(deployment_id)
        .map(Json)
        .ok_or_else(|| DispatchError::not_found("deployment", deployment_id))
}

pub async fn logs_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    state.workers.get(id).await?;
    let content = state.logs.read(LogKind::Worker, &id.to_string()).await?;
    Ok(Json(serde_json::json!({ "content": content })))
}

pub async fn clear_logs_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    state.workers.get(id).await?;
    state.logs.clear(LogKind::Worker, &id.to_string()).await?;
    Ok(Json(serde_json::json!({ "cleared": true })))
}

/// Startup announcement from a worker process.
pub async fn register_callback_handler(
    State(state): State<AppState>,
    Json(callback): Json<RegisterCallback>,
) -> Result<Json<serde_json::Value>> {
    let worker = state.workers.mark_registered(&callback.name).await?;
    state.bus.nudge_dispatcher();
    Ok(Json(serde_json::json!({ "registered": worker.name })))
}
