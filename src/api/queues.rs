//! Queue endpoints: CRUD, state control, worker assignments, logs.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::events::LogKind;
use crate::model::{DispatchStrategy, Queue, QueuePriority, QueueState, Worker};
use crate::repo::{NewQueue, QueuePatch};

use super::{AppState, PageQuery};

#[derive(Debug, Deserialize)]
pub struct CreateQueueRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_time_limit")]
    pub time_limit: i64,
}

fn default_priority() -> String {
    "normal".to_string()
}

fn default_strategy() -> String {
    "round_robin".to_string()
}

fn default_state() -> String {
    "stopped".to_string()
}

fn default_time_limit() -> i64 {
    1200
}

#[derive(Debug, Deserialize)]
pub struct UpdateQueueRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub strategy: Option<String>,
    pub is_default: Option<bool>,
    pub time_limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct QueueListResponse {
    pub queues: Vec<Queue>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Serialize)]
pub struct StrategyInfo {
    pub name: String,
    pub description: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct BulkAssignRequest {
    pub worker_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct QueueWorkersResponse {
    pub assigned: Vec<Worker>,
    pub assignable: Vec<Worker>,
}

fn parse_priority(raw: &str) -> Result<QueuePriority> {
    raw.parse().map_err(DispatchError::Validation)
}

fn parse_strategy(raw: &str) -> Result<DispatchStrategy> {
    raw.parse().map_err(DispatchError::Validation)
}

fn parse_state(raw: &str) -> Result<QueueState> {
    raw.parse().map_err(DispatchError::Validation)
}

pub async fn create_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateQueueRequest>,
) -> Result<Json<Queue>> {
    if request.time_limit <= 0 {
        return Err(DispatchError::validation("time_limit must be positive"));
    }
    let queue = state
        .queues
        .create(NewQueue {
            name: request.name,
            description: request.description,
            priority: parse_priority(&request.priority)?,
            strategy: parse_strategy(&request.strategy)?,
            state: parse_state(&request.state)?,
            is_default: request.is_default,
            time_limit_secs: request.time_limit,
        })
        .await?;
    Ok(Json(queue))
}

pub async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Queue>> {
    Ok(Json(state.queues.get(id).await?))
}

pub async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<QueueListResponse>> {
    let (queues, total) = state.queues.list((&query).into()).await?;
    Ok(Json(QueueListResponse {
        queues,
        total,
        page: query.page,
        per_page: query.per_page,
    }))
}

pub async fn update_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateQueueRequest>,
) -> Result<Json<Queue>> {
    if let Some(limit) = request.time_limit {
        if limit <= 0 {
            return Err(DispatchError::validation("time_limit must be positive"));
        }
    }
    let queue = state
        .queues
        .update(
            id,
            QueuePatch {
                name: request.name,
                description: request.description,
                priority: request.priority.as_deref().map(parse_priority).transpose()?,
                strategy: request.strategy.as_deref().map(parse_strategy).transpose()?,
                is_default: request.is_default,
                time_limit_secs: request.time_limit,
            },
        )
        .await?;
    Ok(Json(queue))
}

pub async fn delete_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    state.queues.delete(id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub async fn start_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Queue>> {
    Ok(Json(state.queues.start(id).await?))
}

pub async fn stop_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Queue>> {
    Ok(Json(state.queues.stop(id).await?))
}

pub async fn pause_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Queue>> {
    Ok(Json(state.queues.pause(id).await?))
}

pub async fn strategies_handler() -> Json<Vec<StrategyInfo>> {
    Json(
        DispatchStrategy::all()
            .into_iter()
            .map(|strategy| StrategyInfo {
                name: strategy.to_string(),
                description: strategy.description(),
            })
            .collect(),
    )
}

pub async fn workers_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<QueueWorkersResponse>> {
    let assigned = state
        .queues
        .assigned_workers(id)
        .await?
        .into_iter()
        .map(|w| w.masked())
        .collect();
    let assignable = state
        .queues
        .assignable_workers(id)
        .await?
        .into_iter()
        .map(|w| w.masked())
        .collect();
    Ok(Json(QueueWorkersResponse {
        assigned,
        assignable,
    }))
}

pub async fn assign_handler(
    State(state): State<AppState>,
    Path((id, worker_id)): Path<(i64, i64)>,
) -> Result<Json<serde_json::Value>> {
    let added = state.queues.assign_worker(id, worker_id).await?;
    Ok(Json(serde_json::json!({ "assigned": added })))
}

pub async fn assign_bulk_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<BulkAssignRequest>,
) -> Result<Json<serde_json::Value>> {
    let added = state.queues.assign_workers(id, &request.worker_ids).await?;
    Ok(Json(serde_json::json!({ "assigned": added })))
}

pub async fn unassign_handler(
    State(state): State<AppState>,
    Path((id, worker_id)): Path<(i64, i64)>,
) -> Result<Json<serde_json::Value>> {
    let removed = state.queues.unassign_worker(id, worker_id).await?;
    Ok(Json(serde_json::json!({ "unassigned": removed })))
}

pub async fn logs_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    state.queues.get(id).await?;
    let content = state.logs.read(LogKind::Queue, &id.to_string()).await?;
    Ok(Json(serde_json::json!({ "content": content })))
}

pub async fn clear_logs_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    state.queues.get(id).await?;
    state.logs.clear(LogKind::Queue, &id.to_string()).await?;
    Ok(Json(serde_json::json!({ "cleared": true })))
}
