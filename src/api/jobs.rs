//! Job endpoints: run, list, cancel/retry/move/delete, statistics, logs.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Result;
use crate::events::LogKind;
use crate::model::{Job, JobStatus};
use crate::repo::JobStatistics;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct RunJobRequest {
    pub spec_name: String,
    #[serde(default)]
    pub runtime_args: Map<String, Value>,
    pub created_by: Option<String>,
    pub queue: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    /// Comma-separated statuses to exclude, e.g. `Completed,Cancelled`.
    pub exclude_status: Option<String>,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    20
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Deserialize)]
pub struct MoveJobRequest {
    pub new_queue: String,
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub new_job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub content: String,
}

pub async fn run_handler(
    State(state): State<AppState>,
    Json(request): Json<RunJobRequest>,
) -> Result<Json<Job>> {
    let job = state
        .jobs
        .run(
            &request.spec_name,
            request.runtime_args,
            request.created_by,
            request.queue,
        )
        .await?;
    Ok(Json(job))
}

pub async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>> {
    Ok(Json(state.jobs.get(id).await?))
}

pub async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> Result<Json<JobListResponse>> {
    let exclude = parse_exclude(query.exclude_status.as_deref());
    let page = crate::repo::Page {
        page: query.page,
        per_page: query.per_page,
    };
    let (jobs, total) = state.jobs.list(page, &exclude).await?;
    Ok(Json(JobListResponse {
        jobs,
        total,
        page: query.page,
        per_page: query.per_page,
    }))
}

fn parse_exclude(raw: Option<&str>) -> Vec<JobStatus> {
    raw.map(|csv| {
        csv.split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect()
    })
    .unwrap_or_default()
}

pub async fn statistics_handler(
    State(state): State<AppState>,
) -> Result<Json<JobStatistics>> {
    Ok(Json(state.jobs.statistics().await?))
}

pub async fn cancel_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>> {
    Ok(Json(state.jobs.cancel(id).await?))
}

pub async fn retry_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RetryResponse>> {
    let retry = state.jobs.retry(id).await?;
    Ok(Json(RetryResponse {
        new_job_id: retry.id,
    }))
}

pub async fn move_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<MoveJobRequest>,
) -> Result<Json<Job>> {
    Ok(Json(state.jobs.move_to_queue(id, &request.new_queue).await?))
}

pub async fn delete_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    state.jobs.delete(id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub async fn logs_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<LogsResponse>> {
    // 404 for unknown jobs, empty content for jobs that wrote nothing.
    state.jobs.get(id).await?;
    let content = state.logs.read(LogKind::Job, &id.to_string()).await?;
    Ok(Json(LogsResponse { content }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_csv_parses_known_statuses() {
        let parsed = parse_exclude(Some("Completed, Cancelled,bogus"));
        assert_eq!(parsed, vec![JobStatus::Completed, JobStatus::Cancelled]);
    }

    #[test]
    fn missing_exclude_is_empty() {
        assert!(parse_exclude(None).is_empty());
    }
}
