//! CRUD for job specifications.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::model::{JobSpec, JobStatus};
use crate::repo::{NewSpec, SpecPatch};

use super::{AppState, PageQuery};

#[derive(Debug, Deserialize)]
pub struct CreateSpecRequest {
    pub name: String,
    pub description: Option<String>,
    pub command: String,
    pub created_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSpecRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub command: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct SpecListResponse {
    pub specs: Vec<JobSpec>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

pub async fn create_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateSpecRequest>,
) -> Result<Json<JobSpec>> {
    if request.name.trim().is_empty() {
        return Err(DispatchError::validation("spec name must not be empty"));
    }
    if request.command.trim().is_empty() {
        return Err(DispatchError::validation("spec command must not be empty"));
    }
    let spec = state
        .repo
        .create_spec(NewSpec {
            name: request.name,
            description: request.description,
            command: request.command,
            created_by: request.created_by,
        })
        .await?;
    tracing::info!(spec = %spec.name, "Spec created");
    Ok(Json(spec))
}

pub async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<JobSpec>> {
    let spec = state
        .repo
        .get_spec(id)
        .await?
        .ok_or_else(|| DispatchError::not_found("spec", id))?;
    Ok(Json(spec))
}

pub async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<SpecListResponse>> {
    let (specs, total) = state.repo.list_specs((&query).into()).await?;
    Ok(Json(SpecListResponse {
        specs,
        total,
        page: query.page,
        per_page: query.per_page,
    }))
}

pub async fn update_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateSpecRequest>,
) -> Result<Json<JobSpec>> {
    let spec = state
        .repo
        .update_spec(
            id,
            SpecPatch {
                name: request.name,
                description: request.description,
                command: request.command,
                is_active: request.is_active,
            },
        )
        .await?;
    tracing::info!(spec = %spec.name, "Spec updated");
    Ok(Json(spec))
}

/// Delete a spec. Refused while Running jobs still reference it.
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    let spec = state
        .repo
        .get_spec(id)
        .await?
        .ok_or_else(|| DispatchError::not_found("spec", id))?;
    let running = state
        .repo
        .count_jobs_for_spec(&spec.name, JobStatus::Running)
        .await?;
    if running > 0 {
        return Err(DispatchError::conflict(format!(
            "spec '{}' has {running} running job(s)",
            spec.name
        )));
    }
    state.repo.delete_spec(id).await?;
    tracing::info!(spec = %spec.name, "Spec deleted");
    Ok(Json(serde_json::json!({ "deleted": true })))
}
