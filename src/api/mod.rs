//! Orchestrator REST + SSE surface consumed by the UI and scripts.

pub mod auth;
pub mod db;
pub mod jobs;
pub mod queues;
pub mod specs;
pub mod sse;
pub mod workers;

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::config::OrchestratorConfig;
use crate::error::DispatchError;
use crate::events::EventBus;
use crate::jobs::JobController;
use crate::logstore::LogStore;
use crate::queues::QueueManager;
use crate::repo::{Page, Repository};
use crate::workers::monitor::MonitorInterval;
use crate::workers::{DeploymentRegistry, WorkerManager};

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub bus: EventBus,
    pub logs: Arc<LogStore>,
    pub jobs: Arc<JobController>,
    pub queues: Arc<QueueManager>,
    pub workers: Arc<WorkerManager>,
    pub deployments: Arc<DeploymentRegistry>,
    pub monitor_interval: MonitorInterval,
    pub config: OrchestratorConfig,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
            DispatchError::NotFound(..) => StatusCode::NOT_FOUND,
            DispatchError::Conflict(_) | DispatchError::NotCancellable => StatusCode::CONFLICT,
            DispatchError::Unavailable(_) | DispatchError::NoDefaultQueue => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Pagination query parameters shared by the list endpoints.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    20
}

impl From<&PageQuery> for Page {
    fn from(query: &PageQuery) -> Self {
        Page {
            page: query.page,
            per_page: query.per_page,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // auth
        .route("/api/auth/login", post(auth::login_handler))
        .route("/api/auth/logout", post(auth::logout_handler))
        // specs
        .route("/api/specs", get(specs::list_handler).post(specs::create_handler))
        .route(
            "/api/specs/:id",
            get(specs::get_handler)
                .put(specs::update_handler)
                .delete(specs::delete_handler),
        )
        // jobs
        .route("/api/jobs", get(jobs::list_handler))
        .route("/api/jobs/run", post(jobs::run_handler))
        .route("/api/jobs/statistics/summary", get(jobs::statistics_handler))
        .route("/api/jobs/realtime", get(sse::jobs_realtime_handler))
        .route(
            "/api/jobs/:id",
            get(jobs::get_handler).delete(jobs::delete_handler),
        )
        .route("/api/jobs/:id/cancel", put(jobs::cancel_handler))
        .route("/api/jobs/:id/retry", put(jobs::retry_handler))
        .route("/api/jobs/:id/move", put(jobs::move_handler))
        .route("/api/jobs/:id/logs", get(jobs::logs_handler))
        .route("/api/jobs/:id/logs/stream", get(sse::job_logs_stream_handler))
        // queues
        .route(
            "/api/queues",
            get(queues::list_handler).post(queues::create_handler),
        )
        .route("/api/queues/strategies", get(queues::strategies_handler))
        .route("/api/queues/realtime", get(sse::queues_realtime_handler))
        .route(
            "/api/queues/:id",
            get(queues::get_handler)
                .put(queues::update_handler)
                .delete(queues::delete_handler),
        )
        .route("/api/queues/:id/start", post(queues::start_handler))
        .route("/api/queues/:id/stop", post(queues::stop_handler))
        .route("/api/queues/:id/pause", post(queues::pause_handler))
        .route(
            "/api/queues/:id/workers",
            get(queues::workers_handler),
        )
        .route(
            "/api/queues/:id/workers/bulk",
            post(queues::assign_bulk_handler),
        )
        .route(
            "/api/queues/:id/workers/:worker_id",
            post(queues::assign_handler).delete(queues::unassign_handler),
        )
        .route("/api/queues/:id/logs", get(queues::logs_handler))
        .route("/api/queues/:id/logs/clear", post(queues::clear_logs_handler))
        .route(
            "/api/queues/:id/logs/stream",
            get(sse::queue_logs_stream_handler),
        )
        // workers
        .route(
            "/api/workers",
            get(workers::list_handler).post(workers::create_handler),
        )
        .route("/api/workers/monitoring", get(workers::monitoring_get_handler).put(workers::monitoring_put_handler))
        .route(
            "/api/workers/deployment-status/:deployment_id",
            get(workers::deployment_status_handler),
        )
        .route("/api/workers/realtime", get(sse::workers_realtime_handler))
        .route(
            "/api/workers/:id",
            get(workers::get_handler)
                .put(workers::update_handler)
                .delete(workers::delete_handler),
        )
        .route("/api/workers/:id/start", post(workers::start_handler))
        .route("/api/workers/:id/stop", post(workers::stop_handler))
        .route("/api/workers/:id/pause", post(workers::pause_handler))
        .route("/api/workers/:id/logs", get(workers::logs_handler))
        .route(
            "/api/workers/:id/logs/clear",
            post(workers::clear_logs_handler),
        )
        .route(
            "/api/workers/:id/logs/stream",
            get(sse::worker_logs_stream_handler),
        )
        // database configuration
        .route("/api/db", get(db::get_handler).put(db::put_handler))
        .route("/api/db/initialize", post(db::initialize_handler))
        // worker callbacks
        .route(
            "/api/internal/workers/register",
            post(workers::register_callback_handler),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until the listener fails or the process shuts down.
pub async fn serve(
    state: AppState,
    cancel: tokio_util::sync::CancellationToken,
) -> crate::error::Result<()> {
    let addr = state.config.listen_addr;
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| DispatchError::Fatal(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(addr = %addr, "API server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| DispatchError::Fatal(format!("API server failed: {e}")))?;
    Ok(())
}

/// Bearer-token middleware. Login and the worker callback surface are
/// exempt; the callback surface is guarded by the shared callback token
/// instead when one is configured.
async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if path == "/api/auth/login" {
        return next.run(request).await;
    }
    if path.starts_with("/api/internal/") {
        if let Some(expected) = &state.config.callback_token {
            let presented = request
                .headers()
                .get("x-callback-token")
                .and_then(|v| v.to_str().ok());
            if presented != Some(expected.as_str()) {
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(token) = token else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing bearer token" })),
        )
            .into_response();
    };
    match state.repo.get_session(token).await {
        Ok(Some(session)) if !session.is_expired(Utc::now()) => next.run(request).await,
        Ok(_) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid or expired token" })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}
