//! HTTP surface of the worker node: the wire contract the orchestrator's
//! transport client speaks.

use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use futures::stream::Stream;
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::config::WorkerNodeConfig;
use crate::error::Result;
use crate::transport::{ConfigUpdate, ExecuteRequest, JobStreamEvent};

use super::{runner, NodeState, StreamFrame};

#[derive(Serialize)]
struct ExecuteResponse {
    accepted: bool,
    job_id: Uuid,
}

#[derive(Serialize)]
struct StatusResponse {
    worker_name: String,
    current_jobs: u32,
    max_jobs: u32,
    state: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

#[derive(Serialize)]
struct ConfigResponse {
    max_jobs: u32,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    name: &'a str,
    port: u16,
}

/// Run the worker node: bind the wire-contract server, announce
/// ourselves to the orchestrator, and serve until shutdown.
pub async fn run_worker_node(config: WorkerNodeConfig, state: Arc<NodeState>) -> Result<()> {
    let app = Router::new()
        .route("/execute", post(execute_handler))
        .route("/cancel/:job_id", post(cancel_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .route("/config", put(config_handler))
        .route("/logs/:job_id/stream", get(stream_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| {
            crate::error::DispatchError::Fatal(format!(
                "failed to bind {}: {e}",
                config.listen_addr
            ))
        })?;
    tracing::info!(addr = %config.listen_addr, worker = %config.name, "Worker node listening");

    // Best-effort startup announcement; the health monitor finds us anyway.
    announce(&config).await;

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| crate::error::DispatchError::Fatal(format!("worker server failed: {e}")))?;
    Ok(())
}

async fn announce(config: &WorkerNodeConfig) {
    let url = format!(
        "{}/api/internal/workers/register",
        config.orchestrator_url.trim_end_matches('/')
    );
    let body = RegisterRequest {
        name: &config.name,
        port: config.listen_addr.port(),
    };
    let mut request = reqwest::Client::new().post(&url).json(&body);
    if let Some(token) = &config.callback_token {
        request = request.header("x-callback-token", token);
    }
    match request.send().await {
        Ok(response) if response.status().is_success() => {
            tracing::info!(worker = %config.name, "Registered with orchestrator");
        }
        Ok(response) => {
            tracing::warn!(worker = %config.name, status = %response.status(), "Registration rejected");
        }
        Err(e) => {
            tracing::warn!(worker = %config.name, error = %e, "Registration failed");
        }
    }
}

async fn execute_handler(
    State(state): State<Arc<NodeState>>,
    Json(request): Json<ExecuteRequest>,
) -> impl IntoResponse {
    let Some(cancel) = state.admit(request.job_id) else {
        // At capacity or duplicate submission; the orchestrator treats
        // this as a permanent dispatch failure and requeues elsewhere.
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ExecuteResponse {
                accepted: false,
                job_id: request.job_id,
            }),
        );
    };
    let job_id = request.job_id;
    // Create the stream before acknowledging so the orchestrator can
    // subscribe the moment the 200 lands.
    state.stream_for(job_id);
    tokio::spawn(runner::run_job(state.clone(), request, cancel));
    (
        StatusCode::OK,
        Json(ExecuteResponse {
            accepted: true,
            job_id,
        }),
    )
}

async fn cancel_handler(
    State(state): State<Arc<NodeState>>,
    Path(job_id): Path<Uuid>,
) -> impl IntoResponse {
    let cancelled = state.cancel(job_id);
    if cancelled {
        tracing::info!(job_id = %job_id, "Cancel accepted");
    }
    // Idempotent: already-finished jobs answer 200 as well.
    (StatusCode::OK, Json(CancelResponse { cancelled }))
}

async fn status_handler(State(state): State<Arc<NodeState>>) -> impl IntoResponse {
    Json(StatusResponse {
        worker_name: state.config.name.clone(),
        current_jobs: state.current_jobs(),
        max_jobs: state.max_jobs.load(Ordering::Relaxed),
        state: "started".to_string(),
    })
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse { status: "healthy" })
}

async fn config_handler(
    State(state): State<Arc<NodeState>>,
    Json(update): Json<ConfigUpdate>,
) -> impl IntoResponse {
    if update.max_jobs == 0 {
        return (StatusCode::BAD_REQUEST, Json(ConfigResponse { max_jobs: 0 }));
    }
    state.max_jobs.store(update.max_jobs, Ordering::Relaxed);
    tracing::info!(max_jobs = update.max_jobs, "Worker max_jobs updated");
    (
        StatusCode::OK,
        Json(ConfigResponse {
            max_jobs: update.max_jobs,
        }),
    )
}

/// Per-job SSE stream: tail replay, then live frames; closes shortly
/// after the terminal status event.
async fn stream_handler(
    State(state): State<Arc<NodeState>>,
    Path(job_id): Path<Uuid>,
) -> axum::response::Response {
    let Some(stream) = state.existing_stream(job_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let (tail, mut live) = stream.subscribe();

    let (tx, rx) = tokio::sync::mpsc::channel::<std::result::Result<Event, Infallible>>(256);
    tokio::spawn(async move {
        let mut last_seq = 0u64;
        for frame in tail {
            last_seq = frame.seq;
            let terminal = matches!(frame.event, JobStreamEvent::Status { .. });
            if tx.send(Ok(frame_to_event(&frame))).await.is_err() {
                return;
            }
            if terminal {
                // Grace so the last frames flush before close.
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                return;
            }
        }
        loop {
            match live.recv().await {
                Ok(frame) => {
                    if frame.seq <= last_seq {
                        continue;
                    }
                    let terminal = matches!(frame.event, JobStreamEvent::Status { .. });
                    if tx.send(Ok(frame_to_event(&frame))).await.is_err() {
                        return;
                    }
                    if terminal {
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    sse_response(ReceiverStream::new(rx)).into_response()
}

fn sse_response(
    stream: impl Stream<Item = std::result::Result<Event, Infallible>> + Send + 'static,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn frame_to_event(frame: &StreamFrame) -> Event {
    let event = Event::default().id(frame.seq.to_string());
    match &frame.event {
        JobStreamEvent::LogLine(line) => event
            .event("log_line")
            .data(serde_json::json!({ "line": line }).to_string()),
        JobStreamEvent::Progress(progress) => event
            .event("progress")
            .data(serde_json::json!({ "progress": progress }).to_string()),
        JobStreamEvent::Status {
            status,
            result,
            error_message,
        } => event.event("job_status").data(
            serde_json::json!({
                "status": status.to_string(),
                "result": result,
                "error_message": error_message,
            })
            .to_string(),
        ),
    }
}
