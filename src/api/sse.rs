//! SSE fan-out: realtime list streams and per-entity log streams.
//!
//! List streams send an initial snapshot, then coalesced updates at most
//! every 500 ms, a heartbeat every 15 s, and close after five idle
//! minutes. Every subscriber writes through a bounded channel; one that
//! cannot drain within two seconds is dropped.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    response::Response,
};
use futures::stream::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::error::Result;
use crate::events::{Envelope, Event as BusEvent, LogKind};
use crate::model::JobStatus;
use crate::repo::Page;

use super::AppState;

const COALESCE_WINDOW: Duration = Duration::from_millis(500);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(15);
const IDLE_CLOSE: Duration = Duration::from_secs(300);
const SEND_TIMEOUT: Duration = Duration::from_secs(2);
const SUBSCRIBER_BUFFER: usize = 256;
/// Close grace after a terminal `job_status` event.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type SseItem = std::result::Result<Event, Infallible>;

pub async fn jobs_realtime_handler(State(state): State<AppState>) -> Sse<impl Stream<Item = SseItem>> {
    list_stream(state, LogKind::Job).await
}

pub async fn workers_realtime_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = SseItem>> {
    list_stream(state, LogKind::Worker).await
}

pub async fn queues_realtime_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = SseItem>> {
    list_stream(state, LogKind::Queue).await
}

fn event_name(kind: LogKind) -> &'static str {
    match kind {
        LogKind::Job => "jobs_update",
        LogKind::Worker => "workers_update",
        LogKind::Queue => "queues_update",
    }
}

async fn snapshot(state: &AppState, kind: LogKind) -> Result<serde_json::Value> {
    let page = Page {
        page: 1,
        per_page: 500,
    };
    let value = match kind {
        LogKind::Job => serde_json::to_value(state.repo.list_jobs(page, &[]).await?.0)?,
        LogKind::Worker => {
            let (workers, _) = state.repo.list_workers(page).await?;
            let masked: Vec<_> = workers.iter().map(|w| w.masked()).collect();
            serde_json::to_value(masked)?
        }
        LogKind::Queue => serde_json::to_value(state.repo.list_queues(page).await?.0)?,
    };
    Ok(value)
}

/// Relevant bus events for a list topic of the given kind.
fn matches_topic(event: &BusEvent, kind: LogKind) -> bool {
    matches!(
        (event, kind),
        (BusEvent::JobUpdate(_), LogKind::Job)
            | (BusEvent::WorkerUpdate(_), LogKind::Worker)
            | (BusEvent::QueueUpdate(_), LogKind::Queue)
    )
}

async fn list_stream(state: AppState, kind: LogKind) -> Sse<impl Stream<Item = SseItem>> {
    let (tx, rx) = mpsc::channel::<SseItem>(SUBSCRIBER_BUFFER);
    let mut bus_rx = state.bus.subscribe();

    tokio::spawn(async move {
        // Initial snapshot, stamped with the topic's current sequence.
        let seq = state.bus.list_seq(kind);
        match snapshot(&state, kind).await {
            Ok(value) => {
                let event = Event::default()
                    .event(event_name(kind))
                    .id(seq.to_string())
                    .data(value.to_string());
                if tx.send_timeout(Ok(event), SEND_TIMEOUT).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Snapshot for list stream failed");
                return;
            }
        }

        let mut dirty = false;
        let mut latest_seq = seq;
        let mut coalesce = tokio::time::interval(COALESCE_WINDOW);
        coalesce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_PERIOD);
        let mut last_update = tokio::time::Instant::now();

        loop {
            tokio::select! {
                received = bus_rx.recv() => {
                    match received {
                        Ok(Envelope { seq, event }) if matches_topic(&event, kind) => {
                            dirty = true;
                            latest_seq = seq;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            // Missed events; the next snapshot resyncs.
                            dirty = true;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = coalesce.tick() => {
                    if !dirty {
                        continue;
                    }
                    dirty = false;
                    last_update = tokio::time::Instant::now();
                    match snapshot(&state, kind).await {
                        Ok(value) => {
                            let event = Event::default()
                                .event(event_name(kind))
                                .id(latest_seq.to_string())
                                .data(value.to_string());
                            if tx.send_timeout(Ok(event), SEND_TIMEOUT).await.is_err() {
                                // Subscriber too slow or gone.
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Snapshot for list stream failed");
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let event = Event::default().event("heartbeat").data("{}");
                    if tx.send_timeout(Ok(event), SEND_TIMEOUT).await.is_err() {
                        break;
                    }
                    if last_update.elapsed() >= IDLE_CLOSE {
                        let _ = tx
                            .send_timeout(
                                Ok(Event::default().event("idle_timeout").data("{}")),
                                SEND_TIMEOUT,
                            )
                            .await;
                        let _ = tx
                            .send_timeout(
                                Ok(Event::default().event("close").data("{}")),
                                SEND_TIMEOUT,
                            )
                            .await;
                        break;
                    }
                }
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

pub async fn job_logs_stream_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    if let Err(e) = state.jobs.get(id).await {
        return e.into_response();
    }
    entity_log_stream(state, LogKind::Job, id.to_string()).into_response()
}

pub async fn worker_logs_stream_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Response {
    if let Err(e) = state.workers.get(id).await {
        return e.into_response();
    }
    entity_log_stream(state, LogKind::Worker, id.to_string()).into_response()
}

pub async fn queue_logs_stream_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Response {
    if let Err(e) = state.queues.get(id).await {
        return e.into_response();
    }
    entity_log_stream(state, LogKind::Queue, id.to_string()).into_response()
}

/// Tail replay followed by live log lines. Job streams additionally end
/// with a `job_status` event once the job is terminal.
fn entity_log_stream(
    state: AppState,
    kind: LogKind,
    entity_id: String,
) -> Sse<impl Stream<Item = SseItem>> {
    let (tx, rx) = mpsc::channel::<SseItem>(SUBSCRIBER_BUFFER);
    // Subscribe before the terminal-state check below so a job finishing
    // in between cannot slip past both.
    let mut bus_rx = state.bus.subscribe();

    tokio::spawn(async move {
        let tail = state.logs.tail(kind, &entity_id);
        let mut replayed = 0u64;
        for line in tail {
            replayed += 1;
            let event = Event::default()
                .event("log_line")
                .id(replayed.to_string())
                .data(serde_json::json!({ "line": line }).to_string());
            if tx.send_timeout(Ok(event), SEND_TIMEOUT).await.is_err() {
                return;
            }
        }

        // A job already terminal at subscribe time: status, grace, close.
        if kind == LogKind::Job {
            if let Ok(job_id) = entity_id.parse::<Uuid>() {
                if let Ok(Some(job)) = state.repo.get_job(job_id).await {
                    if job.status.is_terminal() {
                        send_job_status(&tx, job.status).await;
                        return;
                    }
                }
            }
        }

        loop {
            let envelope = match bus_rx.recv().await {
                Ok(envelope) => envelope,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(missed = n, "Log subscriber lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            match envelope.event {
                BusEvent::LogLine {
                    kind: event_kind,
                    entity_id: event_entity,
                    line,
                } if event_kind == kind && event_entity == entity_id => {
                    let event = Event::default()
                        .event("log_line")
                        .id(envelope.seq.to_string())
                        .data(serde_json::json!({ "line": line }).to_string());
                    if tx.send_timeout(Ok(event), SEND_TIMEOUT).await.is_err() {
                        return;
                    }
                }
                BusEvent::JobUpdate(job)
                    if kind == LogKind::Job
                        && job.id.to_string() == entity_id
                        && job.status.is_terminal() =>
                {
                    // Log lines for this job were published before the
                    // terminal update, so ordering holds per subscriber.
                    send_job_status(&tx, job.status).await;
                    return;
                }
                _ => {}
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

async fn send_job_status(tx: &mpsc::Sender<SseItem>, status: JobStatus) {
    let event = Event::default()
        .event("job_status")
        .data(serde_json::json!({ "status": status.to_string() }).to_string());
    if tx.send_timeout(Ok(event), SEND_TIMEOUT).await.is_ok() {
        tokio::time::sleep(CLOSE_GRACE).await;
        let _ = tx
            .send_timeout(Ok(Event::default().event("close").data("{}")), SEND_TIMEOUT)
            .await;
    }
}
