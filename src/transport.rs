//! HTTP+SSE client the orchestrator uses to talk to worker processes.
//!
//! Unary calls carry a 10 s deadline and retry transient failures
//! (connect errors, 5xx) three times with 250 ms / 1 s / 4 s backoff; 4xx
//! responses are never retried. The log stream has no total deadline but
//! times out after five idle minutes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::model::{JobStatus, Worker};

const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_secs(1),
    Duration::from_secs(4),
];
const UNARY_DEADLINE: Duration = Duration::from_secs(10);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub job_id: Uuid,
    pub command: String,
    pub runtime_args: Map<String, Value>,
    /// Per-job time limit in seconds; 0 means unlimited.
    pub time_limit_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusReport {
    pub worker_name: String,
    pub current_jobs: u32,
    pub max_jobs: u32,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub max_jobs: u32,
}

/// Events a worker emits on its per-job SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStreamEvent {
    LogLine(String),
    Progress(u8),
    /// Terminal report; closes the stream.
    Status {
        status: JobStatus,
        result: Option<Map<String, Value>>,
        error_message: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct StatusEventBody {
    status: String,
    #[serde(default)]
    result: Option<Map<String, Value>>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogEventBody {
    line: String,
}

#[derive(Debug, Deserialize)]
struct ProgressEventBody {
    progress: u8,
}

#[derive(Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
}

impl Default for WorkerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerClient {
    pub fn new() -> Self {
        // Per-request timeouts are applied call-site; streams must outlive
        // the unary deadline.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client");
        Self { http }
    }

    /// Submit a job for execution. 2xx means the worker accepted it.
    pub async fn execute(&self, worker: &Worker, request: &ExecuteRequest) -> Result<()> {
        let url = format!("{}/execute", worker.endpoint());
        self.retrying(|| async {
            let response = self
                .http
                .post(&url)
                .timeout(UNARY_DEADLINE)
                .json(request)
                .send()
                .await?;
            Self::check(response).await
        })
        .await
    }

    /// Idempotent cancel; 2xx covers both "accepted" and "already gone".
    pub async fn cancel(&self, worker: &Worker, job_id: Uuid) -> Result<()> {
        let url = format!("{}/cancel/{}", worker.endpoint(), job_id);
        self.retrying(|| async {
            let response = self.http.post(&url).timeout(UNARY_DEADLINE).send().await?;
            Self::check(response).await
        })
        .await
    }

    pub async fn status(&self, worker: &Worker) -> Result<WorkerStatusReport> {
        let url = format!("{}/status", worker.endpoint());
        let response = self.http.get(&url).timeout(UNARY_DEADLINE).send().await?;
        let response = Self::check_response(response).await?;
        Ok(response.json().await?)
    }

    /// Cheap liveness probe used by the health monitor; no retries, the
    /// monitor has its own miss counting.
    pub async fn health(&self, worker: &Worker) -> Result<()> {
        let url = format!("{}/health", worker.endpoint());
        let response = self.http.get(&url).timeout(UNARY_DEADLINE).send().await?;
        Self::check(response).await
    }

    pub async fn update_config(&self, worker: &Worker, max_jobs: u32) -> Result<()> {
        let url = format!("{}/config", worker.endpoint());
        self.retrying(|| async {
            let response = self
                .http
                .put(&url)
                .timeout(UNARY_DEADLINE)
                .json(&ConfigUpdate { max_jobs })
                .send()
                .await?;
            Self::check(response).await
        })
        .await
    }

    /// Open the worker's per-job SSE stream and forward parsed events into
    /// a channel. The stream task ends on a terminal status event, on
    /// cancellation, or after five idle minutes.
    pub async fn stream_job_events(
        &self,
        worker: &Worker,
        job_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<JobStreamEvent>> {
        let url = format!("{}/logs/{}/stream", worker.endpoint(), job_id);
        let response = self.http.get(&url).send().await?;
        let mut response = Self::check_response(response).await?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut parser = SseParser::default();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = tokio::time::timeout(STREAM_IDLE_TIMEOUT, response.chunk()) => chunk,
                };
                let chunk = match chunk {
                    Ok(Ok(Some(bytes))) => bytes,
                    // Idle timeout, transport error, or clean end of stream.
                    _ => break,
                };
                for event in parser.feed(&chunk) {
                    let terminal = matches!(event, JobStreamEvent::Status { .. });
                    if tx.send(event).await.is_err() {
                        return;
                    }
                    if terminal {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn retrying<F, Fut>(&self, call: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < RETRY_BACKOFF.len() => {
                    tracing::debug!(
                        attempt = attempt + 1,
                        error = %e,
                        "transient transport failure, backing off"
                    );
                    tokio::time::sleep(RETRY_BACKOFF[attempt]).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn check(response: reqwest::Response) -> Result<()> {
        Self::check_response(response).await.map(|_| ())
    }

    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(DispatchError::Transport(format!(
                "worker returned {status}: {body}"
            )))
        } else {
            // 4xx is a permanent refusal, never retried.
            Err(DispatchError::conflict(format!(
                "worker rejected request ({status}): {body}"
            )))
        }
    }
}

/// Incremental parser for `event:`/`data:` framed SSE bytes.
#[derive(Default)]
struct SseParser {
    buffer: String,
    event_name: String,
    data: String,
}

impl SseParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<JobStreamEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(name) = line.strip_prefix("event:") {
                self.event_name = name.trim().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(data.trim_start());
            } else if line.is_empty() && !self.data.is_empty() {
                if let Some(event) = self.complete() {
                    events.push(event);
                }
            }
        }
        events
    }

    fn complete(&mut self) -> Option<JobStreamEvent> {
        let name = std::mem::take(&mut self.event_name);
        let data = std::mem::take(&mut self.data);
        match name.as_str() {
            "log_line" => serde_json::from_str::<LogEventBody>(&data)
                .ok()
                .map(|body| JobStreamEvent::LogLine(body.line)),
            "progress" => serde_json::from_str::<ProgressEventBody>(&data)
                .ok()
                .map(|body| JobStreamEvent::Progress(body.progress.min(100))),
            "job_status" => {
                let body: StatusEventBody = serde_json::from_str(&data).ok()?;
                let status: JobStatus = body.status.parse().ok()?;
                Some(JobStreamEvent::Status {
                    status,
                    result: body.result,
                    error_message: body.error_message,
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_handles_split_frames() {
        let mut parser = SseParser::default();
        let events = parser.feed(b"event: log_line\ndata: {\"li");
        assert!(events.is_empty());
        let events = parser.feed(b"ne\": \"hello\"}\n\n");
        assert_eq!(events, vec![JobStreamEvent::LogLine("hello".to_string())]);
    }

    #[test]
    fn parser_reads_terminal_status() {
        let mut parser = SseParser::default();
        let frame = b"event: job_status\ndata: {\"status\": \"Completed\", \"result\": {\"code\": 0}}\n\n";
        let events = parser.feed(frame);
        match &events[0] {
            JobStreamEvent::Status { status, result, .. } => {
                assert_eq!(*status, JobStatus::Completed);
                assert!(result.as_ref().unwrap().contains_key("code"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn parser_ignores_unknown_events() {
        let mut parser = SseParser::default();
        let events = parser.feed(b"event: heartbeat\ndata: {}\n\nevent: progress\ndata: {\"progress\": 40}\n\n");
        assert_eq!(events, vec![JobStreamEvent::Progress(40)]);
    }

    #[test]
    fn progress_is_clamped() {
        let mut parser = SseParser::default();
        let events = parser.feed(b"event: progress\ndata: {\"progress\": 250}\n\n");
        assert_eq!(events, vec![JobStreamEvent::Progress(100)]);
    }
}
