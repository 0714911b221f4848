//! Job execution on the worker node.
//!
//! Runs `sh -c <command>`, streams merged stdout/stderr lines into the
//! job's event stream, honors the per-job time limit and cancellation,
//! and emits exactly one terminal status event per job.
//!
//! Two output markers are recognized, one per line:
//! `PROGRESS: <0-100>` updates job progress, `RESULT: <json object>`
//! becomes the job result reported with the terminal status.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::JobStatus;
use crate::transport::{ExecuteRequest, JobStreamEvent};

use super::NodeState;

/// Run one job to completion. Must be spawned; blocks until the job is
/// terminal.
pub async fn run_job(state: Arc<NodeState>, request: ExecuteRequest, cancel: CancellationToken) {
    let job_id = request.job_id;
    let stream = state.stream_for(job_id);
    tracing::info!(job_id = %job_id, command = %request.command, "Executing job");

    let (status, result, error) = execute(&request, &stream, cancel).await;
    tracing::info!(job_id = %job_id, status = %status, "Job execution finished");
    stream.push(JobStreamEvent::Status {
        status,
        result,
        error_message: error,
    });
    state.finish(job_id);
}

async fn execute(
    request: &ExecuteRequest,
    stream: &Arc<super::JobStream>,
    cancel: CancellationToken,
) -> (JobStatus, Option<Map<String, Value>>, Option<String>) {
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(&request.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return (
                JobStatus::Failed,
                None,
                Some(format!("failed to start command: {e}")),
            )
        }
    };

    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, line_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, line_tx.clone());
    }
    drop(line_tx);

    let deadline = if request.time_limit_secs > 0 {
        Some(tokio::time::Instant::now() + Duration::from_secs(request.time_limit_secs as u64))
    } else {
        None
    };

    let mut result: Option<Map<String, Value>> = None;
    let mut last_line: Option<String> = None;
    let mut outcome: Option<(JobStatus, Option<String>)> = None;

    loop {
        let time_limit = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            line = line_rx.recv() => {
                match line {
                    Some(line) => {
                        handle_line(&line, stream, &mut result, &mut last_line);
                    }
                    None => {
                        // Output closed; wait for the exit status.
                        let status = child.wait().await;
                        outcome = Some(exit_outcome(status, last_line.take()));
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                kill_child(&mut child).await;
                outcome = Some((
                    JobStatus::Cancelled,
                    Some("job cancelled by request".to_string()),
                ));
                break;
            }
            _ = time_limit => {
                kill_child(&mut child).await;
                outcome = Some((
                    JobStatus::Failed,
                    Some(format!(
                        "time limit of {}s exceeded",
                        request.time_limit_secs
                    )),
                ));
                break;
            }
        }
    }

    // Drain whatever output arrived before the process died.
    while let Ok(line) = line_rx.try_recv() {
        handle_line(&line, stream, &mut result, &mut last_line);
    }

    let (status, error) = outcome.unwrap_or((JobStatus::Failed, Some("unknown outcome".into())));
    (status, result, error)
}

fn handle_line(
    line: &str,
    stream: &Arc<super::JobStream>,
    result: &mut Option<Map<String, Value>>,
    last_line: &mut Option<String>,
) {
    if let Some(raw) = line.trim().strip_prefix("PROGRESS:") {
        if let Ok(progress) = raw.trim().parse::<u8>() {
            stream.push(JobStreamEvent::Progress(progress.min(100)));
            return;
        }
    }
    if let Some(raw) = line.trim().strip_prefix("RESULT:") {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw.trim()) {
            *result = Some(map);
            return;
        }
    }
    *last_line = Some(line.to_string());
    stream.push(JobStreamEvent::LogLine(line.to_string()));
}

fn spawn_line_reader(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

fn exit_outcome(
    status: std::io::Result<std::process::ExitStatus>,
    last_line: Option<String>,
) -> (JobStatus, Option<String>) {
    match status {
        Ok(status) if status.success() => (JobStatus::Completed, None),
        Ok(status) => {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "killed by signal".to_string());
            let detail = match last_line {
                Some(line) => format!("exit code {code}: {line}"),
                None => format!("exit code {code}"),
            };
            (JobStatus::Failed, Some(detail))
        }
        Err(e) => (JobStatus::Failed, Some(format!("wait failed: {e}"))),
    }
}

async fn kill_child(child: &mut tokio::process::Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "Failed to kill job process");
    }
    let _ = child.wait().await;
}
