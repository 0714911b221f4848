//! Worker node runner tests: command execution, output streaming, marker
//! parsing, cancellation, and time limits.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use dispatch_lite::config::WorkerNodeConfig;
use dispatch_lite::model::JobStatus;
use dispatch_lite::node::{runner, NodeState};
use dispatch_lite::transport::{ExecuteRequest, JobStreamEvent};

fn node_state(max_jobs: u32) -> Arc<NodeState> {
    let config = WorkerNodeConfig {
        name: "test-node".into(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        orchestrator_url: "http://127.0.0.1:1".into(),
        max_jobs,
        callback_token: None,
    };
    Arc::new(NodeState::new(config, CancellationToken::new()))
}

fn request(command: &str, time_limit_secs: i64) -> ExecuteRequest {
    ExecuteRequest {
        job_id: Uuid::new_v4(),
        command: command.to_string(),
        runtime_args: serde_json::Map::new(),
        time_limit_secs,
    }
}

/// Run a job to completion and return its stream frames.
async fn run_to_end(
    state: Arc<NodeState>,
    request: ExecuteRequest,
) -> Vec<JobStreamEvent> {
    let job_id = request.job_id;
    let cancel = state.admit(job_id).expect("admitted");
    runner::run_job(state.clone(), request, cancel).await;
    let (frames, _) = state.stream_for(job_id).subscribe();
    frames.into_iter().map(|f| f.event).collect()
}

fn terminal_of(events: &[JobStreamEvent]) -> (JobStatus, Option<String>) {
    match events.last().expect("at least one event") {
        JobStreamEvent::Status {
            status,
            error_message,
            ..
        } => (*status, error_message.clone()),
        other => panic!("last event is not terminal: {other:?}"),
    }
}

#[tokio::test]
async fn echo_completes_and_streams_output() {
    let state = node_state(2);
    let events = run_to_end(state, request("echo hello", 0)).await;

    assert!(events
        .iter()
        .any(|e| matches!(e, JobStreamEvent::LogLine(line) if line == "hello")));
    let (status, error) = terminal_of(&events);
    assert_eq!(status, JobStatus::Completed);
    assert!(error.is_none());
}

#[tokio::test]
async fn failing_command_reports_exit_code() {
    let state = node_state(2);
    let events = run_to_end(state, request("false", 0)).await;
    let (status, error) = terminal_of(&events);
    assert_eq!(status, JobStatus::Failed);
    assert!(error.unwrap().contains("exit code"));
}

#[tokio::test]
async fn stderr_is_captured() {
    let state = node_state(2);
    let events = run_to_end(state, request("echo oops >&2; exit 3", 0)).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, JobStreamEvent::LogLine(line) if line == "oops")));
    let (status, error) = terminal_of(&events);
    assert_eq!(status, JobStatus::Failed);
    assert!(error.unwrap().contains("oops"));
}

#[tokio::test]
async fn progress_and_result_markers_are_parsed() {
    let state = node_state(2);
    let command = r#"echo PROGRESS: 25; echo working; echo PROGRESS: 75; echo 'RESULT: {"answer": 42}'"#;
    let events = run_to_end(state, request(command, 0)).await;

    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            JobStreamEvent::Progress(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![25, 75]);

    // Marker lines do not leak into the log stream.
    assert!(!events
        .iter()
        .any(|e| matches!(e, JobStreamEvent::LogLine(line) if line.contains("PROGRESS"))));

    match events.last().unwrap() {
        JobStreamEvent::Status { status, result, .. } => {
            assert_eq!(*status, JobStatus::Completed);
            assert_eq!(
                result.as_ref().unwrap().get("answer"),
                Some(&serde_json::json!(42))
            );
        }
        other => panic!("unexpected terminal {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_kills_the_process() {
    let state = node_state(2);
    let req = request("sleep 30", 0);
    let job_id = req.job_id;
    let cancel = state.admit(job_id).expect("admitted");

    let run_state = state.clone();
    let handle = tokio::spawn(runner::run_job(run_state, req, cancel));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(state.cancel(job_id));

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("cancel must terminate the job promptly")
        .unwrap();

    let (frames, _) = state.stream_for(job_id).subscribe();
    let events: Vec<_> = frames.into_iter().map(|f| f.event).collect();
    let (status, error) = terminal_of(&events);
    assert_eq!(status, JobStatus::Cancelled);
    assert!(error.unwrap().contains("cancelled"));
}

#[tokio::test]
async fn time_limit_fails_the_job() {
    let state = node_state(2);
    let start = tokio::time::Instant::now();
    let events = run_to_end(state, request("sleep 30", 1)).await;
    assert!(start.elapsed() < Duration::from_secs(10));

    let (status, error) = terminal_of(&events);
    assert_eq!(status, JobStatus::Failed);
    assert!(error.unwrap().contains("time limit"));
}

#[tokio::test]
async fn capacity_is_released_after_completion() {
    let state = node_state(1);
    let first = request("true", 0);
    let cancel = state.admit(first.job_id).unwrap();
    assert!(state.admit(Uuid::new_v4()).is_none());

    runner::run_job(state.clone(), first, cancel).await;
    assert!(state.admit(Uuid::new_v4()).is_some());
}
