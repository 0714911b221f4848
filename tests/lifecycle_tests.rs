//! Job lifecycle controller tests: intake, cancel/retry/move/delete, and
//! the worker event intake guarantees.

mod test_harness;

use dispatch_lite::error::DispatchError;
use dispatch_lite::model::{DispatchStrategy, JobStatus, QueueState};

use test_harness::*;

#[tokio::test]
async fn run_requires_a_default_queue() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    seed_spec(state.repo.as_ref(), "echo", "echo hi").await;

    let err = state
        .jobs
        .run("echo", serde_json::Map::new(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoDefaultQueue));
}

#[tokio::test]
async fn run_rejects_unknown_spec_and_inactive_spec() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    seed_queue(
        state.repo.as_ref(),
        "main",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        true,
    )
    .await;

    let err = state
        .jobs
        .run("nope", serde_json::Map::new(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotFound(..)));

    let spec = seed_spec(state.repo.as_ref(), "dormant", "echo hi").await;
    state
        .repo
        .update_spec(
            spec.id,
            dispatch_lite::repo::SpecPatch {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = state
        .jobs
        .run("dormant", serde_json::Map::new(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Validation(_)));
}

#[tokio::test]
async fn stopped_queue_refuses_intake_paused_accepts() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    seed_spec(state.repo.as_ref(), "echo", "echo hi").await;
    seed_queue(
        state.repo.as_ref(),
        "stopped",
        DispatchStrategy::RoundRobin,
        QueueState::Stopped,
        false,
    )
    .await;
    seed_queue(
        state.repo.as_ref(),
        "paused",
        DispatchStrategy::RoundRobin,
        QueueState::Paused,
        false,
    )
    .await;

    let err = state
        .jobs
        .run("echo", serde_json::Map::new(), None, Some("stopped".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Conflict(_)));

    let job = state
        .jobs
        .run("echo", serde_json::Map::new(), None, Some("paused".into()))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.queue_name, "paused");
}

#[tokio::test]
async fn cancel_pending_goes_straight_to_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    seed_spec(state.repo.as_ref(), "echo", "echo hi").await;
    seed_queue(
        state.repo.as_ref(),
        "main",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        true,
    )
    .await;

    let job = state
        .jobs
        .run("echo", serde_json::Map::new(), None, None)
        .await
        .unwrap();
    let cancelled = state.jobs.cancel(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
    assert!(cancelled.error_message.is_some());

    // Terminal: a second cancel is refused.
    let err = state.jobs.cancel(job.id).await.unwrap_err();
    assert!(matches!(err, DispatchError::NotCancellable));
}

#[tokio::test]
async fn retry_clones_args_and_leaves_original_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    seed_spec(state.repo.as_ref(), "echo", "echo {{word}}").await;
    seed_queue(
        state.repo.as_ref(),
        "main",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        true,
    )
    .await;

    let mut args = serde_json::Map::new();
    args.insert("word".into(), serde_json::json!("again"));
    let job = state
        .jobs
        .run("echo", args.clone(), Some("tests".into()), None)
        .await
        .unwrap();

    // Drive it to Failed through the intake path.
    state
        .repo
        .reserve_job(job.id, &seed_worker(state.repo.as_ref(), "w1", 1, 1).await)
        .await
        .unwrap()
        .unwrap();
    state
        .jobs
        .ingest_terminal(job.id, JobStatus::Failed, None, Some("exit code 1".into()))
        .await
        .unwrap();

    let retry = state.jobs.retry(job.id).await.unwrap();
    assert_ne!(retry.id, job.id);
    assert_eq!(retry.status, JobStatus::Pending);
    assert_eq!(retry.runtime_args, args);
    assert_eq!(retry.queue_name, job.queue_name);

    let original = state.repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(original.status, JobStatus::Failed);
}

#[tokio::test]
async fn completed_and_active_jobs_cannot_be_retried() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    seed_spec(state.repo.as_ref(), "echo", "echo hi").await;
    seed_queue(
        state.repo.as_ref(),
        "main",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        true,
    )
    .await;

    let pending = state
        .jobs
        .run("echo", serde_json::Map::new(), None, None)
        .await
        .unwrap();
    assert!(state.jobs.retry(pending.id).await.is_err());

    let worker = seed_worker(state.repo.as_ref(), "w1", 1, 2).await;
    state
        .repo
        .reserve_job(pending.id, &worker)
        .await
        .unwrap()
        .unwrap();
    state
        .jobs
        .ingest_terminal(pending.id, JobStatus::Completed, None, None)
        .await
        .unwrap();
    let err = state.jobs.retry(pending.id).await.unwrap_err();
    assert!(matches!(err, DispatchError::Conflict(_)));
}

#[tokio::test]
async fn move_applies_only_to_pending_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    seed_spec(state.repo.as_ref(), "echo", "echo hi").await;
    seed_queue(
        state.repo.as_ref(),
        "main",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        true,
    )
    .await;
    seed_queue(
        state.repo.as_ref(),
        "other",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        false,
    )
    .await;

    let job = state
        .jobs
        .run("echo", serde_json::Map::new(), None, None)
        .await
        .unwrap();
    let moved = state.jobs.move_to_queue(job.id, "other").await.unwrap();
    assert_eq!(moved.queue_name, "other");

    let worker = seed_worker(state.repo.as_ref(), "w1", 1, 2).await;
    state
        .repo
        .reserve_job(job.id, &worker)
        .await
        .unwrap()
        .unwrap();
    let err = state.jobs.move_to_queue(job.id, "main").await.unwrap_err();
    assert!(matches!(err, DispatchError::Conflict(_)));
}

#[tokio::test]
async fn delete_requires_terminal_state_and_removes_logs() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    seed_spec(state.repo.as_ref(), "echo", "echo hi").await;
    seed_queue(
        state.repo.as_ref(),
        "main",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        true,
    )
    .await;

    let job = state
        .jobs
        .run("echo", serde_json::Map::new(), None, None)
        .await
        .unwrap();
    assert!(state.jobs.delete(job.id).await.is_err());

    state.jobs.cancel(job.id).await.unwrap();
    state.jobs.delete(job.id).await.unwrap();
    assert!(state.repo.get_job(job.id).await.unwrap().is_none());
    assert_eq!(
        state
            .logs
            .read(dispatch_lite::events::LogKind::Job, &job.id.to_string())
            .await
            .unwrap(),
        ""
    );
}

#[tokio::test]
async fn progress_is_monotonic_and_terminal_states_absorb() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    seed_spec(state.repo.as_ref(), "echo", "echo hi").await;
    seed_queue(
        state.repo.as_ref(),
        "main",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        true,
    )
    .await;

    let job = state
        .jobs
        .run("echo", serde_json::Map::new(), None, None)
        .await
        .unwrap();
    let worker = seed_worker(state.repo.as_ref(), "w1", 1, 2).await;
    state
        .repo
        .reserve_job(job.id, &worker)
        .await
        .unwrap()
        .unwrap();

    state.jobs.ingest_progress(job.id, 40).await.unwrap();
    // A stale lower value is dropped.
    state.jobs.ingest_progress(job.id, 10).await.unwrap();
    assert_eq!(
        state.repo.get_job(job.id).await.unwrap().unwrap().progress,
        40
    );

    state
        .jobs
        .ingest_terminal(job.id, JobStatus::Completed, None, None)
        .await
        .unwrap();
    // A late conflicting terminal report is ignored.
    state
        .jobs
        .ingest_terminal(job.id, JobStatus::Failed, None, Some("late".into()))
        .await
        .unwrap();
    let reloaded = state.repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, JobStatus::Completed);
    assert_eq!(reloaded.progress, 100);
    assert!(reloaded.error_message.is_none());
}

#[tokio::test]
async fn queue_with_pending_jobs_cannot_be_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    seed_spec(state.repo.as_ref(), "echo", "echo hi").await;
    seed_queue(
        state.repo.as_ref(),
        "main",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        true,
    )
    .await;
    let doomed = seed_queue(
        state.repo.as_ref(),
        "doomed",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        false,
    )
    .await;

    let job = state
        .jobs
        .run("echo", serde_json::Map::new(), None, Some("doomed".into()))
        .await
        .unwrap();
    let err = state.queues.delete(doomed.id).await.unwrap_err();
    assert!(matches!(err, DispatchError::Conflict(_)));

    // Once the job is terminal, the queue can go.
    state.jobs.cancel(job.id).await.unwrap();
    state.queues.delete(doomed.id).await.unwrap();
}

#[tokio::test]
async fn statistics_count_by_status_and_spec() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    seed_spec(state.repo.as_ref(), "a", "echo a").await;
    seed_spec(state.repo.as_ref(), "b", "echo b").await;
    seed_queue(
        state.repo.as_ref(),
        "main",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        true,
    )
    .await;

    for _ in 0..3 {
        state
            .jobs
            .run("a", serde_json::Map::new(), None, None)
            .await
            .unwrap();
    }
    let b_job = state
        .jobs
        .run("b", serde_json::Map::new(), None, None)
        .await
        .unwrap();
    state.jobs.cancel(b_job.id).await.unwrap();

    let stats = state.jobs.statistics().await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.by_status.get("Pending"), Some(&3));
    assert_eq!(stats.by_status.get("Cancelled"), Some(&1));
    assert_eq!(stats.by_spec[0], ("a".to_string(), 3));
}
