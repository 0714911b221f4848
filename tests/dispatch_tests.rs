//! End-to-end dispatch tests: pending jobs flow through the dispatcher to
//! real worker node processes (spawned in-task) and come back terminal
//! over the worker event stream.

mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use dispatch_lite::events::LogKind;
use dispatch_lite::model::{DispatchStrategy, JobStatus, QueueState, WorkerStatus};
use dispatch_lite::queues::Dispatcher;
use dispatch_lite::transport::WorkerClient;

use test_harness::*;

fn dispatcher(state: &dispatch_lite::api::AppState) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        state.repo.clone(),
        state.bus.clone(),
        state.logs.clone(),
        WorkerClient::new(),
        state.jobs.clone(),
    ))
}

#[tokio::test]
async fn happy_path_echo_job_completes_with_logs() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let port = free_port();
    let node = spawn_worker_node("w1", port, 4);
    tokio::time::sleep(Duration::from_millis(200)).await;

    seed_spec(state.repo.as_ref(), "echo", "echo hi").await;
    let queue = seed_queue(
        state.repo.as_ref(),
        "main",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        true,
    )
    .await;
    let worker = seed_worker(state.repo.as_ref(), "w1", port, 4).await;
    state
        .repo
        .assign_worker_to_queue(queue.id, worker.id)
        .await
        .unwrap();

    let job = state
        .jobs
        .run("echo", serde_json::Map::new(), Some("tests".into()), None)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let dispatcher = dispatcher(&state);
    let cancel = CancellationToken::new();
    dispatcher.dispatch_pass(&cancel).await.unwrap();

    wait_for_status(
        state.repo.as_ref(),
        job.id,
        JobStatus::Completed,
        Duration::from_secs(10),
    )
    .await;

    let reloaded = state.repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(reloaded.assigned_worker.as_deref(), Some("w1"));
    assert!(reloaded.started_at.is_some());
    assert!(reloaded.completed_at.is_some());
    assert_eq!(reloaded.progress, 100);

    // The worker's output made it into the job log artifact.
    let ok = wait_until(Duration::from_secs(5), || async {
        state
            .logs
            .read(LogKind::Job, &job.id.to_string())
            .await
            .map(|content| content.contains("hi"))
            .unwrap_or(false)
    })
    .await;
    assert!(ok, "job log never contained command output");

    node.cancel();
}

#[tokio::test]
async fn least_loaded_prefers_idle_worker() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let port = free_port();
    let node = spawn_worker_node("w2", port, 4);
    tokio::time::sleep(Duration::from_millis(200)).await;

    seed_spec(state.repo.as_ref(), "echo", "echo balanced").await;
    let queue = seed_queue(
        state.repo.as_ref(),
        "main",
        DispatchStrategy::LeastLoaded,
        QueueState::Started,
        true,
    )
    .await;
    // w1 carries two running jobs and has no server behind it; the
    // strategy must never pick it.
    let w1 = seed_worker(state.repo.as_ref(), "w1", free_port(), 4).await;
    let w2 = seed_worker(state.repo.as_ref(), "w2", port, 4).await;
    state.repo.assign_worker_to_queue(queue.id, w1.id).await.unwrap();
    state.repo.assign_worker_to_queue(queue.id, w2.id).await.unwrap();
    seed_running_job(state.repo.as_ref(), "main", "w1").await;
    seed_running_job(state.repo.as_ref(), "main", "w1").await;

    let job = state
        .jobs
        .run("echo", serde_json::Map::new(), None, None)
        .await
        .unwrap();

    let dispatcher = dispatcher(&state);
    dispatcher
        .dispatch_pass(&CancellationToken::new())
        .await
        .unwrap();

    wait_for_status(
        state.repo.as_ref(),
        job.id,
        JobStatus::Completed,
        Duration::from_secs(10),
    )
    .await;
    let reloaded = state.repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(reloaded.assigned_worker.as_deref(), Some("w2"));

    node.cancel();
}

#[tokio::test]
async fn transport_failure_quarantines_worker_and_fails_over() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let port = free_port();
    let node = spawn_worker_node("w2", port, 4);
    tokio::time::sleep(Duration::from_millis(200)).await;

    seed_spec(state.repo.as_ref(), "echo", "echo failover").await;
    let queue = seed_queue(
        state.repo.as_ref(),
        "main",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        true,
    )
    .await;
    // w1 has nothing listening on its port: every execute fails.
    let w1 = seed_worker(state.repo.as_ref(), "w1", free_port(), 4).await;
    let w2 = seed_worker(state.repo.as_ref(), "w2", port, 4).await;
    state.repo.assign_worker_to_queue(queue.id, w1.id).await.unwrap();
    state.repo.assign_worker_to_queue(queue.id, w2.id).await.unwrap();

    let job_a = state
        .jobs
        .run("echo", serde_json::Map::new(), None, None)
        .await
        .unwrap();
    let job_b = state
        .jobs
        .run("echo", serde_json::Map::new(), None, None)
        .await
        .unwrap();

    let dispatcher = dispatcher(&state);
    dispatcher
        .dispatch_pass(&CancellationToken::new())
        .await
        .unwrap();

    // Both jobs end up on the healthy worker; the dead one is quarantined.
    wait_for_status(
        state.repo.as_ref(),
        job_a.id,
        JobStatus::Completed,
        Duration::from_secs(20),
    )
    .await;
    wait_for_status(
        state.repo.as_ref(),
        job_b.id,
        JobStatus::Completed,
        Duration::from_secs(20),
    )
    .await;

    for id in [job_a.id, job_b.id] {
        let job = state.repo.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.assigned_worker.as_deref(), Some("w2"));
    }
    let quarantined = state.repo.get_worker(w1.id).await.unwrap().unwrap();
    assert_eq!(quarantined.status, WorkerStatus::Error);
    assert!(quarantined.error_message.is_some());

    node.cancel();
}

#[tokio::test]
async fn moved_job_dispatches_on_target_queue() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let port = free_port();
    let node = spawn_worker_node("w1", port, 4);
    tokio::time::sleep(Duration::from_millis(200)).await;

    seed_spec(state.repo.as_ref(), "echo", "echo moved").await;
    // Queue A has no workers; queue B has an eligible one.
    seed_queue(
        state.repo.as_ref(),
        "a",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        true,
    )
    .await;
    let b = seed_queue(
        state.repo.as_ref(),
        "b",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        false,
    )
    .await;
    let worker = seed_worker(state.repo.as_ref(), "w1", port, 4).await;
    state.repo.assign_worker_to_queue(b.id, worker.id).await.unwrap();

    let job = state
        .jobs
        .run("echo", serde_json::Map::new(), None, Some("a".into()))
        .await
        .unwrap();

    let dispatcher = dispatcher(&state);
    dispatcher
        .dispatch_pass(&CancellationToken::new())
        .await
        .unwrap();
    let still_pending = state.repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(still_pending.status, JobStatus::Pending);

    state.jobs.move_to_queue(job.id, "b").await.unwrap();
    dispatcher
        .dispatch_pass(&CancellationToken::new())
        .await
        .unwrap();

    wait_for_status(
        state.repo.as_ref(),
        job.id,
        JobStatus::Completed,
        Duration::from_secs(10),
    )
    .await;
    let done = state.repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.queue_name, "b");

    node.cancel();
}

#[tokio::test]
async fn paused_queue_holds_jobs_until_resume() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let port = free_port();
    let node = spawn_worker_node("w1", port, 4);
    tokio::time::sleep(Duration::from_millis(200)).await;

    seed_spec(state.repo.as_ref(), "echo", "echo paused").await;
    let queue = seed_queue(
        state.repo.as_ref(),
        "main",
        DispatchStrategy::RoundRobin,
        QueueState::Paused,
        true,
    )
    .await;
    let worker = seed_worker(state.repo.as_ref(), "w1", port, 4).await;
    state
        .repo
        .assign_worker_to_queue(queue.id, worker.id)
        .await
        .unwrap();

    // Paused queues still take intake but refuse dispatch.
    let job = state
        .jobs
        .run("echo", serde_json::Map::new(), None, None)
        .await
        .unwrap();

    let dispatcher = dispatcher(&state);
    dispatcher
        .dispatch_pass(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        state.repo.get_job(job.id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    state.queues.start(queue.id).await.unwrap();
    dispatcher
        .dispatch_pass(&CancellationToken::new())
        .await
        .unwrap();
    wait_for_status(
        state.repo.as_ref(),
        job.id,
        JobStatus::Completed,
        Duration::from_secs(10),
    )
    .await;

    node.cancel();
}

#[tokio::test]
async fn cancel_running_job_converges() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let port = free_port();
    let node = spawn_worker_node("w1", port, 4);
    tokio::time::sleep(Duration::from_millis(200)).await;

    seed_spec(state.repo.as_ref(), "sleepy", "sleep 30").await;
    let queue = seed_queue(
        state.repo.as_ref(),
        "main",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        true,
    )
    .await;
    let worker = seed_worker(state.repo.as_ref(), "w1", port, 4).await;
    state
        .repo
        .assign_worker_to_queue(queue.id, worker.id)
        .await
        .unwrap();

    let job = state
        .jobs
        .run("sleepy", serde_json::Map::new(), None, None)
        .await
        .unwrap();
    let dispatcher = dispatcher(&state);
    dispatcher
        .dispatch_pass(&CancellationToken::new())
        .await
        .unwrap();
    wait_for_status(
        state.repo.as_ref(),
        job.id,
        JobStatus::Running,
        Duration::from_secs(10),
    )
    .await;

    state.jobs.cancel(job.id).await.unwrap();
    wait_for_status(
        state.repo.as_ref(),
        job.id,
        JobStatus::Cancelled,
        Duration::from_secs(5),
    )
    .await;
    let cancelled = state.repo.get_job(job.id).await.unwrap().unwrap();
    assert!(cancelled.error_message.is_some());

    node.cancel();
}
