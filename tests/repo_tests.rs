//! Repository invariants: atomic reservation, capacity checks, default
//! queue exclusivity, and startup recovery.

mod test_harness;

use std::sync::Arc;

use dispatch_lite::model::{DispatchStrategy, Job, JobStatus, QueueState};
use dispatch_lite::repo::{MemoryRepository, Page, QueuePatch, Repository};

use test_harness::*;

fn pending_job(queue: &str) -> Job {
    Job::new("spec".into(), queue.into(), serde_json::Map::new(), None)
}

#[tokio::test]
async fn concurrent_reserves_admit_exactly_one_winner() {
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let worker_a = seed_worker(repo.as_ref(), "a", 1, 10).await;
    let worker_b = seed_worker(repo.as_ref(), "b", 2, 10).await;

    let job = pending_job("main");
    repo.insert_job(&job).await.unwrap();

    let repo_a = repo.clone();
    let repo_b = repo.clone();
    let id = job.id;
    let (left, right) = tokio::join!(
        async move { repo_a.reserve_job(id, &worker_a).await.unwrap() },
        async move { repo_b.reserve_job(id, &worker_b).await.unwrap() },
    );
    let winners = [left.is_some(), right.is_some()]
        .iter()
        .filter(|w| **w)
        .count();
    assert_eq!(winners, 1, "exactly one reservation must win");
}

#[tokio::test]
async fn reserve_respects_worker_capacity() {
    let repo = MemoryRepository::new();
    let worker = seed_worker(&repo, "w", 1, 1).await;
    seed_running_job(&repo, "main", "w").await;

    let job = pending_job("main");
    repo.insert_job(&job).await.unwrap();
    assert!(repo.reserve_job(job.id, &worker).await.unwrap().is_none());
}

#[tokio::test]
async fn release_returns_job_to_pending() {
    let repo = MemoryRepository::new();
    let worker = seed_worker(&repo, "w", 1, 2).await;
    let job = pending_job("main");
    repo.insert_job(&job).await.unwrap();

    let reserved = repo.reserve_job(job.id, &worker).await.unwrap().unwrap();
    assert_eq!(reserved.status, JobStatus::Running);
    assert!(reserved.started_at.is_some());

    let released = repo.release_job(job.id).await.unwrap().unwrap();
    assert_eq!(released.status, JobStatus::Pending);
    assert!(released.assigned_worker.is_none());
    assert!(released.started_at.is_none());

    // Releasing a non-Running job is a no-op.
    assert!(repo.release_job(job.id).await.unwrap().is_none());
}

#[tokio::test]
async fn oldest_pending_orders_by_creation_then_id() {
    let repo = MemoryRepository::new();
    let mut first = pending_job("main");
    let mut second = pending_job("main");
    let base = chrono::Utc::now();
    first.created_at = base;
    second.created_at = base + chrono::Duration::seconds(1);
    repo.insert_job(&second).await.unwrap();
    repo.insert_job(&first).await.unwrap();

    let oldest = repo.oldest_pending_job("main").await.unwrap().unwrap();
    assert_eq!(oldest.id, first.id);

    // Same timestamp: lowest id wins.
    let mut tied_a = pending_job("tied");
    let mut tied_b = pending_job("tied");
    tied_a.created_at = base;
    tied_b.created_at = base;
    let expected = tied_a.id.min(tied_b.id);
    repo.insert_job(&tied_a).await.unwrap();
    repo.insert_job(&tied_b).await.unwrap();
    let oldest = repo.oldest_pending_job("tied").await.unwrap().unwrap();
    assert_eq!(oldest.id, expected);
}

#[tokio::test]
async fn at_most_one_default_queue() {
    let repo = MemoryRepository::new();
    let first = seed_queue(
        &repo,
        "first",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        true,
    )
    .await;
    let second = seed_queue(
        &repo,
        "second",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        true,
    )
    .await;

    assert!(!repo.get_queue(first.id).await.unwrap().unwrap().is_default);
    assert!(repo.get_queue(second.id).await.unwrap().unwrap().is_default);

    repo.update_queue(
        first.id,
        QueuePatch {
            is_default: Some(true),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let defaults: Vec<_> = repo
        .list_queues(Page::default())
        .await
        .unwrap()
        .0
        .into_iter()
        .filter(|q| q.is_default)
        .collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].id, first.id);
}

#[tokio::test]
async fn duplicate_names_conflict() {
    let repo = MemoryRepository::new();
    seed_queue(
        &repo,
        "main",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        false,
    )
    .await;
    let err = repo
        .create_queue(dispatch_lite::repo::NewQueue {
            name: "main".into(),
            description: None,
            priority: dispatch_lite::model::QueuePriority::Normal,
            strategy: DispatchStrategy::Random,
            state: QueueState::Stopped,
            is_default: false,
            time_limit_secs: 60,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, dispatch_lite::error::DispatchError::Conflict(_)));

    seed_worker(&repo, "w", 1, 1).await;
    let now = chrono::Utc::now();
    let duplicate = dispatch_lite::model::Worker {
        id: 0,
        name: "w".into(),
        kind: dispatch_lite::model::WorkerKind::Local,
        hostname: None,
        ip_address: None,
        port: 2,
        ssh_user: None,
        auth_method: None,
        ssh_private_key: None,
        password: None,
        provision: false,
        max_jobs: 1,
        status: dispatch_lite::model::WorkerStatus::Offline,
        state: dispatch_lite::model::WorkerState::Stopped,
        last_seen: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    };
    assert!(repo.create_worker(duplicate).await.is_err());
}

#[tokio::test]
async fn rr_cursor_advances_on_every_selection() {
    let repo = MemoryRepository::new();
    let queue = seed_queue(
        &repo,
        "main",
        DispatchStrategy::RoundRobin,
        QueueState::Started,
        false,
    )
    .await;
    assert_eq!(repo.advance_rr_cursor(queue.id).await.unwrap(), 0);
    assert_eq!(repo.advance_rr_cursor(queue.id).await.unwrap(), 1);
    assert_eq!(repo.advance_rr_cursor(queue.id).await.unwrap(), 2);
}

#[tokio::test]
async fn recovery_fails_interrupted_running_jobs() {
    let repo = MemoryRepository::new();
    seed_running_job(&repo, "main", "w").await;
    seed_running_job(&repo, "main", "w").await;
    let untouched = pending_job("main");
    repo.insert_job(&untouched).await.unwrap();

    let recovered = repo
        .recover_interrupted_jobs("OrchestratorShutdown")
        .await
        .unwrap();
    assert_eq!(recovered.len(), 2);
    for job in recovered {
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("OrchestratorShutdown"));
        assert!(job.completed_at.is_some());
    }
    assert_eq!(
        repo.get_job(untouched.id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );
}

#[tokio::test]
async fn finish_job_rejects_invalid_transitions() {
    let repo = MemoryRepository::new();
    let job = pending_job("main");
    repo.insert_job(&job).await.unwrap();

    // Pending cannot complete directly, only cancel.
    assert!(repo
        .finish_job(job.id, JobStatus::Completed, None, None)
        .await
        .unwrap()
        .is_none());
    assert!(repo
        .finish_job(job.id, JobStatus::Cancelled, None, None)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn exclude_filter_and_pagination() {
    let repo = MemoryRepository::new();
    for _ in 0..5 {
        repo.insert_job(&pending_job("main")).await.unwrap();
    }
    let done = seed_running_job(&repo, "main", "w").await;
    repo.finish_job(done.id, JobStatus::Completed, None, None)
        .await
        .unwrap();

    let (jobs, total) = repo
        .list_jobs(
            Page {
                page: 1,
                per_page: 3,
            },
            &[JobStatus::Completed],
        )
        .await
        .unwrap();
    assert_eq!(total, 5);
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.status != JobStatus::Completed));
}
