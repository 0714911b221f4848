//! Event bus and log fan-out ordering guarantees.

use std::time::Duration;

use dispatch_lite::events::{Event, EventBus, LogKind};
use dispatch_lite::logstore::{LogStore, TAIL_MAX_LINES, TRUNCATED_MARKER};

/// Per-job log lines reach every subscriber in publish order; what any
/// subscriber sees is a prefix of what the others see.
#[tokio::test]
async fn subscribers_see_log_lines_in_publish_order() {
    let bus = EventBus::new();
    let mut early = bus.subscribe();

    for i in 0..10 {
        bus.publish_log(LogKind::Job, "job-1", format!("line {i}"));
    }
    let mut late = bus.subscribe();
    for i in 10..20 {
        bus.publish_log(LogKind::Job, "job-1", format!("line {i}"));
    }

    let mut collect = |rx: &mut tokio::sync::broadcast::Receiver<_>| {
        let mut lines = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            if let dispatch_lite::events::Envelope {
                event: Event::LogLine { line, .. },
                ..
            } = envelope
            {
                lines.push(line);
            }
        }
        lines
    };

    let early_lines = collect(&mut early);
    let late_lines = collect(&mut late);
    assert_eq!(early_lines.len(), 20);
    assert_eq!(late_lines.len(), 10);
    for (i, line) in early_lines.iter().enumerate() {
        assert_eq!(line, &format!("line {i}"));
    }
    // The late subscriber's view is a suffix of the full order, itself in
    // order; per-subscriber sequences never interleave.
    for (i, line) in late_lines.iter().enumerate() {
        assert_eq!(line, &format!("line {}", i + 10));
    }
}

#[tokio::test]
async fn log_sequences_are_per_entity() {
    let bus = EventBus::new();
    let mut rx = bus.subscribe();

    bus.publish_log(LogKind::Job, "a", "1");
    bus.publish_log(LogKind::Worker, "a", "1");
    bus.publish_log(LogKind::Job, "b", "1");
    bus.publish_log(LogKind::Job, "a", "2");

    let mut seqs = Vec::new();
    for _ in 0..4 {
        let envelope = rx.recv().await.unwrap();
        if let Event::LogLine {
            kind, entity_id, ..
        } = &envelope.event
        {
            seqs.push((*kind, entity_id.clone(), envelope.seq));
        }
    }
    assert_eq!(seqs[0], (LogKind::Job, "a".to_string(), 1));
    assert_eq!(seqs[1], (LogKind::Worker, "a".to_string(), 1));
    assert_eq!(seqs[2], (LogKind::Job, "b".to_string(), 1));
    assert_eq!(seqs[3], (LogKind::Job, "a".to_string(), 2));
}

#[tokio::test]
async fn tail_overflow_stamps_truncation_marker() {
    let dir = tempfile::tempdir().unwrap();
    let store = LogStore::new(dir.path().to_path_buf());

    for i in 0..(TAIL_MAX_LINES + 50) {
        store
            .append(LogKind::Job, "big", &format!("line {i}"))
            .await
            .unwrap();
    }

    let tail = store.tail(LogKind::Job, "big");
    assert_eq!(tail[0], TRUNCATED_MARKER);
    assert!(tail.len() <= TAIL_MAX_LINES + 1);
    // Newest lines survive.
    assert_eq!(
        tail.last().unwrap(),
        &format!("line {}", TAIL_MAX_LINES + 49)
    );
    // The artifact on disk keeps everything.
    let content = store.read(LogKind::Job, "big").await.unwrap();
    assert!(content.contains("line 0"));
}

#[tokio::test]
async fn dispatcher_wakeup_fires_on_queue_and_worker_events() {
    let bus = EventBus::new();
    let queue = dispatch_lite::model::Queue {
        id: 1,
        name: "main".into(),
        description: None,
        priority: dispatch_lite::model::QueuePriority::Normal,
        strategy: dispatch_lite::model::DispatchStrategy::RoundRobin,
        state: dispatch_lite::model::QueueState::Started,
        is_default: true,
        time_limit_secs: 60,
        rr_cursor: 0,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    bus.publish_queue(queue);
    tokio::time::timeout(Duration::from_millis(100), bus.dispatch_wakeup())
        .await
        .expect("queue update must wake the dispatcher");
}
