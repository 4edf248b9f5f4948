use std::sync::Arc;
use std::time::Duration;

use queue_worker_core::TaskSpec;
use queue_worker_memory::MemoryBackend;
use queue_worker_runtime::{Backend, QueueWorker};
use serde_json::{json, Map, Value};

use crate::support::test_clock;

/// A task a processing function never resolves should get reaped by the
/// timeout timer and returned to `start_state` with ownership cleared, while
/// the rest of its fields survive untouched.
#[tokio::test(start_paused = true)]
async fn stuck_task_is_reaped_back_to_start_state() {
    let backend = Arc::new(MemoryBackend::new("tasks"));
    let root = backend.root();

    let mut fields = Map::new();
    fields.insert("payload".to_owned(), json!("keep-me"));
    let reference = backend.enqueue(&root, Some("start"), fields);

    let worker = QueueWorker::builder(backend.clone(), root.clone())
        .process_id("timeout-test")
        .clock(test_clock())
        .processing_fn(|_handle| {
            // Never resolves; stands in for a worker process that crashed or
            // hung mid-task.
            Box::pin(std::future::pending::<()>())
        })
        .build()
        .await
        .expect("worker builds");

    worker
        .set_task_spec(Some(
            TaskSpec::new("in_progress")
                .with_start_state("start")
                .with_timeout(1_000),
        ))
        .await;

    // Let the claim and timer-arming happen, then jump well past the
    // timeout.
    tokio::time::advance(Duration::from_millis(50)).await;
    let in_progress = backend.peek(&reference).expect("task claimed");
    assert_eq!(in_progress.state(), Some("in_progress"));
    assert!(in_progress.owner().is_some());

    tokio::time::advance(Duration::from_millis(2_000)).await;
    // Allow the reaper's transaction and follow-up listener churn to settle.
    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_millis(10)).await;

    let reset = backend.peek(&reference).expect("task still exists after reap");
    assert_eq!(reset.state(), Some("start"));
    assert_eq!(reset.owner(), None);
    assert_eq!(reset.progress(), None);
    assert_eq!(reset.as_map().get("payload"), Some(&json!("keep-me")));

    worker.shutdown().await;
}

/// A spec with no `timeout` configured never arms a reaper, so a stuck task
/// just stays claimed forever.
#[tokio::test(start_paused = true)]
async fn task_without_timeout_is_never_reaped() {
    let backend = Arc::new(MemoryBackend::new("tasks"));
    let root = backend.root();
    let reference = backend.enqueue(&root, Some("start"), Map::new());

    let worker = QueueWorker::builder(backend.clone(), root.clone())
        .process_id("timeout-test")
        .clock(test_clock())
        .processing_fn(|_handle| Box::pin(std::future::pending::<()>()))
        .build()
        .await
        .expect("worker builds");

    worker
        .set_task_spec(Some(TaskSpec::new("in_progress").with_start_state("start")))
        .await;

    tokio::time::advance(Duration::from_millis(50)).await;
    tokio::time::advance(Duration::from_secs(3_600)).await;

    let still_claimed = backend.peek(&reference).expect("task exists");
    assert_eq!(still_claimed.state(), Some("in_progress"));
    assert!(still_claimed.owner().is_some());

    worker.shutdown().await;
}
