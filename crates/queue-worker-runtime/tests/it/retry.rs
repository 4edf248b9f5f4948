use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use queue_worker_core::TaskSpec;
use queue_worker_memory::MemoryBackend;
use queue_worker_runtime::{Backend, QueueWorker};
use serde_json::Map;
use tokio::sync::Notify;

/// A task rejected within its retry budget goes back to `start_state` and
/// gets reclaimed; one rejected past the budget lands in `error_state` and
/// stops being reclaimed.
#[tokio::test]
async fn rejected_task_retries_then_lands_in_error_state() {
    let backend = Arc::new(MemoryBackend::new("tasks"));
    let root = backend.root();
    let reference = backend.enqueue(&root, Some("start"), Map::new());

    let attempts = Arc::new(AtomicU32::new(0));
    let settled = Arc::new(Notify::new());

    let worker = QueueWorker::builder(backend.clone(), root.clone())
        .process_id("retry-test")
        .processing_fn({
            let attempts = attempts.clone();
            let settled = settled.clone();
            move |handle| {
                let attempts = attempts.clone();
                let settled = settled.clone();
                Box::pin(async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt <= 2 {
                        handle.reject(format!("attempt {attempt} failed"), None).await;
                    } else {
                        handle.resolve(None).await;
                        settled.notify_one();
                    }
                })
            }
        })
        .build()
        .await
        .expect("worker builds");

    worker
        .set_task_spec(Some(
            TaskSpec::new("in_progress")
                .with_start_state("start")
                .with_retries(2),
        ))
        .await;

    tokio::time::timeout(Duration::from_secs(2), settled.notified())
        .await
        .expect("task eventually resolves within its retry budget");

    // `resolve(None)` with no `finished_state` configured deletes the task.
    assert_eq!(backend.peek(&reference), None);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    worker.shutdown().await;
}

#[tokio::test]
async fn rejection_past_retry_budget_lands_in_configured_error_state() {
    let backend = Arc::new(MemoryBackend::new("tasks"));
    let root = backend.root();
    let reference = backend.enqueue(&root, Some("start"), Map::new());

    let settled = Arc::new(Notify::new());

    let worker = QueueWorker::builder(backend.clone(), root.clone())
        .process_id("retry-test")
        .processing_fn({
            let settled = settled.clone();
            move |handle| {
                let settled = settled.clone();
                Box::pin(async move {
                    handle.reject("always fails", None).await;
                    settled.notify_one();
                })
            }
        })
        .build()
        .await
        .expect("worker builds");

    worker
        .set_task_spec(Some(
            TaskSpec::new("in_progress")
                .with_start_state("start")
                .with_error_state("quarantined")
                .with_retries(0),
        ))
        .await;

    // `retries(0)` means the very first rejection already exceeds budget.
    tokio::time::timeout(Duration::from_secs(2), settled.notified())
        .await
        .expect("rejection observed");
    // Let the commit land before reading it back.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let final_record = backend.peek(&reference).expect("task still exists, quarantined");
    assert_eq!(final_record.state(), Some("quarantined"));
    assert_eq!(final_record.owner(), None);
    let details = final_record.error_details().expect("error details recorded");
    assert_eq!(details.attempts, 1);
    assert_eq!(details.error.as_deref(), Some("always fails"));

    worker.shutdown().await;
}
