use std::sync::Arc;
use std::time::Duration;

use queue_worker_core::TaskSpec;
use queue_worker_memory::MemoryBackend;
use queue_worker_runtime::{Backend, QueueWorker};
use serde_json::Map;
use tokio::sync::Notify;

/// `shutdown()` must wait for an in-flight processing function to actually
/// finish committing its result before resolving, rather than returning as
/// soon as the shutdown flag is set.
#[tokio::test]
async fn shutdown_waits_for_in_flight_task_to_resolve() {
    let backend = Arc::new(MemoryBackend::new("tasks"));
    let root = backend.root();
    let reference = backend.enqueue(&root, Some("start"), Map::new());

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let worker = QueueWorker::builder(backend.clone(), root.clone())
        .process_id("shutdown-test")
        .processing_fn({
            let entered = entered.clone();
            let release = release.clone();
            move |handle| {
                let entered = entered.clone();
                let release = release.clone();
                Box::pin(async move {
                    entered.notify_one();
                    release.notified().await;
                    handle.resolve(None).await;
                })
            }
        })
        .build()
        .await
        .expect("worker builds");

    worker
        .set_task_spec(Some(TaskSpec::new("in_progress").with_start_state("start")))
        .await;

    // Wait until the processing function is actually mid-flight before
    // asking for shutdown.
    tokio::time::timeout(Duration::from_secs(1), entered.notified())
        .await
        .expect("processing function entered");

    let shutdown = worker.shutdown();
    tokio::pin!(shutdown);

    // The task hasn't resolved yet, so shutdown must not have completed.
    tokio::select! {
        _ = &mut shutdown => panic!("shutdown resolved before the in-flight task finished"),
        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
    }

    release.notify_one();

    tokio::time::timeout(Duration::from_secs(1), shutdown)
        .await
        .expect("shutdown completes once the in-flight task resolves");

    assert_eq!(backend.peek(&reference), None);
}

/// Shutdown with nothing in flight resolves immediately.
#[tokio::test]
async fn shutdown_is_immediate_when_idle() {
    let backend = Arc::new(MemoryBackend::new("tasks"));
    let root = backend.root();

    let worker = QueueWorker::builder(backend.clone(), root.clone())
        .process_id("shutdown-test")
        .processing_fn(|handle| Box::pin(async move { handle.resolve(None).await }))
        .build()
        .await
        .expect("worker builds");

    worker
        .set_task_spec(Some(TaskSpec::new("in_progress").with_start_state("start")))
        .await;

    tokio::time::timeout(Duration::from_millis(500), worker.shutdown())
        .await
        .expect("shutdown with no in-flight work resolves promptly");
}
