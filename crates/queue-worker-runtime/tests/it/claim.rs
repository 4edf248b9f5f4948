use std::sync::{Arc, Mutex};
use std::time::Duration;

use queue_worker_core::TaskSpec;
use queue_worker_memory::MemoryBackend;
use queue_worker_runtime::{Backend, QueueWorker};
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;

#[tokio::test]
async fn worker_claims_only_the_eligible_candidate() {
    let backend = Arc::new(MemoryBackend::new("tasks"));
    let root = backend.root();

    let mut other = Map::new();
    other.insert("task".to_owned(), json!("1.other"));
    let other_ref = backend.enqueue(&root, Some("1.other"), other);

    let mut eligible = Map::new();
    eligible.insert("task".to_owned(), json!("2.start"));
    let eligible_ref = backend.enqueue(&root, Some("2.start"), eligible);

    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = Mutex::new(Some(done_tx));

    let worker = QueueWorker::builder(backend.clone(), root.clone())
        .process_id("claim-test")
        .processing_fn(move |handle| {
            let done_tx = done_tx.lock().unwrap().take();
            Box::pin(async move {
                let mut new_task = handle.data.clone();
                new_task.insert("_new_state".to_owned(), Value::String("done".to_owned()));
                handle.resolve(Some(Value::Object(new_task))).await;
                if let Some(tx) = done_tx {
                    let _ = tx.send(());
                }
            })
        })
        .build()
        .await
        .expect("worker builds");

    worker
        .set_task_spec(Some(
            TaskSpec::new("in_progress")
                .with_start_state("2.start")
                .with_finished_state("done"),
        ))
        .await;

    tokio::time::timeout(Duration::from_secs(1), done_rx)
        .await
        .expect("task processed within timeout")
        .expect("processing task did not panic before sending");

    let resolved = backend.peek(&eligible_ref).expect("eligible task still present");
    assert_eq!(resolved.state(), Some("done"));
    assert_eq!(resolved.as_map().get("task"), Some(&json!("2.start")));
    assert_eq!(resolved.owner(), None);

    let untouched = backend.peek(&other_ref).expect("non-matching task untouched");
    assert_eq!(untouched.state(), Some("1.other"));

    worker.shutdown().await;
}

/// A producer writing a non-object value at a task's location (a bug, or a
/// stray write from something that isn't the queue client) should end up
/// quarantined in the configured error state rather than wedging the worker
/// or being silently skipped.
#[tokio::test]
async fn malformed_task_is_quarantined_on_claim() {
    let backend = Arc::new(MemoryBackend::new("tasks"));
    let root = backend.root();
    let reference = backend.write_raw(&root, Value::String("not a task".to_owned()));

    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = Mutex::new(Some(done_tx));

    let worker = QueueWorker::builder(backend.clone(), root.clone())
        .process_id("claim-test")
        .processing_fn(move |handle| {
            let done_tx = done_tx.lock().unwrap().take();
            Box::pin(async move {
                // Never actually reached: a quarantined task is committed
                // straight to the error state by `claim_for` and never
                // handed to the processing function.
                handle.resolve(None).await;
                if let Some(tx) = done_tx {
                    let _ = tx.send(());
                }
            })
        })
        .build()
        .await
        .expect("worker builds");

    // Default `start_state` (`None`) matches a record with no `_state` at
    // all, which is exactly how a malformed, non-object node reads: there's
    // nothing to index into, so `query_matches` treats it the same as
    // "missing state" and hands it to `claim_for`, which recognizes it isn't
    // a real object and quarantines it.
    worker.set_task_spec(Some(TaskSpec::new("in_progress"))).await;

    // Give the listener a moment to observe and quarantine the node; the
    // processing function above should never fire.
    tokio::time::timeout(Duration::from_millis(200), done_rx).await.ok();

    let quarantined = backend.peek(&reference).expect("quarantine commits a well-formed record");
    assert_eq!(quarantined.state(), Some("error"));
    assert!(quarantined.error_details().is_some());

    worker.shutdown().await;
}
