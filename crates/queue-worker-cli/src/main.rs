use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use queue_worker_core::TaskSpec;
use queue_worker_memory::MemoryBackend;
use queue_worker_runtime::{Backend, QueueWorker};
use serde_json::{json, Map, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[derive(Debug, clap::Parser)]
struct Args {
    /// Identifies this process in task owner tokens (`<process_id>:<n>`).
    #[arg(long, env = "QUEUE_WORKER_PROCESS_ID", default_value = "queue-worker-cli")]
    process_id: String,

    /// How many demo tasks to seed into the "fetch" stage on startup.
    #[arg(long, default_value_t = 5)]
    seed_tasks: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .without_time()
            .with_filter(tracing_subscriber::EnvFilter::from_default_env()),
    );
    registry.init();

    let args = Args::parse();

    let backend = Arc::new(MemoryBackend::new("tasks"));
    let tasks_ref = backend.root();

    let fetch_worker = QueueWorker::builder(backend.clone(), tasks_ref.clone())
        .process_id(format!("{}-fetch", args.process_id))
        .processing_fn(|handle| {
            Box::pin(async move {
                let url = handle
                    .data
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or("<unknown>")
                    .to_owned();
                tracing::info!(%url, "fetched");

                let mut new_task = handle.data.clone();
                new_task.insert("_new_state".to_owned(), Value::String("process".to_owned()));
                handle.resolve(Some(Value::Object(new_task))).await;
            })
        })
        .build()
        .await
        .context("failed to build fetch worker")?;

    fetch_worker
        .set_task_spec(Some(
            TaskSpec::new("fetching")
                .with_start_state("fetch")
                .with_finished_state("process")
                .with_timeout(30_000)
                .with_retries(3),
        ))
        .await;

    let process_worker = QueueWorker::builder(backend.clone(), tasks_ref.clone())
        .process_id(format!("{}-process", args.process_id))
        .processing_fn(|handle| {
            Box::pin(async move {
                let url = handle.data.get("url").and_then(Value::as_str).unwrap_or("<unknown>").to_owned();
                tracing::info!(%url, "processed");
                handle.resolve(None).await;
            })
        })
        .build()
        .await
        .context("failed to build process worker")?;

    process_worker
        .set_task_spec(Some(
            TaskSpec::new("processing")
                .with_start_state("process")
                .with_timeout(30_000)
                .with_retries(3),
        ))
        .await;

    for i in 0..args.seed_tasks {
        let mut fields = Map::new();
        fields.insert("url".to_owned(), json!(format!("https://example.com/{i}")));
        backend.enqueue(&tasks_ref, Some("fetch"), fields);
    }

    tracing::info!(seed_tasks = args.seed_tasks, "queue-worker-cli starting up!");

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => (),
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    tracing::info!("got signal, shutting down");
    tokio::join!(fetch_worker.shutdown(), process_worker.shutdown());

    Ok(())
}
