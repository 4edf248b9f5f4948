use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use queue_worker_core::{TaskRecord, TaskSpec, TaskWorker};
use serde_json::{Map, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::backend::Backend;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{ConstructionError, ProgressError};
use crate::flag::ShutdownFlag;
use crate::util::metrics::MetricSpan;

/// The payload and callbacks handed to a processing function for one claimed
/// task.
///
/// Each callback captures the `task_number` this task was claimed under, so
/// a call arriving after another worker (or the timeout reaper) has taken the
/// task back is a silent no-op rather than a corrupting write — the same
/// staleness discipline the owner-token scheme uses for transactions
/// themselves.
pub struct TaskHandle<B: Backend> {
    pub data: Map<String, Value>,
    inner: Arc<Mutex<Inner<B>>>,
    task_ref: B::Reference,
    task_number: u64,
}

impl<B: Backend> TaskHandle<B> {
    async fn current_worker_if_live(&self) -> Option<TaskWorker> {
        let guard = self.inner.lock().await;
        if guard.task_number != self.task_number {
            return None;
        }
        guard.claimed_worker.clone()
    }

    /// Report progress on the task. Rejects without touching the backend if
    /// `p` is out of range, if this handle is stale, or if the transaction
    /// observes the task no longer owned by this process.
    pub async fn progress(&self, p: i64) -> Result<(), ProgressError> {
        if !(0..=100).contains(&p) {
            return Err(ProgressError::InvalidProgress);
        }

        let worker = self
            .current_worker_if_live()
            .await
            .ok_or(ProgressError::NoTaskCurrentlyBeingProcessed)?;
        let backend = self.inner.lock().await.backend.clone();

        let outcome = backend
            .transaction(
                &self.task_ref,
                Box::new(move |value| worker.update_progress_with(as_record(value), p)),
            )
            .await
            .map_err(|err| ProgressError::Backend(err.into()))?;

        if outcome.is_abort() {
            return Err(ProgressError::NoLongerOwned);
        }

        Ok(())
    }

    /// Resolve the task, advancing it to `finished_state` (or the state
    /// named by `_new_state` in `new_task`). A no-op if this handle is stale.
    pub async fn resolve(&self, new_task: Option<Value>) {
        let Some(worker) = self.current_worker_if_live().await else {
            return;
        };
        let backend = self.inner.lock().await.backend.clone();

        let result = backend
            .transaction(
                &self.task_ref,
                Box::new(move |value| worker.resolve_with(as_record(value), new_task.clone())),
            )
            .await;

        match &result {
            Ok(_) => tracing::debug!(task = %self.task_ref, "resolved"),
            Err(err) => tracing::warn!(task = %self.task_ref, %err, "resolve transaction failed"),
        }

        self.finish().await;
    }

    /// Reject the task, routing it back to `start_state` or `error_state`
    /// depending on its retry budget. A no-op if this handle is stale.
    pub async fn reject(&self, error: impl std::fmt::Display, error_stack: Option<String>) {
        let Some(worker) = self.current_worker_if_live().await else {
            return;
        };
        let (backend, suppress_stack) = {
            let guard = self.inner.lock().await;
            (guard.backend.clone(), guard.suppress_stack)
        };
        let message = error.to_string();
        let stack = if suppress_stack { None } else { error_stack };

        let result = backend
            .transaction(
                &self.task_ref,
                Box::new(move |value| {
                    worker.reject_with(as_record(value), Some(message.clone()), stack.clone())
                }),
            )
            .await;

        match &result {
            Ok(_) => tracing::debug!(task = %self.task_ref, "rejected"),
            Err(err) => tracing::warn!(task = %self.task_ref, %err, "reject transaction failed"),
        }

        self.finish().await;
    }

    async fn finish(&self) {
        {
            let mut guard = self.inner.lock().await;
            if guard.task_number != self.task_number {
                return;
            }
            clear_claim(&mut guard);
        }
        try_to_process(self.inner.clone()).await;
    }
}

/// Drop the current claim, freeing the worker to pick up other work.
///
/// Bumps `task_number`, so any `TaskHandle` callback still outstanding for
/// the task being released becomes a no-op rather than racing a second
/// claim.
fn clear_claim<B: Backend>(guard: &mut Inner<B>) {
    guard.busy = false;
    guard.claimed_worker = None;
    guard.current_task_ref = None;
    guard.busy_span = None;
    guard.task_number += 1;
    let _ = guard.busy_tx.send(false);
}

/// Notice the task this worker currently holds being reassigned to a foreign
/// (or cleared) owner while still in-progress, and free the worker to claim
/// other work.
///
/// A legitimate owner change while a task stays in-progress shouldn't
/// normally happen — the spec's invalidation scenarios route through a state
/// change away from in-progress instead (see [`invalidate_if_removed`]) — but
/// this is the guard against it if it ever does.
async fn invalidate_if_stolen<B: Backend>(inner: &Arc<Mutex<Inner<B>>>, reference: &B::Reference, record: &TaskRecord) {
    let mut guard = inner.lock().await;
    if guard.current_task_ref.as_ref() != Some(reference) {
        return;
    }
    let still_ours = guard
        .claimed_worker
        .as_ref()
        .is_some_and(|worker| record.owner() == Some(worker.owner()));
    if still_ours {
        return;
    }
    clear_claim(&mut guard);
    drop(guard);
    try_to_process(inner.clone()).await;
}

/// Notice the task this worker currently holds having left the in-progress
/// state out from under it — reset by the timeout reaper, reset by an
/// external caller, or resolved/rejected by someone else entirely — and free
/// the worker to claim other work.
///
/// Without this, a processing function that never calls `resolve`/`reject`
/// (because its task was reset while the function was still running, e.g. by
/// the timeout reaper) leaves `busy` stuck `true` forever: `finish()` is the
/// only other place that clears it, and a processing function that never
/// returns never reaches it.
async fn invalidate_if_removed<B: Backend>(inner: &Arc<Mutex<Inner<B>>>, reference: &B::Reference) {
    let mut guard = inner.lock().await;
    if guard.current_task_ref.as_ref() != Some(reference) {
        return;
    }
    clear_claim(&mut guard);
    drop(guard);
    try_to_process(inner.clone()).await;
}

fn as_record(value: Option<Value>) -> Option<TaskRecord> {
    value.and_then(TaskRecord::from_value)
}

type ProcessingFn<B> = Arc<dyn Fn(TaskHandle<B>) -> BoxFuture<'static, ()> + Send + Sync>;

struct Inner<B: Backend> {
    backend: Arc<B>,
    tasks_ref: B::Reference,
    process_id: String,
    sanitize: bool,
    suppress_stack: bool,
    processing_fn: ProcessingFn<B>,
    config: Config,
    clock: Arc<dyn Clock>,

    spec: Option<TaskSpec>,
    /// The shared worker used for claim attempts and query construction.
    /// Its `owner` field is never inspected by the methods called on it
    /// (`claim_for`, `reset_if_timed_out`), so it doesn't need to track
    /// `task_number`.
    worker: Option<TaskWorker>,
    /// The owner-bound worker for whichever task is currently claimed, used
    /// by `TaskHandle::{progress,resolve,reject}`.
    claimed_worker: Option<TaskWorker>,
    task_number: u64,
    busy: bool,
    current_task_ref: Option<B::Reference>,
    busy_span: Option<MetricSpan>,

    listener_tasks: Vec<JoinHandle<()>>,
    expiry_timers: HashMap<B::Reference, JoinHandle<()>>,

    busy_tx: watch::Sender<bool>,
    shutdown: ShutdownFlag,
}

fn owner_token(process_id: &str, task_number: u64) -> String {
    format!("{process_id}:{task_number}")
}

/// A single worker's runtime: claims tasks from `tasks_ref` via `TaskWorker`
/// transactions, runs the processing function, and reaps abandoned
/// in-progress tasks.
///
/// `QueueWorker`'s process-local state (`busy`, `task_number`,
/// `expiry_timers`, ...) is confined behind one [`tokio::sync::Mutex`]; every
/// listener task and every `TaskHandle` callback locks it for the short
/// synchronous section that reads or mutates that state, then releases it
/// before awaiting a transaction or the processing function. This is what
/// keeps the single-worker invariants (at most one in-flight claim, a
/// monotonic `task_number`) true regardless of which `tokio` worker thread
/// happens to be polling at a given moment.
#[derive(Clone)]
pub struct QueueWorker<B: Backend> {
    inner: Arc<Mutex<Inner<B>>>,
    busy_rx: watch::Receiver<bool>,
}

impl<B: Backend> QueueWorker<B> {
    pub fn builder(backend: Arc<B>, tasks_ref: B::Reference) -> QueueWorkerBuilder<B> {
        QueueWorkerBuilder {
            backend,
            tasks_ref,
            process_id: None,
            sanitize: true,
            suppress_stack: false,
            processing_fn: None,
            config: Config::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Whether a spec is well-formed enough to install, per
    /// [`TaskSpec::validate`].
    pub fn is_valid_task_spec(spec: &TaskSpec) -> bool {
        spec.validate()
    }

    /// Install (or remove, with `None`) this worker's task spec.
    ///
    /// Always bumps `task_number`, invalidating any `TaskHandle` callbacks
    /// still outstanding from the previous spec, and tears down the previous
    /// spec's listeners. An invalid spec tears down silently rather than
    /// returning an error, matching the distilled contract.
    pub async fn set_task_spec(&self, spec: Option<TaskSpec>) {
        let mut guard = self.inner.lock().await;

        guard.task_number += 1;
        for handle in guard.listener_tasks.drain(..) {
            handle.abort();
        }

        let spec = spec.filter(TaskSpec::validate);
        let worker = spec.as_ref().map(|s| TaskWorker::new(s.clone(), guard.process_id.clone()));
        let keeps_timeout = worker.as_ref().is_some_and(TaskWorker::has_timeout);
        if !keeps_timeout {
            for (_, handle) in guard.expiry_timers.drain() {
                handle.abort();
            }
        }

        guard.worker = worker;
        guard.spec = spec;

        if let Some(worker) = guard.worker.clone() {
            // The in-progress listeners always run, not just when a timeout
            // is configured: besides arming the reaper, they're how a
            // worker notices its own current claim being reset out from
            // under it (by the reaper, or by an external caller) and frees
            // itself up rather than staying `busy` forever.
            let handles = vec![
                spawn_new_task_listener(self.inner.clone(), worker.clone()),
                spawn_in_progress_added_listener(self.inner.clone(), worker.clone()),
                spawn_in_progress_changed_listener(self.inner.clone(), worker.clone()),
                spawn_in_progress_removed_listener(self.inner.clone(), worker.clone()),
            ];
            guard.listener_tasks.extend(handles);
        }
    }

    /// Tear down listeners and timers, then wait for any in-flight processing
    /// function to resolve or reject. Idempotent: a second call observes the
    /// same already-raised flag and returns once teardown has happened once.
    pub fn shutdown(&self) -> impl Future<Output = ()> + '_ {
        async move {
            let mut guard = self.inner.lock().await;
            let already_raised = guard.shutdown.is_raised();
            if !already_raised {
                guard.shutdown.raise();
                for handle in guard.listener_tasks.drain(..) {
                    handle.abort();
                }
                for (_, handle) in guard.expiry_timers.drain() {
                    handle.abort();
                }
                guard.worker = None;
                guard.spec = None;
                tracing::debug!(process_id = %guard.process_id, "shutdown requested");
            }
            let interval = guard.config.shutdown_poll_interval;
            drop(guard);

            let mut rx = self.busy_rx.clone();
            while *rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Attempt to claim and begin processing the next eligible candidate, if this
/// worker isn't already busy. Called both from the `child_added` listener and
/// after a task finishes, since `watch_child_added` only fires for newly
/// inserted children and wouldn't otherwise surface a candidate that was
/// already present while this worker was busy.
async fn try_to_process<B: Backend>(inner: Arc<Mutex<Inner<B>>>) {
    let (worker, backend, tasks_ref, busy, shutting_down) = {
        let guard = inner.lock().await;
        (
            guard.worker.clone(),
            guard.backend.clone(),
            guard.tasks_ref.clone(),
            guard.busy,
            guard.shutdown.is_raised(),
        )
    };

    if shutting_down || busy {
        return;
    }
    let Some(worker) = worker else { return };

    match backend.get_candidate(&tasks_ref, &worker.next_query()).await {
        Ok(Some((reference, _))) => claim_and_process(inner, reference).await,
        Ok(None) => {}
        Err(err) => tracing::warn!(%err, "failed to fetch next candidate"),
    }
}

fn spawn_new_task_listener<B: Backend>(inner: Arc<Mutex<Inner<B>>>, worker: TaskWorker) -> JoinHandle<()> {
    let query = worker.next_query();
    let process_id = worker.owner().to_owned();

    tokio::spawn(
        async move {
            let (backend, tasks_ref) = {
                let guard = inner.lock().await;
                (guard.backend.clone(), guard.tasks_ref.clone())
            };
            let mut stream = backend.watch_child_added(&tasks_ref, query);
            while let Some((reference, _record)) = stream.next().await {
                claim_and_process(inner.clone(), reference).await;
            }
        }
        .instrument(tracing::debug_span!("next_task_listener", process_id = %process_id)),
    )
}

async fn claim_and_process<B: Backend>(inner: Arc<Mutex<Inner<B>>>, candidate: B::Reference) {
    let (busy, worker, process_id, task_number) = {
        let guard = inner.lock().await;
        (guard.busy, guard.worker.clone(), guard.process_id.clone(), guard.task_number)
    };

    let Some(worker) = worker else { return };
    if busy {
        return;
    }

    let claim_owner = owner_token(&process_id, task_number);
    let for_transaction = claim_owner.clone();
    let claiming_worker = worker.clone();

    let outcome = backend_transaction_claim(inner.clone(), &candidate, claiming_worker, for_transaction).await;

    let Ok(transaction) = outcome else {
        tracing::warn!(task = %candidate, error = ?outcome.err(), "claim transaction failed");
        return;
    };

    let Some(record) = transaction.into_commit() else {
        return;
    };

    if record.owner() != Some(claim_owner.as_str()) {
        // Stolen by a concurrent worker, or quarantined as malformed.
        return;
    }

    let claimed_worker = worker.with_owner(claim_owner);

    let (sanitize, processing_fn) = {
        let mut guard = inner.lock().await;
        if guard.task_number != task_number {
            return;
        }
        guard.busy = true;
        guard.current_task_ref = Some(candidate.clone());
        guard.claimed_worker = Some(claimed_worker.clone());
        guard.busy_span = Some(MetricSpan::enter(metrics::gauge!(
            "queue_worker_tasks_in_progress",
            "process_id" => process_id.clone()
        )));
        let _ = guard.busy_tx.send(true);
        (guard.sanitize, guard.processing_fn.clone())
    };

    let data = if sanitize {
        record.sanitize()
    } else {
        let mut map = record.as_map().clone();
        map.insert("_id".to_owned(), Value::String(candidate.to_string()));
        map
    };

    let handle = TaskHandle {
        data,
        inner: inner.clone(),
        task_ref: candidate.clone(),
        task_number,
    };

    tracing::debug!(task = %candidate, %process_id, "claimed");

    let panic_inner = inner.clone();
    let panic_ref = candidate.clone();
    let panic_worker = claimed_worker;
    tokio::spawn(async move {
        let outcome = AssertUnwindSafe((processing_fn)(handle)).catch_unwind().await;
        if let Err(panic) = outcome {
            let message = panic_message(&panic);
            tracing::warn!(task = %candidate, %message, "processing function panicked");
            reject_panicked_task(panic_inner, panic_ref, task_number, panic_worker, message).await;
        }
    });
}

/// Route a panicking processing function through the same `reject_with`
/// transition a normal `TaskHandle::reject` call would, since a throw is
/// just another way a task fails to complete.
///
/// Unlike `TaskHandle::reject`, there's no `TaskHandle` left to call it on —
/// the panic happened inside the future it owned, consuming it — so this
/// reconstructs the same staleness check and cleanup directly against
/// `Inner`.
fn reject_panicked_task<B: Backend>(
    inner: Arc<Mutex<Inner<B>>>,
    task_ref: B::Reference,
    task_number: u64,
    worker: TaskWorker,
    message: String,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let (backend, stale) = {
            let guard = inner.lock().await;
            (guard.backend.clone(), guard.task_number != task_number)
        };
        if stale {
            return;
        }

        let result = backend
            .transaction(
                &task_ref,
                Box::new(move |value| worker.reject_with(as_record(value), Some(message.clone()), None)),
            )
            .await;

        match &result {
            Ok(_) => tracing::debug!(task = %task_ref, "rejected after panic"),
            Err(err) => tracing::warn!(task = %task_ref, %err, "reject transaction failed after panic"),
        }

        let mut guard = inner.lock().await;
        if guard.task_number == task_number {
            clear_claim(&mut guard);
            drop(guard);
            try_to_process(inner.clone()).await;
        }
    })
}

async fn backend_transaction_claim<B: Backend>(
    inner: Arc<Mutex<Inner<B>>>,
    candidate: &B::Reference,
    worker: TaskWorker,
    claim_owner: String,
) -> Result<queue_worker_core::TaskTransaction, crate::backend::BackendError> {
    let backend = inner.lock().await.backend.clone();
    backend
        .transaction(candidate, Box::new(move |value| worker.claim_for(value, &claim_owner)))
        .await
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "processing function panicked".to_owned()
    }
}

fn spawn_in_progress_added_listener<B: Backend>(inner: Arc<Mutex<Inner<B>>>, worker: TaskWorker) -> JoinHandle<()> {
    let query = worker.in_progress_query();
    tokio::spawn(async move {
        let (backend, tasks_ref) = {
            let guard = inner.lock().await;
            (guard.backend.clone(), guard.tasks_ref.clone())
        };
        let mut stream = backend.watch_child_added(&tasks_ref, query);
        while let Some((reference, record)) = stream.next().await {
            arm_expiry_timer(inner.clone(), reference, record).await;
        }
    })
}

fn spawn_in_progress_changed_listener<B: Backend>(inner: Arc<Mutex<Inner<B>>>, worker: TaskWorker) -> JoinHandle<()> {
    let query = worker.in_progress_query();
    tokio::spawn(async move {
        let (backend, tasks_ref) = {
            let guard = inner.lock().await;
            (guard.backend.clone(), guard.tasks_ref.clone())
        };
        let mut stream = backend.watch_child_changed(&tasks_ref, query);
        while let Some((reference, record)) = stream.next().await {
            invalidate_if_stolen(&inner, &reference, &record).await;
            arm_expiry_timer(inner.clone(), reference, record).await;
        }
    })
}

fn spawn_in_progress_removed_listener<B: Backend>(inner: Arc<Mutex<Inner<B>>>, worker: TaskWorker) -> JoinHandle<()> {
    let query = worker.in_progress_query();
    tokio::spawn(async move {
        let (backend, tasks_ref) = {
            let guard = inner.lock().await;
            (guard.backend.clone(), guard.tasks_ref.clone())
        };
        let mut stream = backend.watch_child_removed(&tasks_ref, query);
        while let Some(reference) = stream.next().await {
            {
                let mut guard = inner.lock().await;
                if let Some(handle) = guard.expiry_timers.remove(&reference) {
                    handle.abort();
                }
            }
            invalidate_if_removed(&inner, &reference).await;
        }
    })
}

async fn arm_expiry_timer<B: Backend>(inner: Arc<Mutex<Inner<B>>>, reference: B::Reference, record: TaskRecord) {
    let (worker, clock, timeout) = {
        let guard = inner.lock().await;
        let Some(worker) = guard.worker.clone() else { return };
        let Some(spec) = &guard.spec else { return };
        let Some(timeout) = spec.timeout else { return };
        (worker, guard.clock.clone(), timeout)
    };

    let changed_at = record.state_changed().and_then(|ts| ts.as_millis());
    let now = clock.now_millis();
    let elapsed = changed_at.map(|c| now.saturating_sub(c)).unwrap_or(0).max(0);
    let delay_ms = (timeout as i64 - elapsed).max(0) as u64;

    let reaper_ref = reference.clone();
    let timer_inner = inner.clone();
    let timer_clock = clock.clone();
    let handle = tokio::spawn(async move {
        timer_clock.sleep(std::time::Duration::from_millis(delay_ms)).await;
        let backend = timer_inner.lock().await.backend.clone();
        let reset_ref = reaper_ref.clone();
        let reset_clock = timer_clock.clone();
        let result = backend
            .transaction(
                &reaper_ref,
                Box::new(move |value| worker.reset_if_timed_out(as_record(value), reset_clock.now_millis())),
            )
            .await;
        match result {
            Ok(transaction) if !transaction.is_abort() => {
                tracing::debug!(task = %reset_ref, "reaped timed-out task");
            }
            Err(err) => tracing::warn!(task = %reset_ref, %err, "timeout reset transaction failed"),
            _ => {}
        }
        timer_inner.lock().await.expiry_timers.remove(&reaper_ref);
    });

    let mut guard = inner.lock().await;
    if let Some(previous) = guard.expiry_timers.insert(reference, handle) {
        previous.abort();
    }
}

pub struct QueueWorkerBuilder<B: Backend> {
    backend: Arc<B>,
    tasks_ref: B::Reference,
    process_id: Option<String>,
    sanitize: bool,
    suppress_stack: bool,
    processing_fn: Option<ProcessingFn<B>>,
    config: Config,
    clock: Arc<dyn Clock>,
}

impl<B: Backend> QueueWorkerBuilder<B> {
    pub fn process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = Some(process_id.into());
        self
    }

    pub fn sanitize(mut self, sanitize: bool) -> Self {
        self.sanitize = sanitize;
        self
    }

    pub fn suppress_stack(mut self, suppress_stack: bool) -> Self {
        self.suppress_stack = suppress_stack;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn processing_fn<F>(mut self, processing_fn: F) -> Self
    where
        F: Fn(TaskHandle<B>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.processing_fn = Some(Arc::new(processing_fn));
        self
    }

    pub async fn build(self) -> Result<QueueWorker<B>, ConstructionError> {
        let process_id = self.process_id.ok_or(ConstructionError::InvalidProcessId)?;
        if process_id.is_empty() {
            return Err(ConstructionError::InvalidProcessId);
        }
        let processing_fn = self.processing_fn.ok_or(ConstructionError::NoProcessingFunction)?;

        let (busy_tx, busy_rx) = watch::channel(false);
        let inner = Arc::new(Mutex::new(Inner {
            backend: self.backend,
            tasks_ref: self.tasks_ref,
            process_id,
            sanitize: self.sanitize,
            suppress_stack: self.suppress_stack,
            processing_fn,
            config: self.config,
            clock: self.clock,
            spec: None,
            worker: None,
            claimed_worker: None,
            task_number: 0,
            busy: false,
            current_task_ref: None,
            busy_span: None,
            listener_tasks: Vec::new(),
            expiry_timers: HashMap::new(),
            busy_tx,
            shutdown: ShutdownFlag::new(),
        }));

        Ok(QueueWorker { inner, busy_rx })
    }
}
