use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A one-shot, idempotent shutdown signal shared across a worker's listener
/// tasks and the `shutdown()` caller.
///
/// Draining in-flight work on shutdown is handled separately, by the
/// `busy_tx`/`busy_rx` watch channel in `worker.rs` — this flag only answers
/// "has shutdown been requested", which `try_to_process` and `shutdown()`
/// both need to check.
#[derive(Clone)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
