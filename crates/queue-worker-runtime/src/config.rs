use std::time::Duration;

/// Runtime tuning for a [`crate::QueueWorker`] that the task-spec layer
/// leaves implicit.
pub struct Config {
    /// The `_state` a task is routed to when its spec omits `error_state`,
    /// whether because retries were exhausted or because `claim_for`
    /// quarantined a malformed task.
    pub default_error_state: String,

    /// Backpressure bound on the internal channel feeding `try_to_process`
    /// from the `child_added` listener on the next-candidate query.
    pub event_channel_capacity: usize,

    /// `error_stack` text longer than this is truncated before being written
    /// in a `reject_with` transaction.
    pub max_log_bytes_per_transaction: usize,

    /// Fallback poll interval for the next-candidate query, guarding against
    /// a backend whose `watch_child_added` stream missed a notification (for
    /// example across a reconnect). Zero disables the fallback poll.
    pub claim_poll_interval: Duration,

    /// Interval between shutdown's polls of the in-flight processing
    /// function while waiting for it to resolve or reject.
    pub shutdown_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_error_state: queue_worker_core::DEFAULT_ERROR_STATE.to_owned(),
            event_channel_capacity: 64,
            max_log_bytes_per_transaction: 1024 * 128,
            claim_poll_interval: Duration::from_secs(30),
            shutdown_poll_interval: Duration::from_millis(20),
        }
    }
}
