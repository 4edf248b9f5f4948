use thiserror::Error;

/// Construction failures [`crate::QueueWorkerBuilder::build`] re-validates at
/// runtime.
///
/// The distilled contract's "process id is not a string" and "sanitize/
/// suppressStack is not a boolean" checks are ruled out at compile time by
/// `QueueWorkerBuilder`'s typed fields. `NoTasksReference` is kept for parity
/// with that contract even though this builder can't actually hit it: a
/// `tasks_ref: B::Reference` is a required constructor argument here, not an
/// optional field a caller can leave unset.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("No tasks reference provided.")]
    NoTasksReference,

    #[error("Invalid process ID provided.")]
    InvalidProcessId,

    #[error("No processing function provided.")]
    NoProcessingFunction,
}

/// Why a `progress()` call on a [`crate::TaskHandle`] was refused.
#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("Invalid progress")]
    InvalidProgress,

    #[error("Can't update progress - no task currently being processed")]
    NoTaskCurrentlyBeingProcessed,

    #[error("Can't update progress - current task no longer owned by this process")]
    NoLongerOwned,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Copy, Clone, Debug, Default)]
pub struct AbortError;

impl std::fmt::Display for AbortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "this task is no longer owned by the worker that started processing it"
        )
    }
}

impl std::error::Error for AbortError {}
