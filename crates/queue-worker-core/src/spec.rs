use serde::{Deserialize, Serialize};

/// A validated descriptor binding a `TaskWorker`/`QueueWorker` pair to one
/// stage of a pipeline.
///
/// Construct with [`TaskSpec::new`], then check [`TaskSpec::validate`] before
/// handing it to a `TaskWorker` — exactly as `QueueWorker::set_task_spec`
/// does internally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Tasks with this `_state` are eligible for claiming. `None` matches
    /// tasks with no `_state` field at all.
    #[serde(default)]
    pub start_state: Option<String>,

    /// The state a claimed task moves into while being processed. Must be
    /// non-empty and distinct from `start_state`, `finished_state`, and
    /// `error_state`.
    pub in_progress_state: String,

    /// The state a resolved task moves into. `None` means resolving deletes
    /// the task instead of leaving a record behind.
    #[serde(default)]
    pub finished_state: Option<String>,

    /// The state a task lands in once its retry budget is exhausted, or
    /// immediately if it was malformed. Defaults to
    /// [`crate::DEFAULT_ERROR_STATE`] when omitted.
    #[serde(default)]
    pub error_state: Option<String>,

    /// How long, in milliseconds, a claimed task may sit in-progress before
    /// the reaper resets it. `None` disables the reaper for this spec.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// How many times a rejected task may be retried before landing in
    /// `error_state`. `None` is equivalent to `0`.
    #[serde(default)]
    pub retries: Option<u32>,
}

impl TaskSpec {
    pub fn new(in_progress_state: impl Into<String>) -> Self {
        Self {
            start_state: None,
            in_progress_state: in_progress_state.into(),
            finished_state: None,
            error_state: None,
            timeout: None,
            retries: None,
        }
    }

    pub fn with_start_state(mut self, state: impl Into<String>) -> Self {
        self.start_state = Some(state.into());
        self
    }

    pub fn with_finished_state(mut self, state: impl Into<String>) -> Self {
        self.finished_state = Some(state.into());
        self
    }

    pub fn with_error_state(mut self, state: impl Into<String>) -> Self {
        self.error_state = Some(state.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// The effective error state, falling back to the reserved default when
    /// the spec doesn't name one explicitly.
    pub fn error_state(&self) -> &str {
        self.error_state
            .as_deref()
            .unwrap_or(crate::DEFAULT_ERROR_STATE)
    }

    pub fn retries(&self) -> u32 {
        self.retries.unwrap_or(0)
    }

    /// Re-check the cross-field constraints a typed `TaskSpec` can't rule out
    /// at the type level: state-distinctness and positivity of `timeout`.
    ///
    /// A spec with explicit `None`s for the optional fields validates
    /// identically to one that omits them, since `Option<String>` has no way
    /// to distinguish the two once deserialized.
    pub fn validate(&self) -> bool {
        if self.in_progress_state.is_empty() {
            return false;
        }

        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return false;
            }
        }

        if let Some(start_state) = &self.start_state {
            if start_state == &self.in_progress_state {
                return false;
            }
            if self.finished_state.as_deref() == Some(start_state.as_str()) {
                return false;
            }
        }

        if let Some(finished_state) = &self.finished_state {
            if finished_state == &self.in_progress_state {
                return false;
            }
        }

        if let Some(error_state) = &self.error_state {
            if error_state == &self.in_progress_state {
                return false;
            }
        }

        true
    }

    pub fn is_valid(&self) -> bool {
        self.validate()
    }
}
