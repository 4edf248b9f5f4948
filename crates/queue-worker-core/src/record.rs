use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A wall-clock timestamp as observed on a [`TaskRecord`].
///
/// A record freshly written by a `TaskWorker` transaction carries a
/// [`Timestamp::Pending`] sentinel in the field that a real backend is
/// expected to resolve into [`Timestamp::Resolved`] (milliseconds since the
/// Unix epoch) at commit time, the way a hierarchical realtime database
/// resolves its `{".sv": "timestamp"}` marker to the server's own clock.
///
/// Never construct a [`Timestamp::Resolved`] value in application code to
/// stand in for "now" — only a backend, at commit time, is authoritative
/// about what the server clock read. Relative time for timeout arming instead
/// goes through a backend's own clock (see `queue-worker-runtime::Clock`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Resolved(i64),
    Pending(ServerTimestamp),
}

impl Timestamp {
    pub fn as_millis(&self) -> Option<i64> {
        match self {
            Timestamp::Resolved(millis) => Some(*millis),
            Timestamp::Pending(_) => None,
        }
    }
}

/// The server-timestamp sentinel.
///
/// Serializes the way a hierarchical realtime database's `ServerValue.TIMESTAMP`
/// placeholder does: a one-key mapping the database recognizes and replaces
/// with server time at commit. A `Backend` implementation that isn't
/// RTDB-shaped (e.g. one backed by a SQL `now()`) can still deserialize this
/// marker and substitute its own notion of "now" at commit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTimestamp {
    #[serde(rename = ".sv")]
    marker: ServerTimestampMarker,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ServerTimestampMarker {
    #[default]
    Timestamp,
}

impl ServerTimestamp {
    pub const fn new() -> Self {
        Self {
            marker: ServerTimestampMarker::Timestamp,
        }
    }
}

/// The error-chain annotation attached to a task after `reject_with` or after
/// `claim_for` quarantines a malformed task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// The `in_progress_state` the task was in when it was rejected, used to
    /// decide whether `attempts` should reset or increment on the next
    /// rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<String>,

    /// How many consecutive times (within the same `in_progress_state`) this
    /// task has been rejected.
    #[serde(default)]
    pub attempts: u32,

    /// The error's display text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// The error's stack/backtrace text, omitted when `suppress_stack` is set
    /// or the error carried none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,

    /// Present only on the quarantine record `claim_for` produces for a
    /// malformed (non-object) task: the raw value that failed to parse as a
    /// task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_task: Option<Value>,
}

/// A task record as stored at `tasks/<id>`.
///
/// This wraps a `serde_json::Map` rather than a fixed struct because a task's
/// user-supplied fields are arbitrary and must be preserved verbatim across
/// every transition; only the underscore-prefixed metadata fields below are
/// interpreted by `TaskWorker`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskRecord(Map<String, Value>);

impl TaskRecord {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Try to interpret an arbitrary JSON value as a task record.
    ///
    /// Returns `None` for anything that isn't a JSON object — the caller
    /// (`TaskWorker::claim_for`) treats that as a malformed task to quarantine.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn state(&self) -> Option<&str> {
        match self.0.get("_state") {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        match self.0.get("_owner") {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn progress(&self) -> Option<i64> {
        self.0.get("_progress").and_then(Value::as_i64)
    }

    pub fn state_changed(&self) -> Option<Timestamp> {
        self.0
            .get("_state_changed")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn error_details(&self) -> Option<ErrorDetails> {
        self.0
            .get("_error_details")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_owned(), value.into());
    }

    pub fn set_null(&mut self, key: &str) {
        self.0.insert(key.to_owned(), Value::Null);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Merge `other`'s fields on top of `self`, the way `resolve_with` layers
    /// a resolution payload over the base task.
    pub fn merge(&mut self, other: Map<String, Value>) {
        for (key, value) in other {
            self.0.insert(key, value);
        }
    }

    /// Strip underscore-prefixed metadata fields, producing the user-visible
    /// payload handed to the processing function when sanitization is on.
    pub fn sanitize(&self) -> Map<String, Value> {
        self.0
            .iter()
            .filter(|(key, _)| !key.starts_with('_'))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl From<Map<String, Value>> for TaskRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
