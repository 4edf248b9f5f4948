//! The trait a concrete hierarchical-database client implements.
//!
//! `QueueWorker` is generic over `B: Backend`, the same way
//! `durable-runtime::Worker` is built around a `dyn EventSource` rather than
//! dialing Postgres directly: every capability the engine needs (reference
//! equality, ordered child queries, child-change listeners, optimistic
//! transactions, a server clock) is captured here, and nothing about a
//! specific vendor database leaks past this boundary.

use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::BoxStream;
use queue_worker_core::{QueryDescriptor, TaskRecord, TaskTransaction};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("transaction failed: {0}")]
    Transaction(#[source] anyhow::Error),
    #[error("backend I/O error: {0}")]
    Io(#[source] anyhow::Error),
}

/// A reducer handed to [`Backend::transaction`].
///
/// Operates on the raw stored [`Value`] rather than a pre-parsed
/// [`TaskRecord`] because `claim_for` needs to see (and quarantine) a
/// malformed, non-object value; every other `TaskWorker` method only ever
/// runs against a location it already knows holds a well-formed task, and
/// parses internally.
pub type Reducer = Box<dyn FnMut(Option<Value>) -> TaskTransaction + Send>;

/// The hierarchical-database capabilities `TaskWorker`/`QueueWorker` consume.
///
/// Implementations own their own connection pooling, retry policy for
/// transient I/O errors, and child-key allocation; this trait only fixes the
/// shape the runtime needs to drive task state transitions.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    /// An opaque handle to a location (a child path under the tasks
    /// reference). Cheap to clone; compares by identity of the location, not
    /// its current contents.
    type Reference: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// The reference to a named child of `parent`.
    fn child(&self, parent: &Self::Reference, name: &str) -> Self::Reference;

    /// A fresh reference under `parent`, the way a realtime database mints an
    /// opaque push key. Ordering children by reference (insertion order) is
    /// how `QueryDescriptor::order` is realized.
    fn push(&self, parent: &Self::Reference) -> Self::Reference;

    /// The root reference this backend was constructed against, e.g. the
    /// caller-provided tasks location. `QueueWorker` scopes every query it
    /// issues to this reference.
    fn root(&self) -> Self::Reference;

    /// Notifies of children of `parent` matching `query` as they're created.
    fn watch_child_added(
        &self,
        parent: &Self::Reference,
        query: QueryDescriptor,
    ) -> BoxStream<'static, (Self::Reference, TaskRecord)>;

    /// Notifies of children of `parent` matching `query` whenever their
    /// contents change.
    fn watch_child_changed(
        &self,
        parent: &Self::Reference,
        query: QueryDescriptor,
    ) -> BoxStream<'static, (Self::Reference, TaskRecord)>;

    /// Notifies when a child of `parent` previously matching `query` is
    /// removed, or no longer matches it.
    fn watch_child_removed(
        &self,
        parent: &Self::Reference,
        query: QueryDescriptor,
    ) -> BoxStream<'static, Self::Reference>;

    /// A one-shot fetch of the current top match for `query` among the
    /// children of `parent`.
    ///
    /// Used after a worker frees up (a resolve/reject commits) to pick up an
    /// already-present eligible candidate that predates the worker going
    /// busy, since `watch_child_added` only fires for newly created children.
    async fn get_candidate(
        &self,
        parent: &Self::Reference,
        query: &QueryDescriptor,
    ) -> Result<Option<(Self::Reference, TaskRecord)>, BackendError>;

    /// Run `reducer` against `reference` in a compare-and-set transaction,
    /// retrying internally against contention until the reducer's decision is
    /// consistent with the value actually committed.
    async fn transaction(
        &self,
        reference: &Self::Reference,
        reducer: Reducer,
    ) -> Result<TaskTransaction, BackendError>;

    /// Milliseconds to add to this process's local clock to approximate the
    /// backend server's clock.
    fn server_offset(&self) -> i64;

    /// The backend's best estimate of the current server time.
    fn server_now(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(self.server_offset())
    }

    /// `server_now()` as milliseconds since the epoch, the unit
    /// `_state_changed` timestamps and `spec.timeout` are compared in.
    fn server_now_millis(&self) -> i64 {
        self.server_now().timestamp_millis()
    }
}

/// Helper for implementations that only know their offset as a timestamp
/// pair rather than a precomputed delta.
pub fn offset_millis(server_observed: DateTime<Utc>, local_observed: DateTime<Utc>) -> i64 {
    (server_observed - local_observed).num_milliseconds()
}

/// `Utc.timestamp_millis_opt` without the `Option` ceremony, clamped to the
/// epoch on underflow. Backends building a [`TaskRecord`] from stored
/// millisecond timestamps can use this instead of pulling in `chrono`
/// conversions themselves.
pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}
