//! A reference [`Backend`] implementation that keeps every task in memory.
//!
//! Meant for the demo binary and for exercising `queue-worker-runtime`
//! end-to-end without standing up a real hierarchical database. Ordering,
//! query matching, and the server-timestamp sentinel are all implemented the
//! way a real backend would, just against a `BTreeMap` instead of a network
//! round trip. Nodes are stored as raw [`Value`]s rather than pre-parsed
//! [`TaskRecord`]s, since a producer (or a bug) can write a non-object value
//! at a task's location and `claim_for` is specifically meant to see and
//! quarantine that.

use std::collections::BTreeMap;
use std::fmt;

use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use queue_worker_core::{QueryDescriptor, TaskRecord, TaskTransaction};
use queue_worker_runtime::{Backend, BackendError, Reducer};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

/// A reference into a [`MemoryBackend`]: a `/`-joined path of child names.
///
/// Lexicographic ordering of the path matches insertion order for
/// `push`-allocated children, since [`MemoryBackend::push`] zero-pads its
/// counter the way a real push-key scheme keeps later keys sorting later.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct NodeRef(String);

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}/{name}")
    }
}

/// The `_state` of a stored node, or `None` for a missing field *or* a
/// malformed (non-object) node — either way, nothing a query can distinguish
/// from "no state", exactly as a real hierarchical database would see it.
fn state_of(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) => map.get("_state").and_then(Value::as_str),
        _ => None,
    }
}

/// A [`TaskRecord`] view of a stored node, for API surfaces that are
/// documented to hand back a parsed record but whose caller only uses it for
/// reference tracking (`try_to_process`, `spawn_new_task_listener`) rather
/// than reading its fields. A malformed node views as an empty record; the
/// one place that needs to see the real raw value is `claim_for`, which goes
/// through `transaction`'s `Option<Value>` directly.
fn record_view(value: &Value) -> TaskRecord {
    match value {
        Value::Object(map) => TaskRecord::from_map(map.clone()),
        _ => TaskRecord::new(),
    }
}

#[derive(Clone)]
struct ChangeEvent {
    reference: NodeRef,
    before: Option<Value>,
    after: Option<Value>,
}

struct State {
    nodes: BTreeMap<String, Value>,
    next_id: u64,
}

/// An in-memory, single-process [`Backend`].
///
/// Holds every node behind a [`parking_lot::Mutex`] rather than an async
/// lock: every operation here is a map lookup, never actual I/O, so there's
/// nothing worth yielding across.
pub struct MemoryBackend {
    root: NodeRef,
    state: Mutex<State>,
    events: broadcast::Sender<ChangeEvent>,
    server_offset_millis: i64,
}

impl MemoryBackend {
    /// A backend whose queue root is the given path (commonly just `"tasks"`).
    pub fn new(root: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            root: NodeRef(root.into()),
            state: Mutex::new(State {
                nodes: BTreeMap::new(),
                next_id: 0,
            }),
            events,
            server_offset_millis: 0,
        }
    }

    /// Simulate clock skew between this process and the backend's server.
    pub fn with_server_offset_millis(mut self, offset: i64) -> Self {
        self.server_offset_millis = offset;
        self
    }

    /// Insert a brand-new task under `parent`, stamping `_state` and
    /// `_state_changed` the way a producer enqueueing work is expected to.
    ///
    /// `fields` should not contain underscore-prefixed keys; those are
    /// reserved for `TaskWorker`'s own bookkeeping.
    pub fn enqueue(&self, parent: &NodeRef, start_state: Option<&str>, mut fields: Map<String, Value>) -> NodeRef {
        let reference = self.push(parent);
        match start_state {
            Some(state) => {
                fields.insert("_state".to_owned(), Value::String(state.to_owned()));
            }
            None => {
                fields.remove("_state");
            }
        }
        fields.insert("_state_changed".to_owned(), Value::from(self.server_now_millis()));

        let value = Value::Object(fields);
        let mut state = self.state.lock();
        state.nodes.insert(reference.0.clone(), value.clone());
        drop(state);

        tracing::trace!(task = %reference, "enqueued");
        let _ = self.events.send(ChangeEvent {
            reference: reference.clone(),
            before: None,
            after: Some(value),
        });
        reference
    }

    /// Write an arbitrary (possibly non-object) value directly at a fresh
    /// child of `parent`, simulating a producer bug or a malformed write a
    /// real hierarchical database wouldn't reject.
    pub fn write_raw(&self, parent: &NodeRef, value: Value) -> NodeRef {
        let reference = self.push(parent);
        let mut state = self.state.lock();
        state.nodes.insert(reference.0.clone(), value.clone());
        drop(state);

        let _ = self.events.send(ChangeEvent {
            reference: reference.clone(),
            before: None,
            after: Some(value),
        });
        reference
    }

    /// A snapshot of the task currently stored at `reference`, for assertions
    /// in tests without going through a transaction. Returns `None` both when
    /// nothing is stored there and when the stored value isn't an object.
    pub fn peek(&self, reference: &NodeRef) -> Option<TaskRecord> {
        match self.state.lock().nodes.get(&reference.0) {
            Some(Value::Object(map)) => Some(TaskRecord::from_map(map.clone())),
            _ => None,
        }
    }
}

fn query_matches(value: Option<&Value>, parent: &str, key: &str, query: &QueryDescriptor) -> bool {
    parent_path(key) == parent && value.is_some_and(|v| query.matches(state_of(v)))
}

fn resolve_server_timestamps(value: &mut Value, now_millis: i64) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 && map.get(".sv").and_then(Value::as_str) == Some("timestamp") {
                *value = Value::from(now_millis);
                return;
            }
            for child in map.values_mut() {
                resolve_server_timestamps(child, now_millis);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                resolve_server_timestamps(item, now_millis);
            }
        }
        _ => {}
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    type Reference = NodeRef;

    fn child(&self, parent: &NodeRef, name: &str) -> NodeRef {
        NodeRef(join(&parent.0, name))
    }

    fn push(&self, parent: &NodeRef) -> NodeRef {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        NodeRef(join(&parent.0, &format!("{id:020}")))
    }

    fn root(&self) -> NodeRef {
        self.root.clone()
    }

    fn watch_child_added(&self, parent: &NodeRef, query: QueryDescriptor) -> BoxStream<'static, (NodeRef, TaskRecord)> {
        // Mirrors a real hierarchical database's `child_added` listener,
        // which fires immediately for every already-present matching child,
        // not only for ones inserted after the listener attaches.
        let mut rx = self.events.subscribe();
        let parent = parent.clone();
        let initial: Vec<(NodeRef, TaskRecord)> = {
            let state = self.state.lock();
            state
                .nodes
                .iter()
                .filter(|(key, value)| query_matches(Some(value), &parent.0, key, &query))
                .map(|(key, value)| (NodeRef(key.clone()), record_view(value)))
                .collect()
        };
        Box::pin(async_stream::stream! {
            for item in initial {
                yield item;
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let was = query_matches(event.before.as_ref(), &parent.0, &event.reference.0, &query);
                        let is = query_matches(event.after.as_ref(), &parent.0, &event.reference.0, &query);
                        if !was && is {
                            yield (event.reference.clone(), record_view(event.after.as_ref().expect("is implies Some")));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn watch_child_changed(&self, parent: &NodeRef, query: QueryDescriptor) -> BoxStream<'static, (NodeRef, TaskRecord)> {
        let mut rx = self.events.subscribe();
        let parent = parent.clone();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let was = query_matches(event.before.as_ref(), &parent.0, &event.reference.0, &query);
                        let is = query_matches(event.after.as_ref(), &parent.0, &event.reference.0, &query);
                        if was && is && event.before != event.after {
                            yield (event.reference.clone(), record_view(event.after.as_ref().expect("is implies Some")));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn watch_child_removed(&self, parent: &NodeRef, query: QueryDescriptor) -> BoxStream<'static, NodeRef> {
        let mut rx = self.events.subscribe();
        let parent = parent.clone();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let was = query_matches(event.before.as_ref(), &parent.0, &event.reference.0, &query);
                        let is = query_matches(event.after.as_ref(), &parent.0, &event.reference.0, &query);
                        if was && !is {
                            yield event.reference.clone();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn get_candidate(&self, parent: &NodeRef, query: &QueryDescriptor) -> Result<Option<(NodeRef, TaskRecord)>, BackendError> {
        let state = self.state.lock();
        let found = state
            .nodes
            .iter()
            .find(|(key, value)| query_matches(Some(value), &parent.0, key, query))
            .map(|(key, value)| (NodeRef(key.clone()), record_view(value)));
        Ok(found)
    }

    async fn transaction(&self, reference: &NodeRef, mut reducer: Reducer) -> Result<TaskTransaction, BackendError> {
        let now = self.server_now_millis();

        let (outcome, before, after) = {
            let mut state = self.state.lock();
            let before = state.nodes.get(&reference.0).cloned();
            let outcome = reducer(before.clone());

            let after = match &outcome {
                TaskTransaction::Commit(record) => {
                    let mut value = Value::Object(record.as_map().clone());
                    resolve_server_timestamps(&mut value, now);
                    state.nodes.insert(reference.0.clone(), value.clone());
                    Some(value)
                }
                TaskTransaction::Delete => {
                    state.nodes.remove(&reference.0);
                    None
                }
                TaskTransaction::Abort => before.clone(),
            };

            (outcome, before, after)
        };

        if !matches!(outcome, TaskTransaction::Abort) {
            let _ = self.events.send(ChangeEvent {
                reference: reference.clone(),
                before,
                after,
            });
        }

        Ok(outcome)
    }

    fn server_offset(&self) -> i64 {
        self.server_offset_millis
    }
}
