use serde_json::Value;

use crate::query::{Order, QueryDescriptor};
use crate::record::{ErrorDetails, ServerTimestamp, TaskRecord, Timestamp};
use crate::spec::TaskSpec;

/// The outcome of a pure `TaskWorker` transition, meant to be applied inside a
/// backend's compare-and-set transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskTransaction {
    /// Write this record back.
    Commit(TaskRecord),
    /// Delete the location.
    Delete,
    /// Write nothing; abort the transaction.
    Abort,
}

impl TaskTransaction {
    pub fn is_abort(&self) -> bool {
        matches!(self, TaskTransaction::Abort)
    }

    pub fn into_commit(self) -> Option<TaskRecord> {
        match self {
            TaskTransaction::Commit(record) => Some(record),
            _ => None,
        }
    }
}

/// A pure task-state-transition function bound to one `(owner, spec)` pair.
///
/// `owner` only matters to the methods that check or clear ownership
/// (`reset`, `resolve_with`, `reject_with`, `update_progress_with`).
/// `claim_for` and `reset_if_timed_out` take the claiming owner (or ignore
/// ownership entirely) as explicit arguments instead, matching the distilled
/// contract where the owner token used to claim a task is minted fresh for
/// every claim attempt rather than fixed for the lifetime of the worker.
#[derive(Clone, Debug)]
pub struct TaskWorker {
    spec: TaskSpec,
    owner: String,
}

impl TaskWorker {
    pub fn new(spec: TaskSpec, owner: impl Into<String>) -> Self {
        Self {
            spec,
            owner: owner.into(),
        }
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Produce a new `TaskWorker` bound to the same spec but a different
    /// owner, mirroring the distilled spec's "TaskWorker instance cloned with
    /// this owner" used once a task has actually been claimed.
    pub fn with_owner(&self, owner: impl Into<String>) -> Self {
        Self {
            spec: self.spec.clone(),
            owner: owner.into(),
        }
    }

    fn owns(&self, task: &TaskRecord) -> bool {
        task.owner() == Some(self.owner.as_str())
            && task.state() == Some(self.spec.in_progress_state.as_str())
    }

    /// Release a task this worker currently owns back to `start_state`.
    pub fn reset(&self, task: Option<TaskRecord>) -> TaskTransaction {
        let Some(task) = task else {
            return TaskTransaction::Delete;
        };

        if !self.owns(&task) {
            return TaskTransaction::Abort;
        }

        TaskTransaction::Commit(self.released(task))
    }

    /// Release a task whose `_state_changed` is older than `spec.timeout`,
    /// regardless of who currently owns it. `now_millis` is the caller's
    /// (backend's) view of the server clock, since this crate has no clock of
    /// its own to stay pure.
    pub fn reset_if_timed_out(&self, task: Option<TaskRecord>, now_millis: i64) -> TaskTransaction {
        let Some(task) = task else {
            return TaskTransaction::Delete;
        };

        let Some(timeout) = self.spec.timeout else {
            return TaskTransaction::Abort;
        };

        if task.state() != Some(self.spec.in_progress_state.as_str()) {
            return TaskTransaction::Abort;
        }

        let changed_at = match task.state_changed() {
            Some(Timestamp::Resolved(millis)) => millis,
            _ => return TaskTransaction::Abort,
        };

        if now_millis.saturating_sub(changed_at) < timeout as i64 {
            return TaskTransaction::Abort;
        }

        TaskTransaction::Commit(self.released(task))
    }

    fn released(&self, mut task: TaskRecord) -> TaskRecord {
        match &self.spec.start_state {
            Some(state) => task.set("_state", Value::String(state.clone())),
            None => task.set_null("_state"),
        }
        task.set_null("_owner");
        task.set_null("_progress");
        task.set_null("_error_details");
        task.set(
            "_state_changed",
            serde_json::to_value(Timestamp::Pending(ServerTimestamp::new())).unwrap(),
        );
        task
    }

    /// Attempt to claim a task for `claim_owner`.
    ///
    /// Quarantines malformed (non-object) values directly into `error_state`
    /// rather than aborting, since there is no well-formed task to retry.
    pub fn claim_for(&self, task: Option<Value>, claim_owner: &str) -> TaskTransaction {
        let Some(task) = task else {
            return TaskTransaction::Delete;
        };

        let Some(task) = TaskRecord::from_value(task.clone()) else {
            let mut quarantined = TaskRecord::new();
            quarantined.set("_state", Value::String(self.spec.error_state().to_owned()));
            quarantined.set(
                "_state_changed",
                serde_json::to_value(Timestamp::Pending(ServerTimestamp::new())).unwrap(),
            );
            quarantined.set(
                "_error_details",
                serde_json::to_value(ErrorDetails {
                    previous_state: None,
                    attempts: 0,
                    error: Some("Task was malformed".to_owned()),
                    error_stack: None,
                    original_task: Some(task),
                })
                .unwrap(),
            );
            return TaskTransaction::Commit(quarantined);
        };

        if task.state() != self.spec.start_state.as_deref() {
            return TaskTransaction::Abort;
        }

        let mut claimed = task;
        claimed.set("_state", Value::String(self.spec.in_progress_state.clone()));
        claimed.set(
            "_state_changed",
            serde_json::to_value(Timestamp::Pending(ServerTimestamp::new())).unwrap(),
        );
        claimed.set("_owner", Value::String(claim_owner.to_owned()));
        claimed.set("_progress", 0);

        TaskTransaction::Commit(claimed)
    }

    /// Advance a task this worker owns towards completion.
    pub fn resolve_with(&self, task: Option<TaskRecord>, new_task: Option<Value>) -> TaskTransaction {
        let Some(task) = task else {
            return TaskTransaction::Delete;
        };

        if !self.owns(&task) {
            return TaskTransaction::Abort;
        }

        let mut payload = match new_task {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };

        let new_state = payload.remove("_new_state");
        let next_state = match new_state {
            Some(Value::String(state)) => Some(Some(state)),
            Some(Value::Null) => Some(None),
            Some(Value::Bool(false)) => None,
            _ => Some(self.spec.finished_state.clone()),
        };

        let deletes = match &next_state {
            None => true,
            Some(None) => self.spec.finished_state.is_none(),
            Some(Some(_)) => false,
        };

        if deletes {
            return TaskTransaction::Delete;
        }

        let mut result = task;
        result.merge(payload);
        match next_state.unwrap_or(None) {
            Some(state) => result.set("_state", Value::String(state)),
            None => result.set_null("_state"),
        }
        result.set(
            "_state_changed",
            serde_json::to_value(Timestamp::Pending(ServerTimestamp::new())).unwrap(),
        );
        result.set("_progress", 100);
        result.set_null("_owner");
        result.set_null("_error_details");

        TaskTransaction::Commit(result)
    }

    /// Route a failed task back to `start_state` for another attempt, or to
    /// `error_state` once the retry budget is exhausted.
    pub fn reject_with(
        &self,
        task: Option<TaskRecord>,
        error: Option<String>,
        error_stack: Option<String>,
    ) -> TaskTransaction {
        let Some(task) = task else {
            return TaskTransaction::Delete;
        };

        if !self.owns(&task) {
            return TaskTransaction::Abort;
        }

        let prev_attempts = match task.error_details() {
            Some(details) if details.previous_state.as_deref() == Some(&self.spec.in_progress_state) => {
                details.attempts
            }
            _ => 0,
        };

        let attempts = prev_attempts + 1;
        let exhausted = attempts > self.spec.retries();

        let next_state = if exhausted {
            self.spec.error_state().to_owned()
        } else {
            match &self.spec.start_state {
                Some(state) => state.clone(),
                None => {
                    let mut result = task;
                    result.set_null("_state");
                    result.set_null("_owner");
                    result.set(
                        "_state_changed",
                        serde_json::to_value(Timestamp::Pending(ServerTimestamp::new())).unwrap(),
                    );
                    result.set(
                        "_error_details",
                        serde_json::to_value(ErrorDetails {
                            previous_state: Some(self.spec.in_progress_state.clone()),
                            attempts,
                            error,
                            error_stack,
                            original_task: None,
                        })
                        .unwrap(),
                    );
                    return TaskTransaction::Commit(result);
                }
            }
        };

        let mut result = task;
        result.set("_state", Value::String(next_state));
        result.set_null("_owner");
        result.set(
            "_state_changed",
            serde_json::to_value(Timestamp::Pending(ServerTimestamp::new())).unwrap(),
        );
        result.set(
            "_error_details",
            serde_json::to_value(ErrorDetails {
                previous_state: Some(self.spec.in_progress_state.clone()),
                attempts,
                error,
                error_stack,
                original_task: None,
            })
            .unwrap(),
        );

        TaskTransaction::Commit(result)
    }

    /// Record progress on a task this worker owns.
    pub fn update_progress_with(&self, task: Option<TaskRecord>, progress: i64) -> TaskTransaction {
        let Some(task) = task else {
            return TaskTransaction::Delete;
        };

        if !self.owns(&task) {
            return TaskTransaction::Abort;
        }

        let mut result = task;
        result.set("_progress", progress);
        TaskTransaction::Commit(result)
    }

    /// The query selecting the single earliest-inserted eligible candidate.
    pub fn next_query(&self) -> QueryDescriptor {
        QueryDescriptor {
            field: "_state",
            equals: self.spec.start_state.clone().map(Value::String),
            order: Order::Insertion,
            limit: Some(1),
        }
    }

    /// The query selecting every task currently in-progress.
    pub fn in_progress_query(&self) -> QueryDescriptor {
        QueryDescriptor {
            field: "_state",
            equals: Some(Value::String(self.spec.in_progress_state.clone())),
            order: Order::Insertion,
            limit: None,
        }
    }

    pub fn has_timeout(&self) -> bool {
        self.spec.timeout.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> TaskSpec {
        TaskSpec::new("in_progress")
            .with_start_state("start")
            .with_finished_state("done")
            .with_retries(4)
    }

    fn record(value: serde_json::Value) -> TaskRecord {
        TaskRecord::from_value(value).unwrap()
    }

    #[test]
    fn reset_on_none_deletes() {
        let worker = TaskWorker::new(spec(), "p:0");
        assert_eq!(worker.reset(None), TaskTransaction::Delete);
    }

    #[test]
    fn reset_requires_ownership_and_state() {
        let worker = TaskWorker::new(spec(), "p:0");
        let wrong_owner = record(json!({"_state": "in_progress", "_owner": "other:0"}));
        assert!(worker.reset(Some(wrong_owner)).is_abort());

        let wrong_state = record(json!({"_state": "start", "_owner": "p:0"}));
        assert!(worker.reset(Some(wrong_state)).is_abort());
    }

    #[test]
    fn reset_restores_start_state_and_clears_ownership() {
        let worker = TaskWorker::new(spec(), "p:0");
        let owned = record(json!({"_state": "in_progress", "_owner": "p:0", "_progress": 40, "task": 2}));

        let result = worker.reset(Some(owned)).into_commit().unwrap();
        assert_eq!(result.state(), Some("start"));
        assert_eq!(result.owner(), None);
        assert_eq!(result.progress(), None);
        assert_eq!(result.error_details(), None);
        assert_eq!(result.as_map().get("task"), Some(&json!(2)));
    }

    #[test]
    fn reset_if_timed_out_triggers_regardless_of_owner() {
        let worker = TaskWorker::new(spec().with_timeout(1000), "reaper");
        let stale = record(json!({
            "_state": "in_progress",
            "_owner": "someone-else:7",
            "_state_changed": 1_000,
        }));

        let result = worker.reset_if_timed_out(Some(stale), 2_000).into_commit().unwrap();
        assert_eq!(result.state(), Some("start"));
        assert_eq!(result.owner(), None);
    }

    #[test]
    fn reset_if_timed_out_aborts_before_deadline() {
        let worker = TaskWorker::new(spec().with_timeout(1000), "reaper");
        let fresh = record(json!({
            "_state": "in_progress",
            "_owner": "x:0",
            "_state_changed": 1_500,
        }));

        assert!(worker.reset_if_timed_out(Some(fresh), 2_000).is_abort());
    }

    #[test]
    fn claim_for_malformed_task_quarantines() {
        let worker = TaskWorker::new(spec(), "p:0");
        let result = worker.claim_for(Some(json!([1, 2, 3])), "p:0").into_commit().unwrap();

        assert_eq!(result.state(), Some(worker.spec().error_state()));
        let details = result.error_details().unwrap();
        assert_eq!(details.error.as_deref(), Some("Task was malformed"));
    }

    #[test]
    fn claim_for_ineligible_state_aborts() {
        let worker = TaskWorker::new(spec(), "p:0");
        let ineligible = json!({"_state": "done"});
        assert!(worker.claim_for(Some(ineligible), "p:0").is_abort());
    }

    #[test]
    fn claim_for_eligible_task_assigns_owner_and_progress() {
        let worker = TaskWorker::new(spec(), "p:0");
        let eligible = json!({"_state": "start", "task": 1});

        let result = worker.claim_for(Some(eligible), "p:7").into_commit().unwrap();
        assert_eq!(result.state(), Some("in_progress"));
        assert_eq!(result.owner(), Some("p:7"));
        assert_eq!(result.progress(), Some(0));
    }

    #[test]
    fn reset_then_claim_round_trips() {
        let worker = TaskWorker::new(spec(), "p:0");
        let owned = record(json!({"_state": "in_progress", "_owner": "p:0", "task": 9}));

        let reset = worker.reset(Some(owned)).into_commit().unwrap();
        let claimed = worker.claim_for(Some(reset.as_map().clone().into()), "p:1").into_commit().unwrap();

        assert_eq!(claimed.state(), Some("in_progress"));
        assert_eq!(claimed.progress(), Some(0));
        assert_eq!(claimed.as_map().get("task"), Some(&json!(9)));
    }

    #[test]
    fn resolve_with_merges_payload_and_consumes_new_state() {
        let worker = TaskWorker::new(
            TaskSpec::new("inProgress").with_finished_state("finished"),
            "owner",
        );
        let owned = record(json!({"_state": "inProgress", "_owner": "owner"}));

        let result = worker
            .resolve_with(Some(owned), Some(json!({"foo": "bar", "_new_state": "valid_new_state"})))
            .into_commit()
            .unwrap();

        assert_eq!(result.state(), Some("valid_new_state"));
        assert_eq!(result.progress(), Some(100));
        assert_eq!(result.owner(), None);
        assert_eq!(result.error_details(), None);
        assert_eq!(result.as_map().get("foo"), Some(&json!("bar")));
    }

    #[test]
    fn resolve_with_no_finished_state_and_no_new_state_deletes() {
        let worker = TaskWorker::new(TaskSpec::new("inProgress"), "owner");
        let owned = record(json!({"_state": "inProgress", "_owner": "owner"}));

        assert_eq!(worker.resolve_with(Some(owned), None), TaskTransaction::Delete);
    }

    #[test]
    fn resolve_with_explicit_false_new_state_deletes() {
        let worker = TaskWorker::new(
            TaskSpec::new("inProgress").with_finished_state("finished"),
            "owner",
        );
        let owned = record(json!({"_state": "inProgress", "_owner": "owner"}));

        let result = worker.resolve_with(Some(owned), Some(json!({"_new_state": false})));
        assert_eq!(result, TaskTransaction::Delete);
    }

    #[test]
    fn reject_with_retries_exhausted_lands_in_error_state() {
        let worker = TaskWorker::new(spec(), "owner");
        let owned = record(json!({
            "_state": "in_progress",
            "_owner": "owner",
            "_error_details": {"previous_state": "in_progress", "attempts": 4},
        }));

        let result = worker
            .reject_with(Some(owned), Some("boom".to_owned()), None)
            .into_commit()
            .unwrap();

        assert_eq!(result.state(), Some(worker.spec().error_state()));
        assert_eq!(result.error_details().unwrap().attempts, 5);
    }

    #[test]
    fn reject_with_retries_remaining_routes_back_to_start_state() {
        let worker = TaskWorker::new(spec(), "owner");
        let owned = record(json!({
            "_state": "in_progress",
            "_owner": "owner",
            "_error_details": {"previous_state": "in_progress", "attempts": 1},
        }));

        let result = worker
            .reject_with(Some(owned), Some("My error message".to_owned()), None)
            .into_commit()
            .unwrap();

        assert_eq!(result.state(), Some("start"));
        assert_eq!(result.error_details().unwrap().attempts, 2);
    }

    #[test]
    fn reject_with_different_previous_in_progress_state_resets_attempts() {
        let worker = TaskWorker::new(spec(), "owner");
        let owned = record(json!({
            "_state": "in_progress",
            "_owner": "owner",
            "_error_details": {"previous_state": "some_other_stage", "attempts": 9},
        }));

        let result = worker
            .reject_with(Some(owned), None, None)
            .into_commit()
            .unwrap();

        assert_eq!(result.error_details().unwrap().attempts, 1);
    }

    #[test]
    fn update_progress_with_requires_ownership() {
        let worker = TaskWorker::new(spec(), "owner");
        let not_owned = record(json!({"_state": "in_progress", "_owner": "other"}));
        assert!(worker.update_progress_with(Some(not_owned), 50).is_abort());

        let owned = record(json!({"_state": "in_progress", "_owner": "owner"}));
        let result = worker.update_progress_with(Some(owned), 50).into_commit().unwrap();
        assert_eq!(result.progress(), Some(50));
    }

    #[test]
    fn preserves_user_fields_for_a_second_stage_pipeline() {
        let stage_one = TaskWorker::new(
            TaskSpec::new("in_progress")
                .with_start_state("2.start")
                .with_finished_state("done"),
            "p:0",
        );

        let candidate = json!({"_state": "2.start", "payload": 42});
        let claimed = stage_one.claim_for(Some(candidate), "p:0").into_commit().unwrap();

        let resolved = stage_one
            .resolve_with(Some(claimed), None)
            .into_commit()
            .unwrap();

        assert_eq!(resolved.state(), Some("done"));
        assert_eq!(resolved.as_map().get("payload"), Some(&json!(42)));
    }
}
