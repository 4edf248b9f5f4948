//! Pure, deterministic task state transitions for a realtime-database-backed
//! job queue.
//!
//! Nothing in this crate performs I/O. Every public function is a total,
//! side-effect-free mapping from an observed [`TaskRecord`] to a
//! [`TaskTransaction`] describing what a caller should write back (or not
//! write back) in a compare-and-set transaction. This is what makes retries
//! safe: a backend may re-invoke these functions as many times as it likes
//! while resolving contention, and correctness only depends on the latest
//! observed value.

mod query;
mod record;
mod spec;
mod worker;

pub use self::query::{Order, QueryDescriptor};
pub use self::record::{ErrorDetails, ServerTimestamp, TaskRecord, Timestamp};
pub use self::spec::TaskSpec;
pub use self::worker::{TaskTransaction, TaskWorker};

/// The reserved `_error_state` literal used when a [`TaskSpec`] omits
/// `error_state` but a task still needs to be quarantined (malformed task, or
/// retries exhausted with no explicit error state configured).
///
/// See the Open Question resolution in `SPEC_FULL.md` §9.
pub const DEFAULT_ERROR_STATE: &str = "error";
