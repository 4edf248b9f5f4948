//! The async engine that drives [`queue_worker_core::TaskWorker`] transitions
//! against a pluggable [`Backend`].

pub mod backend;
pub mod clock;
mod config;
mod error;
pub mod flag;
mod util;
mod worker;

pub use self::backend::{Backend, BackendError, Reducer};
pub use self::clock::{Clock, SystemClock};
pub use self::config::Config;
pub use self::error::{AbortError, ConstructionError, ProgressError};
pub use self::worker::{QueueWorker, QueueWorkerBuilder, TaskHandle};
