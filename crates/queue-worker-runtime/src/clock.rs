//! Clock trait so timer-based logic (the timeout reaper, claim backoff) can be
//! exercised deterministically in tests without real sleeps.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Controls a [`crate::QueueWorker`]'s view of time.
///
/// The default [`SystemClock`] delegates to `chrono::Utc::now()` and
/// `tokio::time::sleep`. Tests substitute a clock that returns controlled
/// values so timeout-reaper math is deterministic.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// The current wall-clock time, in the worker's own local frame. A
    /// backend's `server_offset()` is added on top of this to approximate the
    /// backend's clock when no live round-trip is available.
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }

    async fn sleep(&self, duration: Duration);
}

/// The default clock, using the real system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}
