use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use queue_worker_runtime::backend::millis_to_datetime;
use queue_worker_runtime::Clock;

/// A [`Clock`] driven by tokio's paused virtual time rather than the wall
/// clock, so timeout-reaper tests can jump forward deterministically with
/// `tokio::time::advance` instead of sleeping for real.
pub struct TestClock {
    start: tokio::time::Instant,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
        }
    }
}

#[async_trait::async_trait]
impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        millis_to_datetime(self.now_millis())
    }

    fn now_millis(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

pub fn test_clock() -> Arc<dyn Clock> {
    Arc::new(TestClock::new())
}
