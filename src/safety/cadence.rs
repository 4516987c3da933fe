// Fixed-rate tick scheduling with drift compensation

use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Sleeps for whatever is left of the period after a tick, but never less
/// than `min_yield` so an overrunning tick still lets other tasks run.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    period: Duration,
    min_yield: Duration,
}

impl Cadence {
    pub fn new(period: Duration, min_yield: Duration) -> Self {
        Self { period, min_yield }
    }

    /// Sleep duration for a tick that started at `tick_started`
    pub fn remaining(&self, tick_started: Instant) -> Duration {
        self.period
            .saturating_sub(tick_started.elapsed())
            .max(self.min_yield)
    }

    pub async fn wait(&self, tick_started: Instant) {
        sleep(self.remaining(tick_started)).await;
    }
}
