//! The coordinator's notion of "now".
//!
//! Timestamps are Unix milliseconds so they line up with what clients put in
//! their heartbeats. The clock is anchored to the wall clock once, then
//! advanced by `tokio::time::Instant`, which keeps it monotonic and lets
//! tests drive it with paused tokio time.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    origin_millis: Timestamp,
}

impl Clock {
    pub fn new() -> Self {
        let origin_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp;
        Self {
            origin: Instant::now(),
            origin_millis,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.origin_millis + self.origin.elapsed().as_millis() as Timestamp
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn follows_tokio_time() {
        let clock = Clock::new();
        let start = clock.now();

        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert_eq!(clock.now() - start, 2_500);
    }
}
