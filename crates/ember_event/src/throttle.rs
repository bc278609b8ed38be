//! Emission throttling
//!
//! Leading-edge drop strategy: the first emission of a throttled name is
//! delivered and opens a window of `interval`; emissions inside the window
//! are dropped, not queued. The next emission after the window closes is
//! delivered and opens a new window.

use std::time::Duration;
use tokio::time::Instant;

/// Per-event throttle window
#[derive(Debug, Clone)]
pub(crate) struct Throttle {
    interval: Duration,
    last_delivered: Option<Instant>,
}

impl Throttle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_delivered: None,
        }
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true if an emission at `now` may be delivered
    pub(crate) fn admit(&mut self, now: Instant) -> bool {
        match self.last_delivered {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_delivered = Some(now);
                true
            }
        }
    }
}
