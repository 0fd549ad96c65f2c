use std::time::{Duration, Instant};

/// Monotonic-clock gate. Fires at most once per `interval`; when it fires the
/// clock resets to the firing frame's time, so overshoot is never caught up.
#[derive(Clone, Debug)]
pub struct CaptureScheduler {
    interval: Duration,
    last: Instant,
}

impl CaptureScheduler {
    /// The first fire happens no earlier than `start + interval`.
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            last: start,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Call once per frame with that frame's monotonic time.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}
