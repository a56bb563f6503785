//! Secondary stream decimation.

use std::time::{Duration, Instant};

/// Forwards at most one frame per interval.
///
/// The reference point advances by exactly one interval per forwarded frame
/// instead of snapping to the current time, so the long-run rate stays at the
/// target under completion jitter.
#[derive(Debug)]
pub struct SecondaryStreamState {
    interval: Duration,
    last_emitted: Instant,
}

impl SecondaryStreamState {
    pub fn new(fps: f32, now: Instant) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / fps as f64),
            last_emitted: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Decide whether the frame completing at `now` is forwarded.
    pub fn should_emit(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_emitted) >= self.interval {
            self.last_emitted += self.interval;
            true
        } else {
            false
        }
    }
}
