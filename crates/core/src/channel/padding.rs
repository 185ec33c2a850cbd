//! Idle-link padding.
//!
//! A channel with no recent traffic emits PADDING cells on a randomized
//! schedule so an observer cannot cheaply distinguish idle from active
//! links. Padding never preempts real cells and never consumes circuit
//! window; the scheduler ranks it below everything else.

use rand::Rng;
use std::time::{Duration, Instant};

/// Bounds of the randomized padding interval.
const PADDING_MIN: Duration = Duration::from_millis(1500);
const PADDING_MAX: Duration = Duration::from_millis(9500);

/// Per-channel padding timer.
#[derive(Debug)]
pub struct PaddingTimer {
    /// When the next PADDING is due, if the link stays idle.
    next_due: Instant,
    enabled: bool,
}

impl PaddingTimer {
    pub fn new<R: Rng>(now: Instant, rng: &mut R) -> Self {
        Self {
            next_due: now + draw_interval(rng),
            enabled: true,
        }
    }

    /// Disabled timer for channels that should never pad (tests, closing).
    pub fn disabled(now: Instant) -> Self {
        Self {
            next_due: now,
            enabled: false,
        }
    }

    /// Real traffic resets the schedule.
    pub fn note_activity<R: Rng>(&mut self, now: Instant, rng: &mut R) {
        self.next_due = now + draw_interval(rng);
    }

    /// True when a PADDING cell should be queued; reschedules itself.
    pub fn padding_due<R: Rng>(&mut self, now: Instant, rng: &mut R) -> bool {
        if !self.enabled || now < self.next_due {
            return false;
        }
        self.next_due = now + draw_interval(rng);
        true
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }
}

fn draw_interval<R: Rng>(rng: &mut R) -> Duration {
    let min = PADDING_MIN.as_millis() as u64;
    let max = PADDING_MAX.as_millis() as u64;
    Duration::from_millis(rng.gen_range(min..=max))
}
