//! Client-side progress merging.
//!
//! The displayed percentage is `max(simulated, authoritative)`:
//! - `simulated` eases out toward a cap over a fixed ramp, so the bar moves
//!   even when the side channel is slow
//! - `authoritative` is `100 * completed / total` from the server
//!
//! A completion signal pins the value at 100. Time is passed in by the
//! caller, which keeps the merger deterministic under test.

use std::time::{Duration, Instant};

use crate::config::ProgressSettings;

/// Monotonic progress estimate for one run
#[derive(Debug, Clone)]
pub struct ProgressMerger {
    ramp: Duration,
    cap: f64,
    started_at: Instant,
    simulated: f64,
    authoritative: f64,
    displayed: f64,
    complete: bool,
}

impl ProgressMerger {
    /// New run starting at `now`
    pub fn new(ramp: Duration, cap: f64, now: Instant) -> Self {
        Self {
            ramp,
            cap: cap.clamp(0.0, 100.0),
            started_at: now,
            simulated: 0.0,
            authoritative: 0.0,
            displayed: 0.0,
            complete: false,
        }
    }

    pub fn from_settings(settings: &ProgressSettings, now: Instant) -> Self {
        Self::new(settings.ramp, settings.cap, now)
    }

    /// Reset for a new run
    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(self.ramp, self.cap, now);
    }

    /// Simulated value `elapsed` into the run
    pub fn simulated_at(&self, elapsed: Duration) -> f64 {
        if self.ramp.is_zero() || elapsed >= self.ramp {
            return self.cap;
        }
        let t = elapsed.as_secs_f64() / self.ramp.as_secs_f64();
        self.cap * (1.0 - (1.0 - t) * (1.0 - t))
    }

    /// Advance the simulation clock
    pub fn tick(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started_at);
        self.simulated = self.simulated.max(self.simulated_at(elapsed));
        self.refresh()
    }

    /// Apply an authoritative counter update
    pub fn on_update(&mut self, completed: u32, total: u32) -> f64 {
        if total > 0 {
            let pct = 100.0 * f64::from(completed.min(total)) / f64::from(total);
            self.authoritative = self.authoritative.max(pct);
        }
        self.refresh()
    }

    /// Terminal signal from the server
    pub fn on_complete(&mut self) -> f64 {
        self.complete = true;
        self.authoritative = 100.0;
        self.refresh()
    }

    pub fn displayed(&self) -> f64 {
        self.displayed
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    fn refresh(&mut self) -> f64 {
        let next = if self.complete {
            100.0
        } else {
            self.simulated.max(self.authoritative)
        };
        self.displayed = self.displayed.max(next);
        self.displayed
    }
}
