//! Escalating retry backoff for failed announces.

use rand::Rng;

/// Non-seed cap on the error-retry interval, in seconds.
const MAX_BACKOFF_SECS: u32 = 1800;
/// Seeds retry half as often.
const MAX_BACKOFF_SECS_SEED: u32 = 3600;

/// Per-torrent failure backoff counter.
///
/// Escalates while consecutive failures continue and resets on any
/// successful contact. Re-escalates at most once per wall-clock second so
/// rapid retries cannot run the interval away. Callers supply the current
/// time so the escalation schedule is testable.
#[derive(Debug, Default)]
pub struct FailureBackoff {
    failure_added_time: u32,
    failure_time_last_updated: u64,
}

impl FailureBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the counter after a successful tracker contact.
    pub fn reset(&mut self) {
        self.failure_added_time = 0;
        self.failure_time_last_updated = 0;
    }

    /// Forces a minimum accumulated backoff, used when the tracker has
    /// explicitly reported an error and quick retries are pointless.
    pub fn raise_floor(&mut self, floor_secs: u32) {
        if self.failure_added_time < floor_secs {
            self.failure_added_time = floor_secs;
        }
    }

    /// Current interval without escalating.
    pub fn current(&self) -> u32 {
        self.failure_added_time
    }

    /// Retry interval to use after an announce error.
    ///
    /// Escalation schedule: 10s start, +10 below 30, +15 below 60, +30
    /// below 120, +60 below 600, then +120 plus up to a minute of jitter.
    /// Doubled for seeds, capped at 1800s (3600s for seeds).
    pub fn error_retry_interval(&mut self, now_secs: u64, is_seed: bool) -> u32 {
        let diff = now_secs.saturating_sub(self.failure_time_last_updated);

        // Not time to escalate yet, reuse the previous interval.
        if now_secs >= self.failure_time_last_updated && diff < u64::from(self.failure_added_time) {
            return self.failure_added_time;
        }

        self.failure_time_last_updated = now_secs;

        self.failure_added_time = match self.failure_added_time {
            0 => 10,
            t if t < 30 => t + 10,
            t if t < 60 => t + 15,
            t if t < 120 => t + 30,
            t if t < 600 => t + 60,
            t => t + 120 + rand::rng().random_range(0..60),
        };

        if is_seed {
            self.failure_added_time = (self.failure_added_time * 2).min(MAX_BACKOFF_SECS_SEED);
        } else {
            self.failure_added_time = self.failure_added_time.min(MAX_BACKOFF_SECS);
        }

        self.failure_added_time
    }
}
