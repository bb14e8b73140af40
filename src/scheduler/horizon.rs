//! Horizon policy: which future ticks deserve an in-memory timer.
//!
//! Only jobs due within a rolling near-term window are held as live
//! timers; everything else stays dormant in the job store until a resync
//! pass observes it entering the window. This bounds timer memory to the
//! near-term working set at the cost of up to one resync interval of
//! scheduling slack.

use std::time::Duration;

/// Default horizon window. A tuning parameter, not a contract value; it
/// must exceed the resync interval so no due job can fall between two
/// resync passes.
const DEFAULT_HORIZON: Duration = Duration::from_secs(70 * 60);

/// Decides whether an instant falls inside the near-term window.
#[derive(Debug, Clone, Copy)]
pub struct HorizonPolicy {
    window: Duration,
}

impl HorizonPolicy {
    /// Create a policy with a custom window.
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// The window duration.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// The horizon bound for a given "now": `now + window`, epoch ms.
    pub fn horizon_ms(&self, now_ms: i64) -> i64 {
        now_ms + self.window.as_millis() as i64
    }

    /// Whether `tick_ms` falls inside the window relative to `now_ms`.
    pub fn within(&self, tick_ms: i64, now_ms: i64) -> bool {
        tick_ms <= self.horizon_ms(now_ms)
    }
}

impl Default for HorizonPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_HORIZON)
    }
}
