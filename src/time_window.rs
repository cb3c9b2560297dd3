//! Component A: rolling per-window sums with atomic capacity checks.
//!
//! A window roll is a compound read-modify-write (compare now against the
//! window start, conditionally zero the sum, conditionally advance the
//! start). State lives behind a single [`parking_lot::Mutex`] rather than
//! bare atomics, the multi-field equivalent of the teacher crate's
//! `AtomicUsize::fetch_update` closures, and a synchronous lock so a model's
//! whole cross-dimension reservation (§4.D) can stay non-async and run to
//! completion between two suspension points.

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

/// A snapshot of a counter's usage for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    /// The configured limit.
    pub limit: u64,
    /// Current usage within the active window.
    pub current: u64,
    /// Remaining capacity within the active window.
    pub remaining: u64,
    /// Milliseconds until the window resets.
    pub resets_in_ms: u64,
}

struct State {
    limit: u64,
    current_sum: u64,
    window_start: Instant,
}

/// A single rolling rate-limit counter (e.g. tokens-per-minute).
pub struct TimeWindowCounter {
    window: Duration,
    state: Mutex<State>,
}

impl TimeWindowCounter {
    /// Create a counter with the given `limit` over a rolling `window`.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(State {
                limit,
                current_sum: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Advance the window if due. Returns the (possibly just-refreshed) window start.
    fn roll(&self, state: &mut State) -> Instant {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.window_start);
        if elapsed >= self.window && self.window > Duration::ZERO {
            // Advance in whole multiples of window, matching "monotonically advanced in
            // multiples of windowMs from the process start".
            let periods = (elapsed.as_nanos() / self.window.as_nanos().max(1)) as u32;
            state.window_start += self.window * periods;
            state.current_sum = 0;
        }
        state.window_start
    }

    /// True iff `current + n <= limit` after any implicit window advance.
    pub fn has_capacity_for(&self, n: u64) -> bool {
        let mut state = self.state.lock();
        self.roll(&mut state);
        state.current_sum.saturating_add(n) <= state.limit
    }

    /// Add `n` to the active window's sum, advancing the window first if due.
    /// Never blocks, never rejects. The caller must have already checked capacity.
    /// Returns the window start the addition was recorded against.
    pub fn add(&self, n: u64) -> Instant {
        let mut state = self.state.lock();
        let start = self.roll(&mut state);
        state.current_sum = state.current_sum.saturating_add(n);
        start
    }

    /// Decrement the sum by `n`, but only if the active window's start still
    /// equals `captured_window_start`; otherwise a no-op (the window has
    /// since rolled over and the refund no longer applies). Clamped at zero.
    pub fn subtract_if_same_window(&self, n: u64, captured_window_start: Instant) {
        let mut state = self.state.lock();
        // Do not roll here: rolling would itself invalidate the comparison we're
        // about to make, and a stale window's sum is about to be discarded anyway.
        if state.window_start == captured_window_start {
            state.current_sum = state.current_sum.saturating_sub(n);
        }
    }

    /// The current window's start timestamp.
    pub fn window_start(&self) -> Instant {
        let mut state = self.state.lock();
        self.roll(&mut state)
    }

    /// Time remaining until the active window resets.
    pub fn time_until_reset(&self) -> Duration {
        let mut state = self.state.lock();
        self.roll(&mut state);
        let elapsed = Instant::now().saturating_duration_since(state.window_start);
        self.window.saturating_sub(elapsed)
    }

    /// Change the limit. Never retroactively evicts existing usage: if the
    /// new limit is below current usage, `remaining` reports zero until the
    /// window rolls.
    pub fn set_limit(&self, new_limit: u64) {
        let mut state = self.state.lock();
        state.limit = new_limit;
    }

    /// A snapshot of limit/current/remaining/reset-time.
    pub fn stats(&self) -> WindowStats {
        let mut state = self.state.lock();
        self.roll(&mut state);
        let remaining = state.limit.saturating_sub(state.current_sum);
        let elapsed = Instant::now().saturating_duration_since(state.window_start);
        let resets_in_ms = self.window.saturating_sub(elapsed).as_millis() as u64;
        WindowStats {
            limit: state.limit,
            current: state.current_sum,
            remaining,
            resets_in_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn has_capacity_respects_limit() {
        let counter = TimeWindowCounter::new(100, Duration::from_secs(60));
        assert!(counter.has_capacity_for(100));
        assert!(!counter.has_capacity_for(101));
    }

    #[tokio::test]
    async fn add_then_refund_returns_to_baseline() {
        tokio::time::pause();
        let counter = TimeWindowCounter::new(100, Duration::from_secs(60));
        let start = counter.add(100);
        assert!(!counter.has_capacity_for(1));

        counter.subtract_if_same_window(80, start);
        let stats = counter.stats();
        assert_eq!(stats.current, 20);
        assert!(counter.has_capacity_for(80));
        assert!(!counter.has_capacity_for(81));
    }

    #[tokio::test]
    async fn refund_dropped_after_window_rolls() {
        tokio::time::pause();
        let counter = TimeWindowCounter::new(100, Duration::from_secs(60));
        let start = counter.add(100);

        tokio::time::advance(Duration::from_secs(61)).await;
        // Force a roll by checking capacity.
        assert!(counter.has_capacity_for(100));

        // A refund captured against the old window is now a no-op.
        counter.subtract_if_same_window(100, start);
        let stats = counter.stats();
        assert_eq!(stats.current, 0, "window already rolled, sum is fresh");
    }

    #[tokio::test]
    async fn set_limit_does_not_evict_existing_usage() {
        let counter = TimeWindowCounter::new(100, Duration::from_secs(60));
        counter.add(90);
        counter.set_limit(50);

        let stats = counter.stats();
        assert_eq!(stats.current, 90, "existing usage is untouched");
        assert_eq!(stats.remaining, 0);
        assert!(!counter.has_capacity_for(1));
    }

    #[tokio::test]
    async fn set_limit_twice_is_idempotent() {
        let counter = TimeWindowCounter::new(100, Duration::from_secs(60));
        counter.set_limit(40);
        counter.set_limit(40);
        assert_eq!(counter.stats().limit, 40);
    }

    #[tokio::test]
    async fn window_rolls_after_full_duration() {
        tokio::time::pause();
        let counter = TimeWindowCounter::new(10, Duration::from_secs(60));
        counter.add(10);
        assert!(!counter.has_capacity_for(1));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(counter.has_capacity_for(10), "window should have rolled");
    }
}
