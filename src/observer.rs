//! Event-style callbacks modeled as an observer interface the core calls
//! under its own locks, per the redesign note on optional callback
//! registration: implementations are free to fan out to their own
//! threads/tasks on the outside, but the core never blocks waiting for them
//! to finish anything expensive (default methods are no-ops).

use crate::config::ModelId;

/// The reason an availability change notification fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyReason {
    /// Tokens-per-minute availability changed.
    TokensMinute,
    /// Tokens-per-day availability changed.
    TokensDay,
    /// Requests-per-minute availability changed.
    RequestsMinute,
    /// Requests-per-day availability changed.
    RequestsDay,
    /// Concurrency availability changed.
    Concurrency,
    /// Memory availability changed.
    Memory,
    /// Derived slot availability changed.
    Slots,
    /// A ratio adjustment ran.
    Adjustment,
    /// A distributed pool allocation changed.
    Distributed,
}

/// One resource dimension exceeding its pre-reserved estimate.
#[derive(Debug, Clone)]
pub struct OverageEvent {
    /// Which resource type overran its estimate (`"tokens"`, `"requests"`, `"memory"`).
    pub resource_type: &'static str,
    /// What was estimated at reservation time.
    pub estimated: u64,
    /// What was actually used.
    pub actual: u64,
    /// `actual - estimated`.
    pub overage: u64,
    /// Milliseconds since the Unix epoch when the overage was recorded.
    pub timestamp_ms: u128,
}

/// The current availability for one model along one dimension, surfaced with
/// an [`OverageEvent`]-style derived value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    /// Remaining units on the changed dimension (tokens, requests, permits...).
    pub remaining: u64,
    /// Derived slots: `min over active dimensions of floor(available / estimate)`.
    pub slots: u64,
}

/// Observer hooks the core calls synchronously at the point of the event.
/// All methods default to no-ops so callers implement only what they need.
pub trait Observer: Send + Sync {
    /// A free-form internal log line, mirroring `onLog`.
    fn on_log(&self, _message: &str) {}

    /// Fired when actual usage exceeds a pre-reserved estimate.
    fn on_overage(&self, _event: &OverageEvent) {}

    /// Fired at most once per (model, reason) when a derived availability
    /// value actually changes.
    fn on_available_slots_change(
        &self,
        _model_id: &ModelId,
        _reason: NotifyReason,
        _availability: Availability,
    ) {
    }
}

/// An [`Observer`] that does nothing, used when the caller registers none.
pub struct NoopObserver;

impl Observer for NoopObserver {}
