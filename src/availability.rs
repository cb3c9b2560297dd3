//! Component H: coalesces raw dimension readings into change-only
//! notifications through the [`Observer`] callback.
//!
//! Holds the last-emitted value per `(modelId, dimension)` tuple in a
//! `dashmap::DashMap` and only calls `on_available_slots_change` when a
//! freshly computed value actually differs from what was last emitted,
//! matching the "fires... only when the value actually changed" requirement.

use dashmap::DashMap;

use crate::config::ModelId;
use crate::observer::{Availability, NotifyReason, Observer};

/// Tracks last-emitted `(model, dimension)` values and suppresses
/// no-change notifications.
#[derive(Default)]
pub struct AvailabilityTracker {
    last_emitted: DashMap<(ModelId, NotifyReason), Availability>,
}

impl AvailabilityTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a freshly computed availability reading. Calls
    /// `observer.on_available_slots_change` only if it differs from the last
    /// value emitted for this `(model, reason)`.
    pub fn report(
        &self,
        observer: &dyn Observer,
        model_id: &ModelId,
        reason: NotifyReason,
        availability: Availability,
    ) {
        let key = (model_id.clone(), reason);
        let changed = match self.last_emitted.get(&key) {
            Some(last) => *last != availability,
            None => true,
        };
        if changed {
            self.last_emitted.insert(key, availability);
            observer.on_available_slots_change(model_id, reason, availability);
        }
    }

    /// The derived **slots** value: `min` over the active dimensions of
    /// `floor(available / estimate)`. Dimensions with a zero estimate (not
    /// pre-reserved) don't constrain slots and are skipped.
    pub fn derived_slots(dimensions: &[(u64, u64)]) -> u64 {
        dimensions
            .iter()
            .filter(|(_, estimate)| *estimate > 0)
            .map(|(available, estimate)| available / estimate)
            .min()
            .unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingObserver(Arc<AtomicUsize>);
    impl Observer for CountingObserver {
        fn on_available_slots_change(
            &self,
            _model_id: &ModelId,
            _reason: NotifyReason,
            _availability: Availability,
        ) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn suppresses_unchanged_readings() {
        let tracker = AvailabilityTracker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let observer = CountingObserver(count.clone());
        let model = "m".to_string();
        let reading = Availability { remaining: 10, slots: 5 };

        tracker.report(&observer, &model, NotifyReason::TokensMinute, reading);
        tracker.report(&observer, &model, NotifyReason::TokensMinute, reading);
        assert_eq!(count.load(Ordering::SeqCst), 1, "identical reading must not re-fire");

        tracker.report(
            &observer,
            &model,
            NotifyReason::TokensMinute,
            Availability { remaining: 9, slots: 5 },
        );
        assert_eq!(count.load(Ordering::SeqCst), 2, "a changed reading must fire");
    }

    #[test]
    fn distinct_reasons_track_independently() {
        let tracker = AvailabilityTracker::new();
        let model = "m".to_string();
        let reading = Availability { remaining: 10, slots: 5 };

        tracker.report(&NoopObserver, &model, NotifyReason::TokensMinute, reading);
        tracker.report(&NoopObserver, &model, NotifyReason::Concurrency, reading);
        assert_eq!(tracker.last_emitted.len(), 2);
    }

    #[test]
    fn derived_slots_is_min_over_active_dimensions() {
        let slots = AvailabilityTracker::derived_slots(&[(100, 10), (12, 1), (0, 0)]);
        assert_eq!(slots, 10.min(12));
    }
}
