//! Component D: the per-model admission controller.
//!
//! Composes A (time windows), B (weighted semaphores for concurrency and
//! per-model memory) and C (the capacity wait queue) into one model's atomic
//! cross-dimensional reservation. `ReservationContext` is `#[must_use]` and
//! carries its held permits directly (grounded on the teacher's `Token`/
//! `TokenInner` pair in `limiter/token.rs`): dropping it without an explicit
//! release still frees the permits it holds (Rust's ownership model already
//! prevents the double-release invariant 6 in the design document's test
//! list from being violated: `release` takes the context by value, so a
//! second call is a compile error, not a runtime check), but skips the
//! window refund, which is why every call site is written to always route
//! through `release`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::config::{JobTypeId, ModelId, ModelLimits, ResourceEstimate};
use crate::memory::MemoryManager;
use crate::observer::{Observer, OverageEvent};
use crate::semaphore::{Permit, PermitSemaphore};
use crate::time_window::TimeWindowCounter;
use crate::wait_queue::CapacityWaitQueue;

/// The window-start timestamps captured at reservation time, one per active
/// counter. Used to authorize same-window refunds; a window that has since
/// rolled over silently drops the refund.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowStarts {
    /// Requests-per-minute window start, if that dimension is active.
    pub rpm: Option<Instant>,
    /// Requests-per-day window start, if that dimension is active.
    pub rpd: Option<Instant>,
    /// Tokens-per-minute window start, if that dimension is active.
    pub tpm: Option<Instant>,
    /// Tokens-per-day window start, if that dimension is active.
    pub tpd: Option<Instant>,
}

/// The real usage of a completed (or partially completed) job, diffed
/// against the estimate that was reserved.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActualUsage {
    /// Actual input+output tokens consumed.
    pub tokens: u64,
    /// Actual request count (usually 1, 0 if the call never went out).
    pub requests: u64,
    /// Actual memory used, in KB.
    pub memory_kb: u64,
}

/// An opaque handle to one in-flight reservation, held between
/// `try_reserve`/`wait_for_capacity_with_timeout` and the matching `release`.
#[must_use = "a reservation must be released exactly once via ModelLimiter::release"]
pub struct ReservationContext {
    pub(crate) job_type_id: JobTypeId,
    pub(crate) window_starts: WindowStarts,
    pub(crate) estimate: ResourceEstimate,
    // Held permits. Their own `Drop` impls return capacity even if this
    // context is dropped without an explicit `release` call.
    concurrency_permit: Option<Permit>,
    model_memory_permit: Option<Permit>,
    shared_memory_permit: Option<Permit>,
}

impl Drop for ReservationContext {
    fn drop(&mut self) {
        tracing::trace!(job_type = %self.job_type_id, "reservation context dropped");
    }
}

/// A snapshot of one model's limiter state, for introspection.
#[derive(Debug, Clone, Default)]
pub struct ModelStats {
    /// Requests-per-minute window stats, if configured.
    pub requests_per_minute: Option<crate::time_window::WindowStats>,
    /// Requests-per-day window stats, if configured.
    pub requests_per_day: Option<crate::time_window::WindowStats>,
    /// Tokens-per-minute window stats, if configured.
    pub tokens_per_minute: Option<crate::time_window::WindowStats>,
    /// Tokens-per-day window stats, if configured.
    pub tokens_per_day: Option<crate::time_window::WindowStats>,
    /// Concurrency in-use / max, if configured.
    pub concurrency: Option<(u64, u64)>,
    /// This model's own memory pool in-use / max (KB), if `maxMemoryKB` is configured.
    pub memory_kb: Option<(u64, u64)>,
}

/// The per-model admission controller (component D).
pub struct ModelLimiter {
    model_id: ModelId,
    rpm: Option<TimeWindowCounter>,
    rpd: Option<TimeWindowCounter>,
    tpm: Option<TimeWindowCounter>,
    tpd: Option<TimeWindowCounter>,
    concurrency: Option<PermitSemaphore>,
    model_memory: Option<PermitSemaphore>,
    memory_manager: Option<Arc<MemoryManager>>,
    wait_queue: CapacityWaitQueue<ReservationContext>,
    // Last estimate seen per job type, learned from `try_reserve` calls. Lets
    // `release` and the window-reset waker re-drive the queue on behalf of
    // every job type that could plausibly be parked, without either of them
    // needing to know in advance which job types share this model.
    job_estimates: DashMap<JobTypeId, ResourceEstimate>,
    reset_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl ModelLimiter {
    /// Build the limiter for one configured model.
    pub fn new(
        model_id: ModelId,
        limits: &ModelLimits,
        memory_manager: Option<Arc<MemoryManager>>,
    ) -> Self {
        Self {
            model_id,
            rpm: limits
                .requests_per_minute
                .map(|n| TimeWindowCounter::new(n, Duration::from_secs(60))),
            rpd: limits
                .requests_per_day
                .map(|n| TimeWindowCounter::new(n, Duration::from_secs(86_400))),
            tpm: limits
                .tokens_per_minute
                .map(|n| TimeWindowCounter::new(n, Duration::from_secs(60))),
            tpd: limits
                .tokens_per_day
                .map(|n| TimeWindowCounter::new(n, Duration::from_secs(86_400))),
            concurrency: limits
                .max_concurrent_requests
                .map(PermitSemaphore::new),
            model_memory: limits.max_memory_kb.map(PermitSemaphore::new),
            memory_manager,
            wait_queue: CapacityWaitQueue::new(),
            job_estimates: DashMap::new(),
            reset_task: AsyncMutex::new(None),
        }
    }

    /// This model's id.
    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    /// Non-blocking reservation attempt across every active dimension, in the
    /// fixed order: time-windows, then memory, then concurrency. Any failure
    /// after the time-window increments rolls them back via
    /// `subtract_if_same_window`.
    pub fn try_reserve(
        &self,
        job_type_id: &JobTypeId,
        estimate: ResourceEstimate,
    ) -> Option<ReservationContext> {
        self.job_estimates.insert(job_type_id.clone(), estimate);

        let measure_only = estimate.is_measure_only();

        if !measure_only {
            let windows_ok = [&self.tpm, &self.tpd]
                .into_iter()
                .all(|w| w.as_ref().map_or(true, |c| c.has_capacity_for(estimate.estimated_tokens)))
                && [&self.rpm, &self.rpd]
                    .into_iter()
                    .all(|w| w.as_ref().map_or(true, |c| c.has_capacity_for(estimate.estimated_requests)));
            if !windows_ok {
                return None;
            }
        }

        let window_starts = if measure_only {
            WindowStarts::default()
        } else {
            WindowStarts {
                rpm: self.rpm.as_ref().map(|c| c.add(estimate.estimated_requests)),
                rpd: self.rpd.as_ref().map(|c| c.add(estimate.estimated_requests)),
                tpm: self.tpm.as_ref().map(|c| c.add(estimate.estimated_tokens)),
                tpd: self.tpd.as_ref().map(|c| c.add(estimate.estimated_tokens)),
            }
        };

        let rollback_windows = |starts: &WindowStarts| {
            if let (Some(c), Some(s)) = (&self.rpm, starts.rpm) {
                c.subtract_if_same_window(estimate.estimated_requests, s);
            }
            if let (Some(c), Some(s)) = (&self.rpd, starts.rpd) {
                c.subtract_if_same_window(estimate.estimated_requests, s);
            }
            if let (Some(c), Some(s)) = (&self.tpm, starts.tpm) {
                c.subtract_if_same_window(estimate.estimated_tokens, s);
            }
            if let (Some(c), Some(s)) = (&self.tpd, starts.tpd) {
                c.subtract_if_same_window(estimate.estimated_tokens, s);
            }
        };

        let model_memory_permit = if estimate.estimated_memory_kb > 0 {
            match self.model_memory.as_ref().map(|m| m.try_acquire(estimate.estimated_memory_kb)) {
                Some(None) => {
                    rollback_windows(&window_starts);
                    return None;
                }
                other => other.flatten(),
            }
        } else {
            None
        };

        let shared_memory_permit = if estimate.estimated_memory_kb > 0 {
            match self
                .memory_manager
                .as_ref()
                .map(|m| m.try_acquire(job_type_id, estimate.estimated_memory_kb))
            {
                Some(None) => {
                    drop(model_memory_permit);
                    rollback_windows(&window_starts);
                    return None;
                }
                other => other.flatten(),
            }
        } else {
            None
        };

        let concurrency_permit = if let Some(sem) = &self.concurrency {
            match sem.try_acquire(1) {
                Some(p) => Some(p),
                None => {
                    drop(model_memory_permit);
                    drop(shared_memory_permit);
                    rollback_windows(&window_starts);
                    return None;
                }
            }
        } else {
            None
        };

        Some(ReservationContext {
            job_type_id: job_type_id.clone(),
            window_starts,
            estimate,
            concurrency_permit,
            model_memory_permit,
            shared_memory_permit,
        })
    }

    /// Wait up to `max_wait` for a reservation to become available.
    /// `max_wait == Duration::ZERO` is a single non-blocking attempt.
    pub async fn wait_for_capacity_with_timeout(
        &self,
        job_type_id: &JobTypeId,
        estimate: ResourceEstimate,
        max_wait: Duration,
    ) -> Option<ReservationContext> {
        self.wait_queue
            .wait_for_capacity(max_wait, || self.try_reserve(job_type_id, estimate))
            .await
    }

    /// Diff `actual` against the context's estimate and refund/overage each
    /// time-window dimension, then release the held memory and concurrency
    /// permits. Consumes the context, satisfying "released exactly once" by
    /// construction.
    pub async fn release(&self, ctx: ReservationContext, actual: ActualUsage, observer: &dyn Observer) {
        self.record_actual_usage(&ctx, actual, observer);
        drop(ctx);
        self.wake_all_job_types().await;
    }

    /// Release a reservation whose job never ran (e.g. delegation succeeded
    /// on another model first). Equivalent to `release` with zero actual
    /// usage: the full estimate is refunded.
    pub async fn release_reservation(&self, ctx: ReservationContext, observer: &dyn Observer) {
        self.release(ctx, ActualUsage::default(), observer).await;
    }

    fn record_actual_usage(&self, ctx: &ReservationContext, actual: ActualUsage, observer: &dyn Observer) {
        if ctx.estimate.is_measure_only() {
            // No pre-reservation exists; record directly against the
            // then-current window.
            if let Some(c) = &self.tpm {
                c.add(actual.tokens);
            }
            if let Some(c) = &self.tpd {
                c.add(actual.tokens);
            }
            if let Some(c) = &self.rpm {
                c.add(actual.requests);
            }
            if let Some(c) = &self.rpd {
                c.add(actual.requests);
            }
            return;
        }

        apply_diff(&self.tpm, ctx.window_starts.tpm, ctx.estimate.estimated_tokens, actual.tokens, "tokens", observer);
        apply_diff(&self.tpd, ctx.window_starts.tpd, ctx.estimate.estimated_tokens, actual.tokens, "tokens", observer);
        apply_diff(&self.rpm, ctx.window_starts.rpm, ctx.estimate.estimated_requests, actual.requests, "requests", observer);
        apply_diff(&self.rpd, ctx.window_starts.rpd, ctx.estimate.estimated_requests, actual.requests, "requests", observer);
    }

    /// Wake any parked waiters after a release, a window reset, or an
    /// external (backend) capacity change.
    pub async fn notify_capacity_available(&self, job_type_id: &JobTypeId, estimate: ResourceEstimate) {
        self.wait_queue
            .notify_capacity_available(&mut || self.try_reserve(job_type_id, estimate))
            .await;
    }

    /// Re-drive the wait queue for every job type this model has ever seen a
    /// reservation attempt from. Used after a same-model release (wake source
    /// 1 in the design document) and by the window-reset waker (wake source
    /// 2), neither of which has a single job type/estimate of its own to
    /// retry with.
    async fn wake_all_job_types(&self) {
        let pending: Vec<(JobTypeId, ResourceEstimate)> =
            self.job_estimates.iter().map(|e| (e.key().clone(), *e.value())).collect();
        for (job_type_id, estimate) in pending {
            self.notify_capacity_available(&job_type_id, estimate).await;
        }
    }

    /// Shortest time until any active window resets, or `None` if this model
    /// has no time-windowed dimensions at all (nothing for the waker to do).
    fn next_reset(&self) -> Option<Duration> {
        [&self.rpm, &self.rpd, &self.tpm, &self.tpd]
            .into_iter()
            .flatten()
            .map(TimeWindowCounter::time_until_reset)
            .min()
    }

    /// Start the window-reset waker: wake source 2 in the design document.
    /// Sleeps until the nearest active window resets, re-drives the wait
    /// queue for every job type seen so far, then re-schedules against
    /// whichever window resets next. A model with no time-windowed
    /// dimensions has nothing to wait on and never spawns a task.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.reset_task.lock().await;
        if guard.is_some() {
            return;
        }
        let Some(_) = self.next_reset() else {
            return;
        };
        let this = self.clone();
        *guard = Some(tokio::spawn(async move {
            loop {
                let Some(wait) = this.next_reset() else { break };
                // A window may already be in its last instant; sleep at least
                // 1ms so the reset has actually elapsed by the time we wake.
                tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                this.wake_all_job_types().await;
            }
        }));
    }

    /// Stop the window-reset waker task, if running.
    pub async fn stop(&self) {
        if let Some(handle) = self.reset_task.lock().await.take() {
            handle.abort();
        }
    }

    /// Live-update the per-minute limits (used when a backend publishes a
    /// new pool allocation).
    pub fn set_rate_limits(&self, tokens_per_minute: Option<u64>, requests_per_minute: Option<u64>) {
        if let (Some(counter), Some(limit)) = (&self.tpm, tokens_per_minute) {
            counter.set_limit(limit);
        }
        if let (Some(counter), Some(limit)) = (&self.rpm, requests_per_minute) {
            counter.set_limit(limit);
        }
    }

    /// Live-resize the concurrency limit.
    pub fn set_max_concurrency(&self, max: u64) {
        if let Some(sem) = &self.concurrency {
            sem.resize(max);
        }
    }

    /// Capacity for one future reservation given current estimates, without
    /// actually reserving anything. Time-window estimates of zero are
    /// rounded up to 1 so "measure-only" types still report truthfully.
    pub fn has_capacity(&self, estimate: ResourceEstimate) -> bool {
        let tokens = estimate.estimated_tokens.max(1);
        let requests = estimate.estimated_requests.max(1);
        let windows_ok = self.tpm.as_ref().map_or(true, |c| c.has_capacity_for(tokens))
            && self.tpd.as_ref().map_or(true, |c| c.has_capacity_for(tokens))
            && self.rpm.as_ref().map_or(true, |c| c.has_capacity_for(requests))
            && self.rpd.as_ref().map_or(true, |c| c.has_capacity_for(requests));
        let concurrency_ok = self.concurrency.as_ref().map_or(true, |s| s.in_use() < s.max());
        windows_ok && concurrency_ok
    }

    /// A snapshot of this model's limiter state.
    pub fn stats(&self) -> ModelStats {
        ModelStats {
            requests_per_minute: self.rpm.as_ref().map(|c| c.stats()),
            requests_per_day: self.rpd.as_ref().map(|c| c.stats()),
            tokens_per_minute: self.tpm.as_ref().map(|c| c.stats()),
            tokens_per_day: self.tpd.as_ref().map(|c| c.stats()),
            concurrency: self.concurrency.as_ref().map(|s| (s.in_use(), s.max())),
            memory_kb: self.model_memory.as_ref().map(|s| (s.in_use(), s.max())),
        }
    }
}

fn apply_diff(
    counter: &Option<TimeWindowCounter>,
    captured_start: Option<Instant>,
    estimated: u64,
    actual: u64,
    resource_type: &'static str,
    observer: &dyn Observer,
) {
    let (Some(counter), Some(start)) = (counter, captured_start) else {
        return;
    };
    if actual <= estimated {
        let diff = estimated - actual;
        if diff > 0 {
            counter.subtract_if_same_window(diff, start);
        }
    } else {
        let overage = actual - estimated;
        counter.add(overage);
        observer.on_overage(&OverageEvent {
            resource_type,
            estimated,
            actual,
            overage,
            timestamp_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0),
        });
    }
}
