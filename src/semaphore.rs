//! Component B: a weighted permit semaphore with live resize.
//!
//! Built directly on [`tokio::sync::Semaphore`], the same primitive the
//! teacher crate wraps in its own `Limiter`. `tokio::sync::Semaphore` already
//! provides FIFO-fair weighted acquire/release; resize-down mirrors the
//! teacher's `Limiter::record_reading` shrink path (spawn a task that
//! acquires and forgets the delta in permits), and resize-up calls
//! `add_permits` directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::{timeout, Duration};

/// A held weighted permit. Dropping it releases the weight back to the semaphore.
pub type Permit = OwnedSemaphorePermit;

/// A weighted permit semaphore with a live-resizable maximum.
pub struct PermitSemaphore {
    semaphore: Arc<Semaphore>,
    max: AtomicU64,
}

impl PermitSemaphore {
    /// Create a semaphore with `max` total weight available.
    pub fn new(max: u64) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(usize_from(max))),
            max: AtomicU64::new(max),
        }
    }

    /// Non-blocking acquire of `weight` permits. Default weight is 1 at call sites.
    pub fn try_acquire(&self, weight: u64) -> Option<Permit> {
        if weight == 0 {
            return None;
        }
        match self.semaphore.clone().try_acquire_many_owned(u32_from(weight)) {
            Ok(permit) => Some(permit),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => {
                unreachable!("the semaphore is privately owned and never closed")
            }
        }
    }

    /// Blocking acquire of `weight` permits, up to `duration`.
    pub async fn acquire_timeout(&self, weight: u64, duration: Duration) -> Option<Permit> {
        if weight == 0 {
            return None;
        }
        match timeout(duration, self.semaphore.clone().acquire_many_owned(u32_from(weight))).await {
            Ok(Ok(permit)) => Some(permit),
            Ok(Err(_)) => unreachable!("the semaphore is privately owned and never closed"),
            Err(_) => None,
        }
    }

    /// Blocking acquire of `weight` permits with no timeout.
    pub async fn acquire(&self, weight: u64) -> Permit {
        self.semaphore
            .clone()
            .acquire_many_owned(u32_from(weight.max(1)))
            .await
            .expect("the semaphore is privately owned and never closed")
    }

    /// Permits currently in use.
    pub fn in_use(&self) -> u64 {
        let max = self.max.load(Ordering::Acquire);
        let available = self.semaphore.available_permits() as u64;
        max.saturating_sub(available)
    }

    /// The current maximum weight.
    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Acquire)
    }

    /// Live-resize the maximum weight. Waiters parked on `acquire`/`acquire_timeout`
    /// are woken by `tokio::sync::Semaphore` itself as soon as enough permits are
    /// added; shrinking removes permits from circulation as they become free.
    pub fn resize(&self, new_max: u64) {
        let old_max = self.max.swap(new_max, Ordering::SeqCst);
        match new_max.cmp(&old_max) {
            std::cmp::Ordering::Greater => {
                self.semaphore.add_permits(usize_from(new_max - old_max));
            }
            std::cmp::Ordering::Less => {
                let delta = old_max - new_max;
                let semaphore = self.semaphore.clone();
                tokio::spawn(async move {
                    let permits = semaphore
                        .acquire_many_owned(u32_from(delta))
                        .await
                        .expect("the semaphore is privately owned and never closed");
                    permits.forget();
                });
            }
            std::cmp::Ordering::Equal => {}
        }
    }
}

fn usize_from(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

fn u32_from(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_acquire_respects_max() {
        let sem = PermitSemaphore::new(2);
        let _a = sem.try_acquire(1).unwrap();
        let _b = sem.try_acquire(1).unwrap();
        assert!(sem.try_acquire(1).is_none());
        assert_eq!(sem.in_use(), 2);
    }

    #[tokio::test]
    async fn release_via_drop_frees_capacity() {
        let sem = PermitSemaphore::new(1);
        let permit = sem.try_acquire(1).unwrap();
        assert!(sem.try_acquire(1).is_none());
        drop(permit);
        assert!(sem.try_acquire(1).is_some());
    }

    #[tokio::test]
    async fn resize_up_wakes_waiters() {
        let sem = Arc::new(PermitSemaphore::new(1));
        let _held = sem.try_acquire(1).unwrap();

        let sem2 = sem.clone();
        let waiter = tokio::spawn(async move { sem2.acquire(1).await });

        tokio::task::yield_now().await;
        sem.resize(2);

        let _second = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be woken by resize")
            .unwrap();
        assert_eq!(sem.in_use(), 2);
    }

    #[tokio::test]
    async fn resize_down_reduces_available_capacity() {
        let sem = PermitSemaphore::new(4);
        sem.resize(1);
        // Give the background shrink task a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(sem.try_acquire(1).is_some());
        assert!(
            sem.try_acquire(1).is_none(),
            "max was shrunk to 1, only one permit should be available"
        );
    }

    #[tokio::test]
    async fn acquire_timeout_returns_none_when_exhausted() {
        let sem = PermitSemaphore::new(1);
        let _held = sem.try_acquire(1).unwrap();
        let result = sem.acquire_timeout(1, Duration::from_millis(10)).await;
        assert!(result.is_none());
    }
}
