//! Component C: a FIFO queue of pending reservation requests.
//!
//! Grounded on the teacher's `Scheduler::waiters: RwLock<LinkedList<(StateIndex,
//! oneshot::Sender<Token>)>>` in `limiter/partitioning.rs`: each waiter is a
//! `oneshot` receiver parked on its own task, woken by whichever of the three
//! signal sources (release, window-reset timer, external-capacity-change)
//! next calls [`CapacityWaitQueue::notify_capacity_available`], exactly the
//! way the teacher's `Scheduler::reuse_permit` walks and pops its waiter list.

use std::collections::VecDeque;

use tokio::sync::{oneshot, Mutex};
use tokio::time::{timeout, Duration};

/// A FIFO queue of reservation attempts blocked on capacity.
///
/// The queue itself holds no reservation logic. Callers pass their own
/// non-blocking `try_reserve` closure to each call, which lets one model's
/// `ModelLimiter` own the queue as a plain field without the closure needing
/// to capture `self` at construction time.
pub struct CapacityWaitQueue<T> {
    waiters: Mutex<VecDeque<oneshot::Sender<T>>>,
}

impl<T> Default for CapacityWaitQueue<T> {
    fn default() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> CapacityWaitQueue<T>
where
    T: Send + 'static,
{
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt a reservation, waiting up to `max_wait` if none is immediately
    /// available. `max_wait == 0` means no queueing: one attempt, returned
    /// immediately.
    pub async fn wait_for_capacity<F>(&self, max_wait: Duration, mut try_reserve: F) -> Option<T>
    where
        F: FnMut() -> Option<T>,
    {
        if let Some(ctx) = try_reserve() {
            return Some(ctx);
        }
        if max_wait.is_zero() {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().await;
            waiters.push_back(tx);
        }

        // A notification may have raced with our own enqueue; re-check once more
        // before committing to the timeout wait.
        self.notify_capacity_available(&mut try_reserve).await;

        match timeout(max_wait, rx).await {
            Ok(Ok(ctx)) => Some(ctx),
            _ => None,
        }
    }

    /// Walk the queue head-to-tail, attempting `try_reserve` for each waiter
    /// in strict FIFO order. Stops at the first waiter `try_reserve` can't
    /// satisfy: a blocked head blocks the whole queue until it times out and
    /// is pruned.
    pub async fn notify_capacity_available<F>(&self, try_reserve: &mut F)
    where
        F: FnMut() -> Option<T>,
    {
        let mut waiters = self.waiters.lock().await;
        loop {
            match waiters.front() {
                None => break,
                Some(front) if front.is_closed() => {
                    // The waiter already timed out (its receiver was dropped).
                    waiters.pop_front();
                    continue;
                }
                Some(_) => match try_reserve() {
                    Some(ctx) => {
                        let sender = waiters.pop_front().expect("front checked above");
                        // If the send fails, the receiver raced us into timing out; `ctx`
                        // is simply dropped here, releasing whatever it held.
                        let _ = sender.send(ctx);
                    }
                    None => break,
                },
            }
        }
    }

    /// Number of waiters currently parked.
    pub async fn len(&self) -> usize {
        self.waiters.lock().await.len()
    }

    /// True if no waiters are parked.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn immediate_success_skips_queue() {
        let queue: CapacityWaitQueue<u32> = CapacityWaitQueue::new();
        let result = queue.wait_for_capacity(Duration::from_secs(1), || Some(42u32)).await;
        assert_eq!(result, Some(42));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn zero_wait_does_not_queue() {
        let queue: CapacityWaitQueue<u32> = CapacityWaitQueue::new();
        let result = queue.wait_for_capacity(Duration::ZERO, || None::<u32>).await;
        assert_eq!(result, None);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn fifo_order_on_notify() {
        let available = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(CapacityWaitQueue::<()>::new());

        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let q = queue.clone();
            let order = order.clone();
            let avail = available.clone();
            handles.push(tokio::spawn(async move {
                q.wait_for_capacity(Duration::from_secs(5), || {
                    let current = avail.load(Ordering::SeqCst);
                    if current > 0 {
                        avail.fetch_sub(1, Ordering::SeqCst);
                        Some(())
                    } else {
                        None
                    }
                })
                .await;
                order.lock().await.push(i);
            }));
        }

        tokio::task::yield_now().await;

        for _ in 0..3 {
            available.fetch_add(1, Ordering::SeqCst);
            queue
                .notify_capacity_available(&mut || {
                    let current = available.load(Ordering::SeqCst);
                    if current > 0 {
                        available.fetch_sub(1, Ordering::SeqCst);
                        Some(())
                    } else {
                        None
                    }
                })
                .await;
            tokio::task::yield_now().await;
        }

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn timeout_drops_waiter_without_blocking_others() {
        tokio::time::pause();
        let queue = Arc::new(CapacityWaitQueue::<u32>::new());

        let q = queue.clone();
        let waiter =
            tokio::spawn(async move { q.wait_for_capacity(Duration::from_millis(50), || None::<u32>).await });

        tokio::task::yield_now().await;
        assert_eq!(queue.len().await, 1);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(waiter.await.unwrap(), None);

        // The timed-out sender is pruned lazily on the next notify.
        queue.notify_capacity_available(&mut || None::<u32>).await;
        assert!(queue.is_empty().await);
    }
}
