//! Component E: the single process-wide memory pool, shared across all
//! models, with optional per-job-type sub-pools.
//!
//! Host free memory is read through [`HostMemoryProbe`] so tests can supply a
//! deterministic fake instead of reading `/proc/meminfo`. The periodic
//! recomputation is a `tokio::time::interval`-driven background task owned by
//! [`MemoryManager`], started by `start()` and cancelled by `stop()`, per the
//! periodic-task redesign flag: every interval becomes a cancellable task
//! owned by the component that needs it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::config::{JobTypeId, MemoryConfig};
use crate::semaphore::{Permit, PermitSemaphore};

/// Supplies the current amount of free host memory, in KB.
pub trait HostMemoryProbe: Send + Sync {
    /// Free host memory, in KB.
    fn free_kb(&self) -> u64;
}

/// A fixed-value probe, useful for tests and for hosts where host-level
/// introspection isn't available.
pub struct FixedMemoryProbe(pub u64);

impl HostMemoryProbe for FixedMemoryProbe {
    fn free_kb(&self) -> u64 {
        self.0
    }
}

/// Reads `/proc/meminfo`'s `MemAvailable` field on Linux. Falls back to zero
/// (no capacity) on any parse failure, which makes memory reservations
/// fail-closed rather than silently unbounded.
pub struct ProcMemInfoProbe;

impl HostMemoryProbe for ProcMemInfoProbe {
    #[cfg(target_os = "linux")]
    fn free_kb(&self) -> u64 {
        let Ok(contents) = std::fs::read_to_string("/proc/meminfo") else {
            return 0;
        };
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix("MemAvailable:") {
                let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
                return digits.parse().unwrap_or(0);
            }
        }
        0
    }

    #[cfg(not(target_os = "linux"))]
    fn free_kb(&self) -> u64 {
        0
    }
}

/// The process-wide memory pool and its per-job-type sub-pools.
pub struct MemoryManager {
    probe: Arc<dyn HostMemoryProbe>,
    free_memory_ratio: f64,
    recalculation_interval: Duration,

    total_kb: AtomicU64,
    sub_pools: DashMap<JobTypeId, Arc<PermitSemaphore>>,
    ratios: DashMap<JobTypeId, f64>,

    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl MemoryManager {
    /// Create a manager, computing the initial pool size immediately.
    pub fn new(config: MemoryConfig, probe: Arc<dyn HostMemoryProbe>) -> Arc<Self> {
        let total_kb = (probe.free_kb() as f64 * config.free_memory_ratio).floor() as u64;
        Arc::new(Self {
            probe,
            free_memory_ratio: config.free_memory_ratio,
            recalculation_interval: Duration::from_millis(config.recalculation_interval_ms),
            total_kb: AtomicU64::new(total_kb),
            sub_pools: DashMap::new(),
            ratios: DashMap::new(),
            task: AsyncMutex::new(None),
        })
    }

    /// The current total pool size, in KB.
    pub fn total_kb(&self) -> u64 {
        self.total_kb.load(Ordering::Acquire)
    }

    /// Start the periodic recalculation task.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.task.lock().await;
        if guard.is_some() {
            return;
        }
        let this = self.clone();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.recalculation_interval);
            loop {
                ticker.tick().await;
                this.recompute();
            }
        }));
    }

    /// Stop the periodic recalculation task.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }

    fn recompute(&self) {
        let new_total = (self.probe.free_kb() as f64 * self.free_memory_ratio).floor() as u64;
        self.total_kb.store(new_total, Ordering::SeqCst);
        self.resize_sub_pools(new_total);
    }

    /// Called by the job type manager whenever ratios change (including the
    /// initial configuration).
    pub fn set_job_type_ratios(&self, ratios: &[(JobTypeId, f64)]) {
        for (job_type, ratio) in ratios {
            self.ratios.insert(job_type.clone(), *ratio);
        }
        self.resize_sub_pools(self.total_kb());
    }

    fn resize_sub_pools(&self, total_kb: u64) {
        for entry in self.ratios.iter() {
            let job_type = entry.key().clone();
            let ratio = *entry.value();
            let size = (total_kb as f64 * ratio).floor() as u64;
            self.sub_pools
                .entry(job_type)
                .and_modify(|pool| pool.resize(size))
                .or_insert_with(|| Arc::new(PermitSemaphore::new(size)));
        }
    }

    /// Attempt to acquire `kb` from the job type's sub-pool. If the job type
    /// has no configured ratio (no sub-pool), falls back to treating the
    /// whole process pool as the sub-pool, lazily created on first use.
    pub fn try_acquire(&self, job_type: &JobTypeId, kb: u64) -> Option<Permit> {
        if kb == 0 {
            return None;
        }
        let pool = self
            .sub_pools
            .entry(job_type.clone())
            .or_insert_with(|| Arc::new(PermitSemaphore::new(self.total_kb())))
            .clone();
        pool.try_acquire(kb)
    }

    /// The sub-pool size currently allocated to a job type, for introspection.
    pub fn sub_pool_size(&self, job_type: &JobTypeId) -> Option<u64> {
        self.sub_pools.get(job_type).map(|pool| pool.max())
    }
}
