//! Component F: per-job-type fair-share accounting and dynamic ratio
//! adjustment.
//!
//! State lives in two `dashmap::DashMap`s (grounded on the production-
//! platform example's use of `dashmap` for exactly this keyed-table shape):
//! one keyed by job type, one keyed by `(ModelId, JobTypeId)`. `acquire` is a
//! single `DashMap::get_mut` compare-and-increment against one shard: no
//! read-then-write gap, so the disabled concurrent-acquisition race the
//! source spec warns about has no analogue here. Ratio adjustments are
//! serialized against each other (never against reservations, which only
//! read `allocated_slots`/`in_flight`) by a dedicated `tokio::sync::Mutex<()>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::backend::Pool;
use crate::config::{JobTypeConfig, JobTypeId, ModelId, RatioAdjustmentConfig, ResourceEstimate};

#[derive(Debug, Clone)]
struct JobTypeState {
    estimate: ResourceEstimate,
    ratio: f64,
    flexible: bool,
    allocated_slots: u64,
    in_flight: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct ModelSlotState {
    allocated_slots: u64,
    in_flight: u64,
}

/// Tracks per-job-type share and per-(model, jobType) slot accounting.
pub struct JobTypeManager {
    types: DashMap<JobTypeId, JobTypeState>,
    model_slots: DashMap<(ModelId, JobTypeId), ModelSlotState>,
    model_pools: DashMap<ModelId, Pool>,
    model_memory_kb: DashMap<ModelId, u64>,

    config: RatioAdjustmentConfig,
    last_total_slots: AtomicU64,
    releases_since_adjustment: AtomicU64,
    adjustment_lock: AsyncMutex<()>,

    on_adjusted: SyncMutex<Option<Box<dyn Fn() + Send + Sync>>>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
    notify: Arc<Notify>,
    slot_notify: Notify,
}

impl JobTypeManager {
    /// Build the manager from the configured job types.
    pub fn new(job_types: &HashMap<JobTypeId, JobTypeConfig>, config: RatioAdjustmentConfig) -> Arc<Self> {
        let types = DashMap::new();
        for (id, cfg) in job_types {
            types.insert(
                id.clone(),
                JobTypeState {
                    estimate: cfg.estimate,
                    ratio: cfg.ratio.initial_value,
                    flexible: cfg.ratio.flexible,
                    allocated_slots: 0,
                    in_flight: 0,
                },
            );
        }
        Arc::new(Self {
            types,
            model_slots: DashMap::new(),
            model_pools: DashMap::new(),
            model_memory_kb: DashMap::new(),
            config,
            last_total_slots: AtomicU64::new(0),
            releases_since_adjustment: AtomicU64::new(0),
            adjustment_lock: AsyncMutex::new(()),
            on_adjusted: SyncMutex::new(None),
            task: AsyncMutex::new(None),
            notify: Arc::new(Notify::new()),
            slot_notify: Notify::new(),
        })
    }

    /// Acquire a global job-type slot, waiting up to `max_wait` for one to
    /// free up. `max_wait == Duration::ZERO` is a single non-blocking poll.
    pub async fn wait_for_capacity(&self, job_type: &JobTypeId, max_wait: Duration) -> bool {
        if self.acquire(job_type) {
            return true;
        }
        if max_wait.is_zero() {
            return false;
        }
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let notified = self.slot_notify.notified();
            tokio::select! {
                () = notified => {
                    if self.acquire(job_type) {
                        return true;
                    }
                }
                () = tokio::time::sleep(remaining) => {
                    return false;
                }
            }
        }
    }

    /// Acquire a global job-type slot, parking indefinitely until one frees
    /// up. Matches "this step has no timeout of its own" for the first step
    /// of the multi-model controller's protocol.
    pub async fn acquire_blocking(&self, job_type: &JobTypeId) -> bool {
        if !self.types.contains_key(job_type) {
            return false;
        }
        loop {
            let notified = self.slot_notify.notified();
            if self.acquire(job_type) {
                return true;
            }
            notified.await;
        }
    }

    /// Install a hook invoked (synchronously, off the adjustment lock) after
    /// a ratio adjustment actually changes any ratio, so the orchestrator can
    /// re-propagate slots to the memory manager and the per-model limiters.
    pub fn set_on_adjusted(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.on_adjusted.lock() = Some(Box::new(cb));
    }

    /// True if this job type currently has a free global slot.
    pub fn has_capacity(&self, job_type: &JobTypeId) -> bool {
        self.types.get(job_type).is_some_and(|s| s.in_flight < s.allocated_slots)
    }

    /// Atomically claim a global slot for this job type, if one is free.
    pub fn acquire(&self, job_type: &JobTypeId) -> bool {
        match self.types.get_mut(job_type) {
            Some(mut entry) if entry.in_flight < entry.allocated_slots => {
                entry.in_flight += 1;
                true
            }
            _ => false,
        }
    }

    /// Release a previously claimed global slot.
    pub fn release(&self, job_type: &JobTypeId) {
        if let Some(mut entry) = self.types.get_mut(job_type) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
        self.slot_notify.notify_waiters();
        if self.releases_since_adjustment.fetch_add(1, Ordering::SeqCst) + 1
            >= self.config.releases_per_adjustment
        {
            self.releases_since_adjustment.store(0, Ordering::SeqCst);
            self.notify.notify_one();
        }
    }

    /// True if (model, jobType) has a free per-model slot.
    pub fn has_model_capacity(&self, model_id: &ModelId, job_type: &JobTypeId) -> bool {
        self.model_slots
            .get(&(model_id.clone(), job_type.clone()))
            .is_some_and(|s| s.in_flight < s.allocated_slots)
    }

    /// Atomically claim a per-(model, jobType) slot, if one is free.
    pub fn acquire_model_slot(&self, model_id: &ModelId, job_type: &JobTypeId) -> bool {
        match self.model_slots.get_mut(&(model_id.clone(), job_type.clone())) {
            Some(mut entry) if entry.in_flight < entry.allocated_slots => {
                entry.in_flight += 1;
                true
            }
            _ => false,
        }
    }

    /// Release a previously claimed per-(model, jobType) slot.
    pub fn release_model_slot(&self, model_id: &ModelId, job_type: &JobTypeId) {
        if let Some(mut entry) = self.model_slots.get_mut(&(model_id.clone(), job_type.clone())) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }

    /// Distribute `total_slots` across job types by their current ratio,
    /// floored, with the remainder assigned to the largest fractional
    /// remainders so that `Σ allocated ≤ total_slots`.
    pub fn set_total_capacity(&self, total_slots: u64) {
        self.last_total_slots.store(total_slots, Ordering::SeqCst);

        let mut shares: Vec<(JobTypeId, u64, f64)> = self
            .types
            .iter()
            .map(|e| {
                let exact = total_slots as f64 * e.ratio;
                (e.key().clone(), exact.floor() as u64, exact.fract())
            })
            .collect();

        let floor_sum: u64 = shares.iter().map(|(_, floor, _)| *floor).sum();
        let mut remainder = total_slots.saturating_sub(floor_sum);

        shares.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        for (job_type, floor, _) in &mut shares {
            if remainder == 0 {
                break;
            }
            *floor += 1;
            remainder -= 1;
            let _ = job_type;
        }

        for (job_type, allocated, _) in shares {
            if let Some(mut entry) = self.types.get_mut(&job_type) {
                entry.allocated_slots = allocated;
            }
        }
    }

    /// Record a model's local memory pool (KB), used to intersect the
    /// per-(model, jobType) slot formula against the memory dimension.
    pub fn set_model_memory_pool(&self, model_id: &ModelId, pool_kb: u64) {
        self.model_memory_kb.insert(model_id.clone(), pool_kb);
        if let Some(pool) = self.model_pools.get(model_id).map(|p| *p) {
            self.recompute_model_slots(model_id, &pool);
        }
    }

    /// Receive a model's per-instance pool (from component I) and recompute
    /// every (model, jobType) slot count from the §4.9 formula.
    pub fn set_model_pool(&self, model_id: &ModelId, pool: Pool) {
        self.model_pools.insert(model_id.clone(), pool);
        self.recompute_model_slots(model_id, &pool);
    }

    fn recompute_model_slots(&self, model_id: &ModelId, pool: &Pool) {
        let memory_kb = self.model_memory_kb.get(model_id).map(|kb| *kb);
        for entry in self.types.iter() {
            let job_type = entry.key().clone();
            let slots = model_slot_formula(pool, entry.ratio, &entry.estimate, memory_kb);
            self.model_slots
                .entry((model_id.clone(), job_type))
                .and_modify(|s| s.allocated_slots = slots)
                .or_insert(ModelSlotState {
                    allocated_slots: slots,
                    in_flight: 0,
                });
        }
    }

    /// Current `(jobTypeId, ratio)` pairs, for propagation to the memory
    /// manager's sub-pool sizing.
    pub fn ratios(&self) -> Vec<(JobTypeId, f64)> {
        self.types.iter().map(|e| (e.key().clone(), e.ratio)).collect()
    }

    /// Run one adjustment pass: moves ratio from overloaded flexible donors
    /// to underloaded flexible recipients... the naming is backwards in
    /// common usage, so to be explicit: donors are *underloaded* (load below
    /// `low_load_threshold`) and give up ratio; recipients are *overloaded*
    /// (load above `high_load_threshold`) and receive it. Non-flexible types
    /// never participate. Returns `true` if any ratio actually changed.
    pub async fn adjust_ratios(&self) -> bool {
        let _guard = self.adjustment_lock.lock().await;

        let loads: Vec<(JobTypeId, f64, bool, f64)> = self
            .types
            .iter()
            .map(|e| {
                let load = e.in_flight as f64 / (e.allocated_slots.max(1) as f64);
                (e.key().clone(), e.ratio, e.flexible, load)
            })
            .collect();

        let donors: Vec<&(JobTypeId, f64, bool, f64)> = loads
            .iter()
            .filter(|(_, ratio, flexible, load)| {
                *flexible && *load < self.config.low_load_threshold && *ratio > self.config.min_ratio
            })
            .collect();
        let recipients: Vec<&(JobTypeId, f64, bool, f64)> = loads
            .iter()
            .filter(|(_, _, flexible, load)| *flexible && *load > self.config.high_load_threshold)
            .collect();

        if donors.is_empty() || recipients.is_empty() {
            return false;
        }

        let total_donatable: f64 = donors
            .iter()
            .map(|(_, ratio, _, _)| (ratio - self.config.min_ratio).max(0.0))
            .sum();
        let budget = self.config.max_adjustment.min(total_donatable);
        if budget <= 0.0 {
            return false;
        }

        let mut new_ratios: HashMap<JobTypeId, f64> =
            loads.iter().map(|(id, ratio, _, _)| (id.clone(), *ratio)).collect();

        for (id, ratio, _, _) in &donors {
            let spare = (ratio - self.config.min_ratio).max(0.0);
            let take = budget * (spare / total_donatable);
            *new_ratios.get_mut(id).expect("donor present") -= take;
        }
        let per_recipient = budget / recipients.len() as f64;
        for (id, _, _, _) in &recipients {
            *new_ratios.get_mut(id).expect("recipient present") += per_recipient;
        }

        for (job_type, ratio) in &new_ratios {
            if let Some(mut entry) = self.types.get_mut(job_type) {
                entry.ratio = *ratio;
            }
        }

        self.set_total_capacity(self.last_total_slots.load(Ordering::SeqCst));
        for entry in self.model_pools.iter() {
            let model_id = entry.key().clone();
            let pool = *entry.value();
            self.recompute_model_slots(&model_id, &pool);
        }

        if let Some(cb) = self.on_adjusted.lock().as_ref() {
            cb();
        }
        true
    }

    /// Start the periodic-or-release-triggered adjustment task.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.task.lock().await;
        if guard.is_some() {
            return;
        }
        let this = self.clone();
        let interval = Duration::from_millis(self.config.adjustment_interval_ms);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = this.notify.notified() => {}
                }
                this.adjust_ratios().await;
            }
        }));
    }

    /// Stop the periodic adjustment task.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}

fn model_slot_formula(
    pool: &Pool,
    ratio: f64,
    estimate: &ResourceEstimate,
    memory_pool_kb: Option<u64>,
) -> u64 {
    let dimension = |pool_value: u64, est: u64| -> f64 {
        if pool_value == 0 || est == 0 {
            f64::INFINITY
        } else {
            (pool_value as f64 * ratio / est as f64).floor()
        }
    };

    let s_tpm = dimension(pool.tokens_per_minute, estimate.estimated_tokens);
    let s_rpm = dimension(pool.requests_per_minute, estimate.estimated_requests);
    let s_tpd = dimension(pool.tokens_per_day, estimate.estimated_tokens);
    let s_rpd = dimension(pool.requests_per_day, estimate.estimated_requests);
    let s_concurrency = if pool.total_slots == 0 {
        f64::INFINITY
    } else {
        (pool.total_slots as f64 * ratio).floor()
    };

    let mut slots = [s_tpm, s_rpm, s_tpd, s_rpd, s_concurrency]
        .into_iter()
        .fold(f64::INFINITY, f64::min);

    if let (Some(memory_kb), true) = (memory_pool_kb, estimate.estimated_memory_kb > 0) {
        let s_memory = (memory_kb as f64 * ratio / estimate.estimated_memory_kb as f64).floor();
        slots = slots.min(s_memory);
    }

    if slots.is_finite() {
        slots.max(0.0) as u64
    } else {
        u64::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RatioConfig;

    fn job_types(entries: &[(&str, f64, bool)]) -> HashMap<JobTypeId, JobTypeConfig> {
        entries
            .iter()
            .map(|(id, ratio, flexible)| {
                (
                    id.to_string(),
                    JobTypeConfig {
                        estimate: ResourceEstimate {
                            estimated_tokens: 10_000,
                            estimated_requests: 1,
                            estimated_memory_kb: 0,
                        },
                        ratio: RatioConfig {
                            initial_value: *ratio,
                            flexible: *flexible,
                        },
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn acquire_respects_allocated_slots() {
        let manager = JobTypeManager::new(&job_types(&[("chat", 1.0, false)]), RatioAdjustmentConfig::default());
        manager.set_total_capacity(2);

        let jt = "chat".to_string();
        assert!(manager.acquire(&jt));
        assert!(manager.acquire(&jt));
        assert!(!manager.acquire(&jt));

        manager.release(&jt);
        assert!(manager.acquire(&jt));
    }

    #[tokio::test]
    async fn wait_for_capacity_wakes_on_release() {
        let manager = Arc::new(JobTypeManager::new(
            &job_types(&[("chat", 1.0, false)]),
            RatioAdjustmentConfig::default(),
        ));
        manager.set_total_capacity(1);
        let jt = "chat".to_string();
        assert!(manager.acquire(&jt));

        let waiter = {
            let manager = manager.clone();
            let jt = jt.clone();
            tokio::spawn(async move { manager.wait_for_capacity(&jt, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        manager.release(&jt);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn zero_wait_does_not_block_on_job_type_slot() {
        let manager = JobTypeManager::new(&job_types(&[("chat", 1.0, false)]), RatioAdjustmentConfig::default());
        manager.set_total_capacity(0);
        assert!(!manager.wait_for_capacity(&"chat".to_string(), Duration::ZERO).await);
    }

    #[tokio::test]
    async fn set_total_capacity_uses_largest_remainder() {
        let manager = JobTypeManager::new(
            &job_types(&[("a", 1.0 / 3.0, false), ("b", 1.0 / 3.0, false), ("c", 1.0 / 3.0, false)]),
            RatioAdjustmentConfig::default(),
        );
        manager.set_total_capacity(10);

        let total: u64 = ["a", "b", "c"]
            .iter()
            .map(|id| manager.types.get(&id.to_string()).unwrap().allocated_slots)
            .sum();
        assert_eq!(total, 10, "largest-remainder distribution must not lose slots");
    }

    #[tokio::test]
    async fn model_slot_formula_matches_s5() {
        let manager = JobTypeManager::new(
            &HashMap::from([(
                "chat".to_string(),
                JobTypeConfig {
                    estimate: ResourceEstimate {
                        estimated_tokens: 10_000,
                        estimated_requests: 1,
                        estimated_memory_kb: 0,
                    },
                    ratio: RatioConfig {
                        initial_value: 0.5,
                        flexible: false,
                    },
                },
            )]),
            RatioAdjustmentConfig::default(),
        );
        let model_id = "m".to_string();
        manager.set_model_pool(
            &model_id,
            Pool {
                total_slots: 0,
                tokens_per_minute: 50_000,
                requests_per_minute: 25,
                tokens_per_day: 0,
                requests_per_day: 0,
            },
        );

        let slots = manager
            .model_slots
            .get(&(model_id, "chat".to_string()))
            .unwrap()
            .allocated_slots;
        assert_eq!(slots, 2, "min(floor(50000/10000*0.5), floor(25/1*0.5)) = min(2, 12) = 2");
    }

    #[tokio::test]
    async fn non_flexible_ratio_never_moves_under_adjustment() {
        let manager = JobTypeManager::new(
            &job_types(&[("pinned", 0.5, false), ("a", 0.3, true), ("b", 0.2, true)]),
            RatioAdjustmentConfig {
                high_load_threshold: 0.1,
                low_load_threshold: 0.9,
                max_adjustment: 1.0,
                min_ratio: 0.0,
                ..Default::default()
            },
        );
        manager.set_total_capacity(100);

        let a = "a".to_string();
        let b = "b".to_string();
        // Make "a" overloaded (load > high_load_threshold) and "b" underloaded.
        for _ in 0..30 {
            manager.acquire(&a);
        }
        for _ in 0..1 {
            manager.acquire(&b);
        }

        manager.adjust_ratios().await;

        assert_eq!(
            manager.types.get("pinned").unwrap().ratio,
            0.5,
            "non-flexible ratio must be preserved exactly"
        );
        let sum: f64 = manager.types.iter().map(|e| e.ratio).sum();
        assert!((sum - 1.0).abs() < 1e-9, "ratios must still sum to 1: {sum}");
    }
}
