//! Component K: the top-level `RateLimiter` facade.
//!
//! Ties F (job-type slots) and the escalation controller G into the
//! documented ordering: acquire a job-type slot, try models via G, always
//! release the job-type slot on every exit path. "In a finally" becomes a
//! scope guard here (grounded on the teacher's RAII `Token`/`TokenInner`
//! pair): [`JobTypeSlotGuard`] releases the slot on drop so every return path
//! out of [`RateLimiter::queue_job`], success, error, or task cancellation,
//! runs it exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::availability::AvailabilityTracker;
use crate::backend::{AllocationInfo, Backend, Pool};
use crate::config::{JobTypeConfig, JobTypeId, ModelId, RateLimiterConfig, ResourceEstimate};
use crate::controller::{BoxedJobFn, JobResult, MultiModelController};
use crate::error::{ConfigError, LimiterError};
use crate::job_type::JobTypeManager;
use crate::memory::{HostMemoryProbe, MemoryManager, ProcMemInfoProbe};
use crate::model_limiter::{ModelLimiter, ModelStats};
use crate::observer::{Availability, NoopObserver, NotifyReason, Observer};

const UNBOUNDED_CONCURRENCY: u64 = 1_000_000;
const RATIO_EPSILON: f64 = 1e-9;

/// One job submitted to [`RateLimiter::queue_job`].
pub struct JobSpec {
    /// Caller-chosen id, surfaced in errors and introspection.
    pub job_id: String,
    /// The configured job type this job runs as.
    pub job_type: JobTypeId,
    /// The job body, invoked once per model attempted.
    pub job: BoxedJobFn,
    /// Per-model wait budgets; a model absent from this map gets
    /// `Duration::ZERO` (no queueing), matching `maxWaitMsByModel` defaulting
    /// to 0.
    pub max_wait_by_model: HashMap<ModelId, Duration>,
}

impl JobSpec {
    /// Build a spec with no per-model wait budgets configured (every model is
    /// tried with a single non-blocking attempt).
    pub fn new(job_id: impl Into<String>, job_type: impl Into<JobTypeId>, job: BoxedJobFn) -> Self {
        Self {
            job_id: job_id.into(),
            job_type: job_type.into(),
            job,
            max_wait_by_model: HashMap::new(),
        }
    }

    /// Build a spec with a fresh random job id, for callers with no natural
    /// id of their own to carry through (error messages and `active_jobs()`
    /// still need something to name the job by).
    pub fn with_random_id(job_type: impl Into<JobTypeId>, job: BoxedJobFn) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), job_type, job)
    }

    /// Set the wait budget for one model.
    pub fn with_max_wait(mut self, model_id: impl Into<ModelId>, wait: Duration) -> Self {
        self.max_wait_by_model.insert(model_id.into(), wait);
        self
    }
}

/// A currently in-flight job, for introspection.
#[derive(Debug, Clone)]
pub struct ActiveJobInfo {
    /// The job's id.
    pub job_id: String,
    /// The job's configured type.
    pub job_type: JobTypeId,
}

/// An aggregate introspection snapshot.
#[derive(Debug, Clone, Default)]
pub struct LimiterStats {
    /// Per-model snapshots.
    pub models: HashMap<ModelId, ModelStats>,
    /// The current process-wide memory pool size, in KB.
    pub memory_total_kb: u64,
}

struct JobTypeSlotGuard<'a> {
    job_types: &'a JobTypeManager,
    job_type: &'a JobTypeId,
}

impl Drop for JobTypeSlotGuard<'_> {
    fn drop(&mut self) {
        self.job_types.release(self.job_type);
    }
}

/// The top-level facade: owns every component and exposes the public job
/// surface and introspection described in §6.
pub struct RateLimiter {
    models: HashMap<ModelId, Arc<ModelLimiter>>,
    job_type_configs: HashMap<JobTypeId, JobTypeConfig>,
    job_types: Arc<JobTypeManager>,
    memory: Arc<MemoryManager>,
    availability: AvailabilityTracker,
    controller: MultiModelController,
    backend: Option<Arc<dyn Backend>>,
    instance_id: String,
    observer: Arc<dyn Observer>,
    active_jobs: DashMap<String, JobTypeId>,
    allocation: parking_lot::Mutex<Option<AllocationInfo>>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Validate `config` and assemble every component. Mirrors "configuration
    /// errors are thrown synchronously from the constructor" (§7).
    pub fn new(config: RateLimiterConfig) -> Result<Self, ConfigError> {
        if config.models.is_empty() {
            return Err(ConfigError::EmptyModels);
        }
        let escalation_order = resolve_escalation_order(&config)?;
        validate_estimates(&config.models, &config.job_types)?;
        let job_type_configs = normalize_ratios(&config.job_types)?;

        let memory_probe = config
            .memory_probe
            .clone()
            .unwrap_or_else(|| Arc::new(ProcMemInfoProbe) as Arc<dyn HostMemoryProbe>);
        let memory = MemoryManager::new(config.memory, memory_probe);

        let job_types = JobTypeManager::new(&job_type_configs, config.ratio_adjustment);
        memory.set_job_type_ratios(&job_types.ratios());

        let mut models = HashMap::new();
        let mut pricing = HashMap::new();
        let mut total_concurrency = Some(0u64);
        for (model_id, limits) in &config.models {
            let limiter = Arc::new(ModelLimiter::new(model_id.clone(), limits, Some(memory.clone())));
            models.insert(model_id.clone(), limiter);

            if let Some(p) = limits.pricing {
                pricing.insert(model_id.clone(), p);
            }

            total_concurrency = match (total_concurrency, limits.max_concurrent_requests) {
                (Some(acc), Some(n)) => Some(acc.saturating_add(n)),
                _ => None,
            };

            // Synthesize a local, single-instance pool so per-(model, jobType)
            // slots exist even without a backend; a real backend's first
            // published allocation overwrites this via `apply_allocation`.
            let pool = Pool {
                total_slots: limits.max_concurrent_requests.unwrap_or(0),
                tokens_per_minute: limits.tokens_per_minute.unwrap_or(0),
                requests_per_minute: limits.requests_per_minute.unwrap_or(0),
                tokens_per_day: limits.tokens_per_day.unwrap_or(0),
                requests_per_day: limits.requests_per_day.unwrap_or(0),
            };
            job_types.set_model_pool(model_id, pool);
            if let Some(memory_kb) = limits.max_memory_kb {
                job_types.set_model_memory_pool(model_id, memory_kb);
            }
        }
        job_types.set_total_capacity(total_concurrency.unwrap_or(UNBOUNDED_CONCURRENCY));

        let instance_id = generate_instance_id();
        let backend = config.backend.clone();
        let controller = MultiModelController::new(
            models.clone(),
            escalation_order,
            pricing,
            backend.clone().map(|b| (b, instance_id.clone())),
        );

        Ok(Self {
            models,
            job_type_configs,
            job_types,
            memory,
            availability: AvailabilityTracker::new(),
            controller,
            backend,
            instance_id,
            observer: config.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
            active_jobs: DashMap::new(),
            allocation: parking_lot::Mutex::new(None),
            tasks: AsyncMutex::new(Vec::new()),
        })
    }

    /// Start every background task: memory recalculation, ratio adjustment,
    /// and (if configured) backend registration and allocation subscription.
    pub async fn start(self: &Arc<Self>) {
        {
            // A strong `Arc<RateLimiter>` captured here would leak: `self.job_types`
            // (owned by `RateLimiter`) would hold a closure holding `self` right back.
            let weak = Arc::downgrade(self);
            self.job_types.set_on_adjusted(move || {
                let Some(this) = weak.upgrade() else { return };
                this.memory.set_job_type_ratios(&this.job_types.ratios());
                for (model_id, limiter) in &this.models {
                    let stats = limiter.stats();
                    let remaining = stats.concurrency.map(|(in_use, max)| max.saturating_sub(in_use)).unwrap_or(0);
                    this.availability.report(
                        this.observer.as_ref(),
                        model_id,
                        NotifyReason::Adjustment,
                        Availability { remaining, slots: remaining },
                    );
                    this.report_model_availability(model_id, &stats);
                }
            });
        }

        self.memory.start().await;
        self.job_types.start().await;

        for (model_id, limiter) in &self.models {
            limiter.start().await;
            self.report_model_availability(model_id, &limiter.stats());
        }

        let Some(backend) = self.backend.clone() else {
            return;
        };

        if let Ok(allocation) = backend.register(&self.instance_id).await {
            self.apply_allocation(&allocation).await;
        } else {
            tracing::warn!(instance = %self.instance_id, "backend registration failed");
        }

        if let Ok(mut rx) = backend.subscribe(&self.instance_id).await {
            let this = self.clone();
            let handle = tokio::spawn(async move {
                while let Ok(allocation) = rx.recv().await {
                    this.apply_allocation(&allocation).await;
                }
            });
            self.tasks.lock().await.push(handle);
        }
    }

    /// Stop every background task owned by this limiter and its components.
    pub async fn stop(&self) {
        self.memory.stop().await;
        self.job_types.stop().await;
        for limiter in self.models.values() {
            limiter.stop().await;
        }
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        if let Some(backend) = &self.backend {
            if let Err(err) = backend.unregister(&self.instance_id).await {
                tracing::warn!(instance = %self.instance_id, error = %err, "backend unregister failed");
            }
        }
    }

    async fn apply_allocation(&self, allocation: &AllocationInfo) {
        *self.allocation.lock() = Some(allocation.clone());

        let mut total_slots = 0u64;
        for (model_id, pool) in &allocation.pools {
            if let Some(limiter) = self.models.get(model_id) {
                limiter.set_rate_limits(Some(pool.tokens_per_minute), Some(pool.requests_per_minute));
                limiter.set_max_concurrency(pool.total_slots);
            }
            self.job_types.set_model_pool(model_id, *pool);
            total_slots = total_slots.saturating_add(pool.total_slots);

            self.availability.report(
                self.observer.as_ref(),
                model_id,
                NotifyReason::Distributed,
                Availability {
                    remaining: allocation.instance_count,
                    slots: pool.total_slots,
                },
            );
        }
        self.job_types.set_total_capacity(total_slots);

        for (model_id, limiter) in &self.models {
            for (job_type_id, cfg) in &self.job_type_configs {
                limiter.notify_capacity_available(job_type_id, cfg.estimate).await;
            }
            self.report_model_availability(model_id, &limiter.stats());
        }
    }

    /// The estimate used for H's derived-slots computation: the mean of every
    /// configured job type's token/request estimate, since H reports per
    /// model rather than per (model, jobType).
    fn representative_estimate(&self) -> ResourceEstimate {
        if self.job_type_configs.is_empty() {
            return ResourceEstimate::default();
        }
        let n = self.job_type_configs.len() as u64;
        let (tokens, requests) = self
            .job_type_configs
            .values()
            .fold((0u64, 0u64), |(t, r), cfg| (t + cfg.estimate.estimated_tokens, r + cfg.estimate.estimated_requests));
        ResourceEstimate {
            estimated_tokens: tokens / n,
            estimated_requests: requests / n,
            estimated_memory_kb: 0,
        }
    }

    /// Component H: turn one model's raw window/concurrency stats into
    /// change-only `on_available_slots_change` notifications, then a derived
    /// overall slots figure across every active dimension.
    fn report_model_availability(&self, model_id: &ModelId, stats: &ModelStats) {
        let estimate = self.representative_estimate();
        let mut dims: Vec<(u64, u64)> = Vec::new();

        let mut report_window = |reason: NotifyReason, window: &Option<crate::time_window::WindowStats>, per_unit: u64| {
            let Some(w) = window else { return };
            dims.push((w.remaining, per_unit));
            self.availability.report(
                self.observer.as_ref(),
                model_id,
                reason,
                Availability {
                    remaining: w.remaining,
                    slots: if per_unit > 0 { w.remaining / per_unit } else { u64::MAX },
                },
            );
        };
        report_window(NotifyReason::TokensMinute, &stats.tokens_per_minute, estimate.estimated_tokens);
        report_window(NotifyReason::TokensDay, &stats.tokens_per_day, estimate.estimated_tokens);
        report_window(NotifyReason::RequestsMinute, &stats.requests_per_minute, estimate.estimated_requests);
        report_window(NotifyReason::RequestsDay, &stats.requests_per_day, estimate.estimated_requests);

        if let Some((in_use, max)) = stats.concurrency {
            let remaining = max.saturating_sub(in_use);
            dims.push((remaining, 1));
            self.availability.report(
                self.observer.as_ref(),
                model_id,
                NotifyReason::Concurrency,
                Availability { remaining, slots: remaining },
            );
        }

        if let Some((in_use, max)) = stats.memory_kb {
            let remaining = max.saturating_sub(in_use);
            if estimate.estimated_memory_kb > 0 {
                dims.push((remaining, estimate.estimated_memory_kb));
            }
            self.availability.report(
                self.observer.as_ref(),
                model_id,
                NotifyReason::Memory,
                Availability {
                    remaining,
                    slots: if estimate.estimated_memory_kb > 0 {
                        remaining / estimate.estimated_memory_kb
                    } else {
                        u64::MAX
                    },
                },
            );
        }

        let slots = AvailabilityTracker::derived_slots(&dims);
        self.availability.report(
            self.observer.as_ref(),
            model_id,
            NotifyReason::Slots,
            Availability { remaining: slots, slots },
        );
    }

    /// Run one job through F then G, always releasing the job-type slot.
    pub async fn queue_job(&self, spec: JobSpec) -> Result<JobResult, LimiterError> {
        let JobSpec {
            job_id,
            job_type,
            job,
            max_wait_by_model,
        } = spec;

        let Some(cfg) = self.job_type_configs.get(&job_type) else {
            return Err(LimiterError::UnknownJobType {
                job_id,
                job_type_id: job_type,
            });
        };
        let estimate = cfg.estimate;

        self.active_jobs.insert(job_id.clone(), job_type.clone());
        struct ActiveJobGuard<'a> {
            active_jobs: &'a DashMap<String, JobTypeId>,
            job_id: &'a str,
        }
        impl Drop for ActiveJobGuard<'_> {
            fn drop(&mut self) {
                self.active_jobs.remove(self.job_id);
            }
        }
        let _active_guard = ActiveJobGuard {
            active_jobs: &self.active_jobs,
            job_id: &job_id,
        };

        self.job_types.acquire_blocking(&job_type).await;
        let _slot_guard = JobTypeSlotGuard {
            job_types: &self.job_types,
            job_type: &job_type,
        };

        self.controller
            .run_job(
                &self.job_types,
                &job_type,
                estimate,
                &job_id,
                job,
                &max_wait_by_model,
                self.observer.as_ref(),
            )
            .await
    }

    /// An aggregate snapshot across every configured model.
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            models: self.models.iter().map(|(id, m)| (id.clone(), m.stats())).collect(),
            memory_total_kb: self.memory.total_kb(),
        }
    }

    /// One model's snapshot, if configured.
    pub fn model_stats(&self, model_id: &ModelId) -> Option<ModelStats> {
        self.models.get(model_id).map(|m| m.stats())
    }

    /// True if any configured model currently has room for one more
    /// reservation at its default (rounded-up) estimate.
    pub fn has_capacity(&self) -> bool {
        self.models
            .values()
            .any(|m| m.has_capacity(ResourceEstimate::default()))
    }

    /// True if the named model currently has room for one more reservation.
    pub fn has_capacity_for_model(&self, model_id: &ModelId) -> bool {
        self.models
            .get(model_id)
            .is_some_and(|m| m.has_capacity(crate::config::ResourceEstimate::default()))
    }

    /// True if the named job type currently has a free global slot.
    pub fn has_capacity_for_job_type(&self, job_type_id: &JobTypeId) -> bool {
        self.job_types.has_capacity(job_type_id)
    }

    /// Every job currently between `queue_job` entry and exit.
    pub fn active_jobs(&self) -> Vec<ActiveJobInfo> {
        self.active_jobs
            .iter()
            .map(|entry| ActiveJobInfo {
                job_id: entry.key().clone(),
                job_type: entry.value().clone(),
            })
            .collect()
    }

    /// The most recently published distributed allocation, if a backend is
    /// configured and has published at least once.
    pub fn allocation(&self) -> Option<AllocationInfo> {
        self.allocation.lock().clone()
    }

    /// This process's instance id (`inst-<epochMs>-<9 base36 chars>`).
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

fn resolve_escalation_order(config: &RateLimiterConfig) -> Result<Vec<ModelId>, ConfigError> {
    match &config.escalation_order {
        Some(order) => {
            for model_id in order {
                if !config.models.contains_key(model_id) {
                    return Err(ConfigError::UnknownEscalationModel {
                        model_id: model_id.clone(),
                    });
                }
            }
            Ok(order.clone())
        }
        None if config.models.len() == 1 => Ok(config.models.keys().cloned().collect()),
        None => Err(ConfigError::MissingEscalationOrder),
    }
}

/// A job type must carry an estimate for every dimension some configured
/// model actually rate-limits, or its reservations would silently skip that
/// dimension's accounting (measure-only is only valid when *both* tokens and
/// requests are zero, per §4.D's estimate-zero policy: declaring one but not
/// the other is the unintended configuration this guards against).
fn validate_estimates(
    models: &HashMap<ModelId, crate::config::ModelLimits>,
    job_types: &HashMap<JobTypeId, JobTypeConfig>,
) -> Result<(), ConfigError> {
    let any_token_limit = models.values().any(|m| m.tokens_per_minute.is_some() || m.tokens_per_day.is_some());
    let any_request_limit = models
        .values()
        .any(|m| m.requests_per_minute.is_some() || m.requests_per_day.is_some());

    for (job_type_id, cfg) in job_types {
        let has_tokens = cfg.estimate.estimated_tokens > 0;
        let has_requests = cfg.estimate.estimated_requests > 0;
        if any_token_limit && has_requests && !has_tokens {
            return Err(ConfigError::MissingEstimateForDimension {
                job_type_id: job_type_id.clone(),
                dimension: "tokens",
            });
        }
        if any_request_limit && has_tokens && !has_requests {
            return Err(ConfigError::MissingEstimateForDimension {
                job_type_id: job_type_id.clone(),
                dimension: "requests",
            });
        }
    }
    Ok(())
}

/// Normalizes flexible ratios so `Σ ratio == 1` (invariant 2), since
/// [`crate::config::RatioConfig::default`] leaves `initial_value` at zero and
/// it is easy to configure job types whose declared ratios don't already sum
/// to exactly 1. Non-flexible ratios are never touched. Flexible job types
/// split the remaining share proportionally to their declared values, or
/// equally if none declared one.
fn normalize_ratios(
    job_types: &HashMap<JobTypeId, JobTypeConfig>,
) -> Result<HashMap<JobTypeId, JobTypeConfig>, ConfigError> {
    let non_flexible_sum: f64 = job_types
        .values()
        .filter(|cfg| !cfg.ratio.flexible)
        .map(|cfg| cfg.ratio.initial_value)
        .sum();
    if non_flexible_sum > 1.0 + RATIO_EPSILON {
        return Err(ConfigError::NonFlexibleRatiosExceedOne { sum: non_flexible_sum });
    }

    let flexible_ids: Vec<JobTypeId> = job_types
        .iter()
        .filter(|(_, cfg)| cfg.ratio.flexible)
        .map(|(id, _)| id.clone())
        .collect();

    let mut normalized = job_types.clone();

    if flexible_ids.is_empty() {
        let total: f64 = job_types.values().map(|cfg| cfg.ratio.initial_value).sum();
        if (total - 1.0).abs() > RATIO_EPSILON {
            return Err(ConfigError::RatiosDoNotSumToOne { sum: total });
        }
        return Ok(normalized);
    }

    let remaining = (1.0 - non_flexible_sum).max(0.0);
    let declared_flexible_sum: f64 = flexible_ids
        .iter()
        .map(|id| job_types[id].ratio.initial_value)
        .sum();

    if declared_flexible_sum > RATIO_EPSILON {
        for id in &flexible_ids {
            let share = job_types[id].ratio.initial_value / declared_flexible_sum;
            normalized.get_mut(id).expect("id came from this map").ratio.initial_value = remaining * share;
        }
    } else {
        let equal_share = remaining / flexible_ids.len() as f64;
        for id in &flexible_ids {
            normalized.get_mut(id).expect("id came from this map").ratio.initial_value = equal_share;
        }
    }

    Ok(normalized)
}

fn generate_instance_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let epoch_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char).collect();
    format!("inst-{epoch_ms}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobTypeConfig, ModelLimits, RatioConfig, ResourceEstimate};
    use crate::controller::{JobContext, JobOutcome, Usage};
    use crate::memory::FixedMemoryProbe;

    fn ok_job() -> BoxedJobFn {
        Arc::new(|ctx: JobContext| {
            Box::pin(async move {
                Ok(JobOutcome {
                    text: Some(format!("ran on {}", ctx.model_id)),
                    request_count: 1,
                    usage: Usage {
                        input: 5,
                        output: 5,
                        cached: 0,
                    },
                })
            })
        })
    }

    fn base_config() -> RateLimiterConfig {
        RateLimiterConfig::new()
            .with_model(
                "m",
                ModelLimits {
                    max_concurrent_requests: Some(2),
                    ..Default::default()
                },
            )
            .with_job_type(
                "chat",
                JobTypeConfig {
                    estimate: ResourceEstimate::default(),
                    ratio: RatioConfig {
                        initial_value: 1.0,
                        flexible: false,
                    },
                },
            )
            .with_memory_probe(Arc::new(FixedMemoryProbe(0)))
    }

    #[test]
    fn empty_models_is_rejected() {
        let err = RateLimiter::new(RateLimiterConfig::new()).unwrap_err();
        assert_eq!(err, ConfigError::EmptyModels);
    }

    #[test]
    fn missing_escalation_order_is_rejected_for_multiple_models() {
        let config = base_config().with_model("n", ModelLimits::default());
        let err = RateLimiter::new(config).unwrap_err();
        assert_eq!(err, ConfigError::MissingEscalationOrder);
    }

    #[test]
    fn unknown_escalation_model_is_rejected() {
        let config = base_config().with_escalation_order(vec!["nope".to_string()]);
        let err = RateLimiter::new(config).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownEscalationModel {
                model_id: "nope".to_string()
            }
        );
    }

    #[test]
    fn single_non_flexible_ratio_of_one_is_accepted() {
        let limiter = RateLimiter::new(base_config()).unwrap();
        assert!(limiter.has_capacity_for_job_type(&"chat".to_string()));
    }

    #[test]
    fn non_flexible_ratios_exceeding_one_are_rejected() {
        let config = RateLimiterConfig::new()
            .with_model("m", ModelLimits::default())
            .with_job_type(
                "a",
                JobTypeConfig {
                    estimate: ResourceEstimate::default(),
                    ratio: RatioConfig {
                        initial_value: 0.7,
                        flexible: false,
                    },
                },
            )
            .with_job_type(
                "b",
                JobTypeConfig {
                    estimate: ResourceEstimate::default(),
                    ratio: RatioConfig {
                        initial_value: 0.6,
                        flexible: false,
                    },
                },
            );
        let err = RateLimiter::new(config).unwrap_err();
        assert!(matches!(err, ConfigError::NonFlexibleRatiosExceedOne { .. }));
    }

    #[test]
    fn flexible_default_ratios_split_remaining_share_equally() {
        let config = RateLimiterConfig::new()
            .with_model("m", ModelLimits::default())
            .with_job_type(
                "pinned",
                JobTypeConfig {
                    estimate: ResourceEstimate::default(),
                    ratio: RatioConfig {
                        initial_value: 0.2,
                        flexible: false,
                    },
                },
            )
            .with_job_type(
                "a",
                JobTypeConfig {
                    estimate: ResourceEstimate::default(),
                    ratio: RatioConfig::default(),
                },
            )
            .with_job_type(
                "b",
                JobTypeConfig {
                    estimate: ResourceEstimate::default(),
                    ratio: RatioConfig::default(),
                },
            );
        let job_type_configs = normalize_ratios(&config.job_types).unwrap();
        assert!((job_type_configs["a"].ratio.initial_value - 0.4).abs() < 1e-9);
        assert!((job_type_configs["b"].ratio.initial_value - 0.4).abs() < 1e-9);
    }

    #[test]
    fn missing_estimate_for_token_dimension_is_rejected() {
        let config = RateLimiterConfig::new()
            .with_model(
                "m",
                ModelLimits {
                    tokens_per_minute: Some(1_000),
                    ..Default::default()
                },
            )
            .with_job_type(
                "chat",
                JobTypeConfig {
                    estimate: ResourceEstimate {
                        estimated_tokens: 0,
                        estimated_requests: 1,
                        estimated_memory_kb: 0,
                    },
                    ratio: RatioConfig {
                        initial_value: 1.0,
                        flexible: false,
                    },
                },
            );
        let err = RateLimiter::new(config).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingEstimateForDimension { dimension: "tokens", .. }
        ));
    }

    #[tokio::test]
    async fn queue_job_runs_and_releases_job_type_slot() {
        let limiter = RateLimiter::new(base_config()).unwrap();
        let spec = JobSpec::new("job-1", "chat", ok_job());

        let result = limiter.queue_job(spec).await.unwrap();
        assert_eq!(result.model_used, "m");
        assert!(limiter.active_jobs().is_empty());
        assert!(limiter.has_capacity_for_job_type(&"chat".to_string()));
    }

    #[tokio::test]
    async fn queue_job_rejects_unknown_job_type() {
        let limiter = RateLimiter::new(base_config()).unwrap();
        let spec = JobSpec::new("job-2", "unknown", ok_job());

        let err = limiter.queue_job(spec).await.unwrap_err();
        assert!(matches!(err, LimiterError::UnknownJobType { .. }));
    }

    #[test]
    fn instance_id_matches_documented_format() {
        let id = generate_instance_id();
        assert!(id.starts_with("inst-"));
        let rest = &id["inst-".len()..];
        let mut parts = rest.splitn(2, '-');
        let epoch = parts.next().unwrap();
        let suffix = parts.next().unwrap();
        assert!(epoch.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(suffix.len(), 9);
    }

    #[tokio::test]
    async fn with_random_id_generates_a_distinct_id_per_spec() {
        let limiter = RateLimiter::new(base_config()).unwrap();
        let a = JobSpec::with_random_id("chat", ok_job());
        let b = JobSpec::with_random_id("chat", ok_job());
        assert_ne!(a.job_id, b.job_id);

        let result = limiter.queue_job(a).await.unwrap();
        assert_eq!(result.model_used, "m");
    }
}
