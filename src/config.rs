//! Tagged configuration records.
//!
//! Collapses the inheritance-style model/job-type hierarchies of the source
//! design into plain structs, per the redesign note in the design document:
//! configuration is data, not behaviour.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::Backend;
use crate::memory::HostMemoryProbe;
use crate::observer::Observer;

/// Identifies a configured upstream model.
pub type ModelId = String;

/// Identifies a job type (a caller-chosen tag for a class of work).
pub type JobTypeId = String;

/// Per-million-token USD pricing for a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    /// USD per million input tokens.
    pub input: f64,
    /// USD per million cached input tokens.
    pub cached: f64,
    /// USD per million output tokens.
    pub output: f64,
}

/// The static limits configured for one model. Every field is optional; an
/// absent field means that dimension is unlimited for this model.
#[derive(Debug, Clone, Default)]
pub struct ModelLimits {
    /// Requests admitted per rolling minute.
    pub requests_per_minute: Option<u64>,
    /// Requests admitted per rolling day.
    pub requests_per_day: Option<u64>,
    /// Tokens admitted per rolling minute.
    pub tokens_per_minute: Option<u64>,
    /// Tokens admitted per rolling day.
    pub tokens_per_day: Option<u64>,
    /// Maximum number of concurrently in-flight requests.
    pub max_concurrent_requests: Option<u64>,
    /// Maximum memory (KB) this model's in-flight jobs may hold at once.
    pub max_memory_kb: Option<u64>,
    /// Pricing used for cost accounting.
    pub pricing: Option<Pricing>,
}

/// The estimated resource cost of one job of a given type, used to reserve
/// capacity before the real usage is known.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceEstimate {
    /// Estimated input+output tokens. Zero means "not pre-reserved".
    pub estimated_tokens: u64,
    /// Estimated request count (almost always 1). Zero means "not pre-reserved".
    pub estimated_requests: u64,
    /// Estimated memory in KB. Zero means "not pre-reserved".
    pub estimated_memory_kb: u64,
}

impl ResourceEstimate {
    /// True when both token and request estimates are zero: a "measure-only"
    /// job type that never blocks on time windows at reservation time.
    pub fn is_measure_only(&self) -> bool {
        self.estimated_tokens == 0 && self.estimated_requests == 0
    }
}

/// A job type's share configuration.
#[derive(Debug, Clone, Copy)]
pub struct RatioConfig {
    /// The initial share of total capacity, in `[0, 1]`.
    pub initial_value: f64,
    /// Whether the ratio adjuster may move this job type's share over time.
    /// Non-flexible ratios never change.
    pub flexible: bool,
}

impl Default for RatioConfig {
    fn default() -> Self {
        Self {
            initial_value: 0.0,
            flexible: true,
        }
    }
}

/// Static configuration for one job type.
#[derive(Debug, Clone)]
pub struct JobTypeConfig {
    /// The estimate used to reserve capacity for jobs of this type.
    pub estimate: ResourceEstimate,
    /// This job type's share configuration.
    pub ratio: RatioConfig,
}

/// Tunables for [`crate::job_type::JobTypeManager::adjust_ratios`].
#[derive(Debug, Clone, Copy)]
pub struct RatioAdjustmentConfig {
    /// How often `adjust_ratios` runs on a timer.
    pub adjustment_interval_ms: u64,
    /// Alternatively, run after this many releases (whichever comes first).
    pub releases_per_adjustment: u64,
    /// A flexible type above this `in_flight / allocated` load ratio is
    /// overloaded and may receive ratio from a donor.
    pub high_load_threshold: f64,
    /// A flexible type below this load ratio is a donation candidate (donor).
    pub low_load_threshold: f64,
    /// The maximum ratio that can move from donor(s) to recipient(s) in one adjustment.
    pub max_adjustment: f64,
    /// The floor below which a flexible type's ratio will not be pushed.
    pub min_ratio: f64,
}

impl Default for RatioAdjustmentConfig {
    fn default() -> Self {
        Self {
            adjustment_interval_ms: 1_000,
            releases_per_adjustment: 10,
            high_load_threshold: 0.8,
            low_load_threshold: 0.3,
            max_adjustment: 0.1,
            min_ratio: 0.05,
        }
    }
}

/// Tunables for the process-wide [`crate::memory::MemoryManager`].
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    /// The fraction of host free memory to make available to the pool.
    pub free_memory_ratio: f64,
    /// How often the pool size is recomputed from host free memory.
    pub recalculation_interval_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            free_memory_ratio: 0.5,
            recalculation_interval_ms: 1_000,
        }
    }
}

/// Top-level configuration for a [`crate::RateLimiter`].
#[derive(Clone, Default)]
pub struct RateLimiterConfig {
    /// The configured models, keyed by id.
    pub models: HashMap<ModelId, ModelLimits>,
    /// The order models are tried in, required when more than one model is configured.
    pub escalation_order: Option<Vec<ModelId>>,
    /// Per-job-type resource estimates and ratio configuration.
    pub job_types: HashMap<JobTypeId, JobTypeConfig>,
    /// Ratio adjustment tunables.
    pub ratio_adjustment: RatioAdjustmentConfig,
    /// Memory manager tunables.
    pub memory: MemoryConfig,
    /// An optional coupling to a centralized pool allocator.
    pub backend: Option<Arc<dyn Backend>>,
    /// The host-memory probe backing the memory manager. Defaults to reading
    /// `/proc/meminfo` (see [`crate::memory::ProcMemInfoProbe`]); tests
    /// substitute a [`crate::memory::FixedMemoryProbe`] for determinism.
    pub memory_probe: Option<Arc<dyn HostMemoryProbe>>,
    /// The `onLog`/`onOverage`/`onAvailableSlotsChange` callback set. Defaults
    /// to [`crate::observer::NoopObserver`] when absent.
    pub observer: Option<Arc<dyn Observer>>,
}

impl std::fmt::Debug for RateLimiterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterConfig")
            .field("models", &self.models)
            .field("escalation_order", &self.escalation_order)
            .field("job_types", &self.job_types)
            .field("ratio_adjustment", &self.ratio_adjustment)
            .field("memory", &self.memory)
            .field("backend", &self.backend.is_some())
            .field("memory_probe", &self.memory_probe.is_some())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl RateLimiterConfig {
    /// Start building a configuration with a single model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model's limits.
    pub fn with_model(mut self, id: impl Into<ModelId>, limits: ModelLimits) -> Self {
        self.models.insert(id.into(), limits);
        self
    }

    /// Set the escalation order (required for more than one model).
    pub fn with_escalation_order(mut self, order: Vec<ModelId>) -> Self {
        self.escalation_order = Some(order);
        self
    }

    /// Register a job type's estimate and ratio configuration.
    pub fn with_job_type(mut self, id: impl Into<JobTypeId>, config: JobTypeConfig) -> Self {
        self.job_types.insert(id.into(), config);
        self
    }

    /// Set the ratio adjustment tunables.
    pub fn with_ratio_adjustment(mut self, config: RatioAdjustmentConfig) -> Self {
        self.ratio_adjustment = config;
        self
    }

    /// Set the memory manager tunables.
    pub fn with_memory(mut self, config: MemoryConfig) -> Self {
        self.memory = config;
        self
    }

    /// Attach a centralized pool allocator backend.
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Substitute the host-memory probe, primarily for tests.
    pub fn with_memory_probe(mut self, probe: Arc<dyn HostMemoryProbe>) -> Self {
        self.memory_probe = Some(probe);
        self
    }

    /// Register an observer for `onLog`/`onOverage`/`onAvailableSlotsChange`.
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }
}
