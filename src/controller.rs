//! Component G: tries a job against each configured model in escalation
//! order, delegating to the next model on a non-fatal rejection.
//!
//! The source design passes `jobFn` a `(context, resolve, reject)` triple and
//! relies on delegation re-invoking the same callback against the next
//! model. Modeling that faithfully as `FnOnce` (as first drafted in the
//! design document) breaks down the moment a job delegates, since the
//! closure would already be consumed by the first model's attempt. `job` is
//! therefore an `Arc<dyn Fn(...) -> BoxFuture<...>>`, callable once per
//! escalation attempt rather than once per `queue_job` call. The rest of
//! the "exception-based control becomes an explicit enum" redesign note
//! still holds: `Ok(JobOutcome)` is `resolve`, `Err(JobRejection)` is
//! `reject`.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use tokio::time::Duration;

use crate::backend::{Backend, BackendContext, BackendUsage};
use crate::config::{JobTypeId, ModelId, Pricing};
use crate::error::LimiterError;
use crate::job_type::JobTypeManager;
use crate::model_limiter::{ActualUsage, ModelLimiter};
use crate::observer::Observer;

/// A boxed, `'static` future, matching the shape of the job closures'
/// return type without pulling in the `futures` crate for one alias.
pub type BoxFuture<T> = Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// What a job closure receives for the model it is currently being attempted
/// against.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The model this attempt is running against.
    pub model_id: ModelId,
}

/// Token usage for one model attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Input tokens.
    pub input: u64,
    /// Output tokens.
    pub output: u64,
    /// Cached input tokens (billed at `pricing.cached`, not reserved against
    /// the token-window dimensions).
    pub cached: u64,
}

impl Usage {
    /// Tokens counted against the time-window dimensions: input + output.
    /// Cached tokens are a billing concept, not a throughput one.
    fn rate_limited_tokens(&self) -> u64 {
        self.input.saturating_add(self.output)
    }
}

/// A successful job attempt.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Free-form textual result, if the job produced one.
    pub text: Option<String>,
    /// Number of outgoing requests this attempt made (usually 1).
    pub request_count: u64,
    /// Actual token usage for this attempt.
    pub usage: Usage,
}

/// A job attempt's rejection. `delegate: true` moves on to the next model in
/// escalation order without surfacing an error to the caller; `delegate:
/// false` (or no explicit rejection at all, a thrown/returned error) fails
/// the whole job.
#[derive(Debug, Default)]
pub struct JobRejection {
    /// Partial usage incurred before the rejection, if any, recorded for
    /// cost accounting even though the attempt did not complete.
    pub usage: Option<Usage>,
    /// Whether the controller should try the next model in escalation order.
    pub delegate: bool,
    /// The underlying cause, surfaced in [`LimiterError::JobFailed`] when
    /// `delegate` is false.
    pub error: Option<Box<dyn StdError + Send + Sync>>,
}

/// One job's per-model usage, kept in attempt order for cost accounting.
#[derive(Debug, Clone)]
pub struct UsageEntry {
    /// Which model this usage was incurred against.
    pub model_id: ModelId,
    /// The usage itself.
    pub usage: Usage,
    /// `(input*pricing.input + cached*pricing.cached + output*pricing.output) / 1_000_000`,
    /// zero if the model has no configured pricing.
    pub cost: f64,
}

/// The result of a successfully completed job.
#[derive(Debug, Clone)]
pub struct JobResult {
    /// The winning model's textual output, if any.
    pub text: Option<String>,
    /// The model the job ultimately completed on.
    pub model_used: ModelId,
    /// Usage entries in the order models were attempted.
    pub usage: Vec<UsageEntry>,
    /// Sum of every usage entry's cost.
    pub total_cost: f64,
}

/// A job closure: given the model it's being attempted against, runs the
/// underlying call and returns success or a typed rejection. May be invoked
/// more than once across a single `queue_job` call: once per model that
/// reserves capacity and is given a chance to run it.
pub type BoxedJobFn = Arc<dyn Fn(JobContext) -> BoxFuture<Result<JobOutcome, JobRejection>> + Send + Sync>;

#[derive(Debug)]
struct DelegationDeclinedError;

impl fmt::Display for DelegationDeclinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job rejected without delegation and no underlying error supplied")
    }
}

impl StdError for DelegationDeclinedError {}

/// Component G. Owns every configured model's [`ModelLimiter`] (component D)
/// and the escalation order to try them in.
pub struct MultiModelController {
    models: HashMap<ModelId, Arc<ModelLimiter>>,
    escalation_order: Vec<ModelId>,
    pricing: HashMap<ModelId, Pricing>,
    backend: Option<(Arc<dyn Backend>, String)>,
}

impl MultiModelController {
    /// Build the controller from its per-model limiters and escalation order.
    /// `backend` is `Some((backend, instance_id))` when component I's
    /// optional acquire/release pass-through is configured.
    pub fn new(
        models: HashMap<ModelId, Arc<ModelLimiter>>,
        escalation_order: Vec<ModelId>,
        pricing: HashMap<ModelId, Pricing>,
        backend: Option<(Arc<dyn Backend>, String)>,
    ) -> Self {
        Self {
            models,
            escalation_order,
            pricing,
            backend,
        }
    }

    /// This controller's configured models, by id.
    pub fn models(&self) -> &HashMap<ModelId, Arc<ModelLimiter>> {
        &self.models
    }

    /// The order models are tried in.
    pub fn escalation_order(&self) -> &[ModelId] {
        &self.escalation_order
    }

    fn cost_of(&self, model_id: &ModelId, usage: &Usage) -> f64 {
        self.pricing
            .get(model_id)
            .map(|p| {
                (usage.input as f64 * p.input + usage.cached as f64 * p.cached + usage.output as f64 * p.output)
                    / 1_000_000.0
            })
            .unwrap_or(0.0)
    }

    /// Run one job through the escalation protocol (§4.G). `estimate` is the
    /// job type's resource estimate, used to reserve capacity on each model
    /// attempted. `max_wait_by_model` defaults to zero (no queueing) for any
    /// model not named.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_job(
        &self,
        job_types: &Arc<JobTypeManager>,
        job_type_id: &JobTypeId,
        estimate: crate::config::ResourceEstimate,
        job_id: &str,
        job: BoxedJobFn,
        max_wait_by_model: &HashMap<ModelId, Duration>,
        observer: &dyn Observer,
    ) -> Result<JobResult, LimiterError> {
        let mut usage_trail: Vec<UsageEntry> = Vec::new();
        let mut last_model: Option<ModelId> = None;

        for model_id in &self.escalation_order {
            let Some(limiter) = self.models.get(model_id) else {
                continue;
            };

            if !job_types.has_model_capacity(model_id, job_type_id) {
                continue;
            }

            let max_wait = max_wait_by_model.get(model_id).copied().unwrap_or(Duration::ZERO);
            let Some(ctx) = limiter
                .wait_for_capacity_with_timeout(job_type_id, estimate, max_wait)
                .await
            else {
                continue;
            };
            last_model = Some(model_id.clone());

            if !job_types.acquire_model_slot(model_id, job_type_id) {
                // Lost the race for the per-(model, jobType) slot after D already
                // reserved capacity; give it back and move on.
                limiter.release_reservation(ctx, observer).await;
                continue;
            }

            if let Some((backend, instance_id)) = &self.backend {
                let backend_ctx = BackendContext {
                    model_id: model_id.clone(),
                    estimated_tokens: estimate.estimated_tokens,
                    estimated_requests: estimate.estimated_requests,
                };
                match backend.acquire(instance_id, &backend_ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(model = %model_id, "backend denied reservation, trying next model");
                        job_types.release_model_slot(model_id, job_type_id);
                        limiter.release_reservation(ctx, observer).await;
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!(model = %model_id, error = %err, "backend acquire failed, treating as local denial");
                        job_types.release_model_slot(model_id, job_type_id);
                        limiter.release_reservation(ctx, observer).await;
                        continue;
                    }
                }
            }

            let outcome = job(JobContext { model_id: model_id.clone() }).await;
            job_types.release_model_slot(model_id, job_type_id);

            match outcome {
                Ok(result) => {
                    if let Some((backend, instance_id)) = &self.backend {
                        let backend_ctx = BackendContext {
                            model_id: model_id.clone(),
                            estimated_tokens: estimate.estimated_tokens,
                            estimated_requests: estimate.estimated_requests,
                        };
                        let usage = BackendUsage {
                            actual_tokens: result.usage.rate_limited_tokens(),
                            actual_requests: result.request_count,
                        };
                        if let Err(err) = backend.release(instance_id, &backend_ctx, usage).await {
                            tracing::warn!(model = %model_id, error = %err, "backend release failed, swallowing");
                        }
                    }

                    let actual = ActualUsage {
                        tokens: result.usage.rate_limited_tokens(),
                        requests: result.request_count,
                        memory_kb: 0,
                    };
                    limiter.release(ctx, actual, observer).await;

                    let cost = self.cost_of(model_id, &result.usage);
                    usage_trail.push(UsageEntry {
                        model_id: model_id.clone(),
                        usage: result.usage,
                        cost,
                    });
                    let total_cost = usage_trail.iter().map(|e| e.cost).sum();
                    return Ok(JobResult {
                        text: result.text,
                        model_used: model_id.clone(),
                        usage: usage_trail,
                        total_cost,
                    });
                }
                Err(rejection) => {
                    if let Some((backend, instance_id)) = &self.backend {
                        let backend_ctx = BackendContext {
                            model_id: model_id.clone(),
                            estimated_tokens: estimate.estimated_tokens,
                            estimated_requests: estimate.estimated_requests,
                        };
                        let usage = rejection
                            .usage
                            .map(|u| BackendUsage {
                                actual_tokens: u.rate_limited_tokens(),
                                actual_requests: 0,
                            })
                            .unwrap_or_default();
                        if let Err(err) = backend.release(instance_id, &backend_ctx, usage).await {
                            tracing::warn!(model = %model_id, error = %err, "backend release failed, swallowing");
                        }
                    }

                    if let Some(usage) = rejection.usage {
                        let cost = self.cost_of(model_id, &usage);
                        usage_trail.push(UsageEntry {
                            model_id: model_id.clone(),
                            usage,
                            cost,
                        });
                    }
                    limiter.release_reservation(ctx, observer).await;

                    if rejection.delegate {
                        continue;
                    }

                    let source = rejection
                        .error
                        .unwrap_or_else(|| Box::new(DelegationDeclinedError) as Box<dyn StdError + Send + Sync>);
                    return Err(LimiterError::JobFailed {
                        job_id: job_id.to_string(),
                        model: model_id.clone(),
                        source,
                    });
                }
            }
        }

        Err(LimiterError::CapacityExhausted {
            job_id: job_id.to_string(),
            last_model: last_model.unwrap_or_default(),
        })
    }
}
