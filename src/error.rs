//! The typed error hierarchy: configuration errors are synchronous and fatal
//! to construction, limiter errors are returned from the job surface.

use thiserror::Error;

use crate::config::JobTypeId;
use crate::config::ModelId;

/// Raised synchronously from [`crate::RateLimiter::new`] when the supplied
/// configuration can never be served correctly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `models` was empty.
    #[error("at least one model must be configured")]
    EmptyModels,

    /// `escalationOrder` referenced a model id with no matching entry in `models`.
    #[error("escalation order references unknown model `{model_id}`")]
    UnknownEscalationModel {
        /// The offending model id.
        model_id: ModelId,
    },

    /// More than one model configured but no escalation order given.
    #[error("escalation order is required when more than one model is configured")]
    MissingEscalationOrder,

    /// The sum of non-flexible ratios alone exceeds 1.
    #[error("non-flexible job type ratios sum to {sum}, which exceeds 1.0")]
    NonFlexibleRatiosExceedOne {
        /// The offending sum.
        sum: f64,
    },

    /// All job types are non-flexible and their ratios don't sum to 1, so
    /// there is no flexible slack left to normalize against.
    #[error("job type ratios sum to {sum}, not 1.0, and no flexible job type can absorb the difference")]
    RatiosDoNotSumToOne {
        /// The offending sum.
        sum: f64,
    },

    /// A job type enables a dimension (e.g. token accounting) without an estimate for it.
    #[error("job type `{job_type_id}` is missing an estimate required for dimension `{dimension}`")]
    MissingEstimateForDimension {
        /// The job type missing the estimate.
        job_type_id: JobTypeId,
        /// The dimension name (`tokens`, `requests`, `memory`).
        dimension: &'static str,
    },
}

/// Raised from [`crate::RateLimiter::queue_job`] when a job cannot be completed.
#[derive(Debug, Error)]
pub enum LimiterError {
    /// The job referenced a job type that was never configured.
    #[error("job `{job_id}` references unconfigured job type `{job_type_id}`")]
    UnknownJobType {
        /// The job id that failed.
        job_id: String,
        /// The unconfigured job type id.
        job_type_id: JobTypeId,
    },

    /// Every model in the escalation order was tried and none could admit the
    /// job within its configured wait budget.
    #[error("job `{job_id}` exhausted all models, last attempted `{last_model}`")]
    CapacityExhausted {
        /// The job id that failed.
        job_id: String,
        /// The last model attempted before giving up.
        last_model: ModelId,
    },

    /// The job body itself failed (non-delegating rejection, or the job future returned an
    /// error).
    #[error("job `{job_id}` failed on model `{model}`: {source}")]
    JobFailed {
        /// The job id that failed.
        job_id: String,
        /// The model the job was running against when it failed.
        model: ModelId,
        /// The underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The backend denied or failed an operation that could not be recovered locally.
    #[error("backend unavailable during `{operation}`: {source}")]
    BackendUnavailable {
        /// The backend operation that failed (`acquire`, `release`, `register`, ...).
        operation: &'static str,
        /// The underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
