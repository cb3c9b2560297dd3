//! A multi-dimensional, multi-process rate limiter for LLM backend calls.
//!
//! Reservations are made against four kinds of limit at once: rolling
//! request/token time windows (component A), a shared memory pool (E), and
//! per-model concurrency (B). They are queued fairly per job type (F) and,
//! when more than one model is configured, escalated across models in order
//! (G). An
//! optional [`backend::Backend`] couples a fleet of cooperating processes to
//! a centralized pool allocator (I/J) so the per-instance shares above stay
//! proportional to how many instances are actually registered.
//!
//! [`RateLimiter`] is the entry point: build a [`config::RateLimiterConfig`],
//! construct the limiter, call [`RateLimiter::start`], and submit jobs
//! through [`RateLimiter::queue_job`].

#![deny(missing_docs)]

pub mod availability;
pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod job_type;
pub mod memory;
pub mod model_limiter;
mod orchestrator;
pub mod observer;
pub mod semaphore;
pub mod time_window;
pub mod wait_queue;

pub use controller::{BoxedJobFn, JobContext, JobOutcome, JobRejection, JobResult, Usage, UsageEntry};
pub use error::{ConfigError, LimiterError};
pub use orchestrator::{ActiveJobInfo, JobSpec, LimiterStats, RateLimiter};
