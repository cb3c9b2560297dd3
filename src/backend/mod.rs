//! Component I: the optional coupling to a centralized pool allocator.
//!
//! `Backend` is an `#[async_trait]`, matching the teacher's `Limiter`/
//! `LimitAlgorithm` traits, kept object-safe so it can be boxed as
//! `Arc<dyn Backend>` and carried inside [`crate::config::RateLimiterConfig`].
//! `subscribe` returns a `tokio::sync::broadcast::Receiver` rather than
//! taking a callback, so the limiter's own background task can `.await` on
//! it the same way it already awaits window-reset timers.

pub mod memory_backend;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::config::ModelId;

/// One instance's published allocation for a single model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pool {
    /// Total concurrent slots this instance may use for the model.
    pub total_slots: u64,
    /// This instance's share of the model's tokens-per-minute budget.
    pub tokens_per_minute: u64,
    /// This instance's share of the model's requests-per-minute budget.
    pub requests_per_minute: u64,
    /// This instance's share of the model's tokens-per-day budget.
    pub tokens_per_day: u64,
    /// This instance's share of the model's requests-per-day budget.
    pub requests_per_day: u64,
}

/// The full allocation state published on every registry change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationInfo {
    /// How many instances are currently registered.
    pub instance_count: u64,
    /// Per-model pool shares for the instance this was published to.
    pub pools: HashMap<ModelId, Pool>,
}

/// The per-reservation context passed to `acquire`/`release`.
#[derive(Debug, Clone)]
pub struct BackendContext {
    /// The model this reservation is against.
    pub model_id: ModelId,
    /// Estimated tokens for this reservation.
    pub estimated_tokens: u64,
    /// Estimated requests for this reservation.
    pub estimated_requests: u64,
}

/// A reservation's actual usage, reported back to the backend on release.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendUsage {
    /// Actual tokens consumed.
    pub actual_tokens: u64,
    /// Actual requests consumed.
    pub actual_requests: u64,
}

/// Optional coupling to a centralized allocator shared by cooperating
/// instances of this process.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Register this instance, returning its initial allocation.
    async fn register(&self, instance_id: &str) -> anyhow::Result<AllocationInfo>;

    /// Refresh this instance's liveness.
    async fn heartbeat(&self, instance_id: &str) -> anyhow::Result<()>;

    /// Remove this instance from the registry.
    async fn unregister(&self, instance_id: &str) -> anyhow::Result<()>;

    /// Conditionally bump the instance's pool counter for `model_id`.
    /// Returns `true` if the store granted the reservation.
    async fn acquire(&self, instance_id: &str, ctx: &BackendContext) -> anyhow::Result<bool>;

    /// Report actual usage and refund the difference against the pool.
    async fn release(
        &self,
        instance_id: &str,
        ctx: &BackendContext,
        usage: BackendUsage,
    ) -> anyhow::Result<()>;

    /// Subscribe to allocation changes for this instance.
    async fn subscribe(&self, instance_id: &str) -> anyhow::Result<broadcast::Receiver<AllocationInfo>>;
}
