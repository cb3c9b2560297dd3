//! Component J: the centralized pool allocator, reference implementation.
//!
//! The specification treats the store's technology as out of scope and
//! specifies only the data layout and the atomic-script contracts, so this
//! is an in-process stand-in: a single `tokio::sync::Mutex<AllocatorState>`
//! plays the role of the store's single-script linearizability, and a
//! `tokio::sync::broadcast::Sender<AllocationInfo>` plays the role of the
//! pub/sub channel. [`Backend`] is a trait precisely so a production
//! deployment can swap in a store-backed implementation without touching the
//! limiter.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use conv::ConvAsUtil;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::config::{ModelId, RateLimiterConfig};

use super::{AllocationInfo, Backend, BackendContext, BackendUsage, Pool};

/// Tunables for the reference allocator's instance bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBackendConfig {
    /// An instance is dropped if its last heartbeat is older than this.
    pub instance_timeout: Duration,
    /// How often the cleanup sweep runs.
    pub cleanup_interval: Duration,
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self {
            instance_timeout: Duration::from_millis(15_000),
            cleanup_interval: Duration::from_millis(5_000),
        }
    }
}

/// The per-model capacity a pool is divided from: the most restrictive
/// active dimension, plus the per-job-type average estimate used to convert
/// it into slots.
#[derive(Debug, Clone, Copy)]
struct ModelCapacity {
    tokens_per_minute: Option<u64>,
    requests_per_minute: Option<u64>,
    tokens_per_day: Option<u64>,
    requests_per_day: Option<u64>,
    max_concurrent_requests: Option<u64>,
    avg_estimated_tokens: f64,
    avg_estimated_requests: f64,
}

struct PoolUsage {
    tokens_used: u64,
    requests_used: u64,
}

struct AllocatorState {
    instances: HashMap<String, Instant>,
    // per-instance, per-model live usage against the last-published pool
    usage: HashMap<(String, ModelId), PoolUsage>,
}

/// The in-process reference centralized allocator.
pub struct MemoryBackend {
    capacities: HashMap<ModelId, ModelCapacity>,
    state: Mutex<AllocatorState>,
    channel: broadcast::Sender<AllocationInfo>,
    config: MemoryBackendConfig,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryBackend {
    /// Build an allocator from the limiter's model and job-type configuration.
    pub fn new(config: &RateLimiterConfig, backend_config: MemoryBackendConfig) -> Arc<Self> {
        let capacities = config
            .models
            .iter()
            .map(|(model_id, limits)| {
                let (sum_tokens, sum_requests, n) = config.job_types.values().fold(
                    (0u64, 0u64, 0u64),
                    |(tok, req, n), jt| {
                        (
                            tok + jt.estimate.estimated_tokens,
                            req + jt.estimate.estimated_requests,
                            n + 1,
                        )
                    },
                );
                let n = n.max(1);
                (
                    model_id.clone(),
                    ModelCapacity {
                        tokens_per_minute: limits.tokens_per_minute,
                        requests_per_minute: limits.requests_per_minute,
                        tokens_per_day: limits.tokens_per_day,
                        requests_per_day: limits.requests_per_day,
                        max_concurrent_requests: limits.max_concurrent_requests,
                        avg_estimated_tokens: (sum_tokens as f64 / n as f64).max(1.0),
                        avg_estimated_requests: (sum_requests as f64 / n as f64).max(1.0),
                    },
                )
            })
            .collect();

        let (tx, _rx) = broadcast::channel(64);
        Arc::new(Self {
            capacities,
            state: Mutex::new(AllocatorState {
                instances: HashMap::new(),
                usage: HashMap::new(),
            }),
            channel: tx,
            config: backend_config,
            cleanup_task: Mutex::new(None),
        })
    }

    /// Start the periodic cleanup sweep that drops stale instances.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.cleanup_task.lock().await;
        if guard.is_some() {
            return;
        }
        let this = self.clone();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.cleanup_interval);
            loop {
                ticker.tick().await;
                this.cleanup().await;
            }
        }));
    }

    /// Stop the periodic cleanup sweep.
    pub async fn stop(&self) {
        if let Some(handle) = self.cleanup_task.lock().await.take() {
            handle.abort();
        }
    }

    async fn cleanup(&self) {
        let cutoff = Instant::now() - self.config.instance_timeout;
        let mut state = self.state.lock().await;
        let stale: Vec<String> = state
            .instances
            .iter()
            .filter(|(_, last)| **last < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        if stale.is_empty() {
            return;
        }
        for id in &stale {
            state.instances.remove(id);
            state.usage.retain(|(inst, _), _| inst != id);
        }
        self.recompute_and_publish(&mut state);
    }

    fn allocation_for(&self, state: &AllocatorState, instance_id: &str) -> AllocationInfo {
        let instance_count = state.instances.len().max(1) as u64;
        let mut pools = HashMap::new();
        for (model_id, cap) in &self.capacities {
            let limiting = [
                cap.tokens_per_minute
                    .map(|limit| (limit as f64 / cap.avg_estimated_tokens).floor()),
                cap.requests_per_minute
                    .map(|limit| (limit as f64 / cap.avg_estimated_requests).floor()),
                cap.tokens_per_day
                    .map(|limit| (limit as f64 / cap.avg_estimated_tokens).floor()),
                cap.requests_per_day
                    .map(|limit| (limit as f64 / cap.avg_estimated_requests).floor()),
                cap.max_concurrent_requests.map(|limit| limit as f64),
            ]
            .into_iter()
            .flatten()
            .fold(f64::INFINITY, f64::min);

            let total_slots = if limiting.is_finite() {
                (limiting / instance_count as f64)
                    .floor()
                    .approx_as::<u64>()
                    .expect("should be clamped within u64 bounds")
            } else {
                u64::MAX
            };

            pools.insert(
                model_id.clone(),
                Pool {
                    total_slots,
                    tokens_per_minute: cap.tokens_per_minute.unwrap_or(0) / instance_count,
                    requests_per_minute: cap.requests_per_minute.unwrap_or(0) / instance_count,
                    tokens_per_day: cap.tokens_per_day.unwrap_or(0) / instance_count,
                    requests_per_day: cap.requests_per_day.unwrap_or(0) / instance_count,
                },
            );
        }
        let _ = instance_id;
        AllocationInfo { instance_count, pools }
    }

    fn recompute_and_publish(&self, state: &mut AllocatorState) {
        for instance_id in state.instances.keys().cloned().collect::<Vec<_>>() {
            let allocation = self.allocation_for(state, &instance_id);
            let _ = self.channel.send(allocation);
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn register(&self, instance_id: &str) -> anyhow::Result<AllocationInfo> {
        let mut state = self.state.lock().await;
        state.instances.insert(instance_id.to_string(), Instant::now());
        self.recompute_and_publish(&mut state);
        Ok(self.allocation_for(&state, instance_id))
    }

    async fn heartbeat(&self, instance_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.instances.insert(instance_id.to_string(), Instant::now());
        Ok(())
    }

    async fn unregister(&self, instance_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.instances.remove(instance_id);
        state.usage.retain(|(inst, _), _| inst != instance_id);
        self.recompute_and_publish(&mut state);
        Ok(())
    }

    async fn acquire(&self, instance_id: &str, ctx: &BackendContext) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        state.instances.insert(instance_id.to_string(), Instant::now());
        let allocation = self.allocation_for(&state, instance_id);
        let Some(pool) = allocation.pools.get(&ctx.model_id) else {
            return Ok(true);
        };
        let entry = state
            .usage
            .entry((instance_id.to_string(), ctx.model_id.clone()))
            .or_insert_with(|| PoolUsage {
                tokens_used: 0,
                requests_used: 0,
            });
        let would_use_tokens = entry.tokens_used + ctx.estimated_tokens;
        let would_use_requests = entry.requests_used + ctx.estimated_requests;
        if pool.tokens_per_minute > 0 && would_use_tokens > pool.tokens_per_minute {
            return Ok(false);
        }
        if pool.requests_per_minute > 0 && would_use_requests > pool.requests_per_minute {
            return Ok(false);
        }
        entry.tokens_used = would_use_tokens;
        entry.requests_used = would_use_requests;
        Ok(true)
    }

    async fn release(
        &self,
        instance_id: &str,
        ctx: &BackendContext,
        usage: BackendUsage,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.instances.insert(instance_id.to_string(), Instant::now());
        if let Some(entry) = state
            .usage
            .get_mut(&(instance_id.to_string(), ctx.model_id.clone()))
        {
            entry.tokens_used = entry
                .tokens_used
                .saturating_sub(ctx.estimated_tokens)
                .saturating_add(usage.actual_tokens);
            entry.requests_used = entry
                .requests_used
                .saturating_sub(ctx.estimated_requests)
                .saturating_add(usage.actual_requests);
        }
        Ok(())
    }

    async fn subscribe(&self, _instance_id: &str) -> anyhow::Result<broadcast::Receiver<AllocationInfo>> {
        Ok(self.channel.subscribe())
    }
}
