//! Shard pool implementation
//!
//! Runs one block of shards in this process. Every shard shares the pool's
//! identify limiter, dispatcher (and through it the cache) and `ShardState`.

use std::ops::Range;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::connection::ShardConnection;
use super::ratelimit::IdentifyLimiter;
use super::state::ShardState;
use crate::config::ShardConfig;
use crate::error::GatewayError;
use crate::events::EventDispatcher;
use crate::metrics::GatewayMetrics;

/// Number of shards per gateway process (pool)
pub const SHARDS_PER_POOL: u32 = 25;

/// Shards owned by `pool_id`, clamped to the fleet size
pub fn shard_range(pool_id: u64, total_shards: u32) -> Range<u32> {
    let start = pool_id
        .saturating_mul(u64::from(SHARDS_PER_POOL))
        .min(u64::from(total_shards)) as u32;
    let end = start.saturating_add(SHARDS_PER_POOL).min(total_shards);
    start..end
}

/// Shard pool managing multiple gateway shards
pub struct ShardPool {
    pool_id: u64,
    shards: Vec<Arc<ShardConnection>>,
    state: ShardState,
}

impl ShardPool {
    /// Create the pool for block `pool_id` of `total_shards`
    pub fn new(
        pool_id: u64,
        total_shards: u32,
        config: Arc<ShardConfig>,
        limiter: Arc<dyn IdentifyLimiter>,
        dispatcher: Arc<EventDispatcher>,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self, GatewayError> {
        let range = shard_range(pool_id, total_shards);

        info!(
            pool_id,
            start_shard = range.start,
            end_shard = range.end,
            shard_count = range.len(),
            "Creating shard pool"
        );

        Self::with_shards(pool_id, range, total_shards, config, limiter, dispatcher, metrics)
    }

    /// Create a pool running exactly `shard_ids`
    pub fn with_shards(
        pool_id: u64,
        shard_ids: impl IntoIterator<Item = u32>,
        total_shards: u32,
        config: Arc<ShardConfig>,
        limiter: Arc<dyn IdentifyLimiter>,
        dispatcher: Arc<EventDispatcher>,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self, GatewayError> {
        let shard_ids: Vec<u32> = shard_ids.into_iter().collect();
        let state = ShardState::new(pool_id, shard_ids.iter().copied(), total_shards);

        let shards = shard_ids
            .into_iter()
            .map(|shard_id| {
                ShardConnection::new(
                    shard_id,
                    total_shards,
                    Arc::clone(&config),
                    Arc::clone(&limiter),
                    Arc::clone(&dispatcher),
                    state.clone(),
                    Arc::clone(&metrics),
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            pool_id,
            shards,
            state,
        })
    }

    /// Get the pool ID
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Get shared state (for health checks)
    pub fn state(&self) -> ShardState {
        self.state.clone()
    }

    pub fn shards(&self) -> &[Arc<ShardConnection>] {
        &self.shards
    }

    pub fn shard(&self, shard_id: u32) -> Option<&Arc<ShardConnection>> {
        self.shards.iter().find(|shard| shard.id() == shard_id)
    }

    /// Run all shards in the pool
    ///
    /// This spawns a task for each shard and waits for all of them, which
    /// happens only after [`shutdown`](Self::shutdown).
    pub async fn run(&self) {
        let mut tasks = JoinSet::new();

        for shard in &self.shards {
            let shard = Arc::clone(shard);
            tasks.spawn(async move { shard.run().await });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(pool_id = self.pool_id, error = %e, "Shard task failed");
            }
        }

        info!(pool_id = self.pool_id, "Shard pool shut down");
    }

    /// Signal shutdown to all shards
    pub fn shutdown(&self) {
        for shard in &self.shards {
            shard.shutdown();
        }
    }
}
