//! Shard state tracking
//!
//! Pool-wide view of every shard's connection stage and counters, read by the
//! health endpoints. Writes come from each shard's own tasks.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::model::Id;

/// Where a shard is in its connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStage {
    /// Created, `run` not called yet
    Idle,
    /// Dialing the gateway
    Connecting,
    /// Transport open, waiting for Hello
    AwaitingHello,
    /// Waiting for an identify slot or sending Identify
    Identifying,
    /// Sending Resume
    Resuming,
    /// Session handshake sent; heartbeating
    Heartbeating,
    /// Connection lost, waiting to dial again
    Reconnecting,
    /// Stopped for good
    Shutdown,
}

impl ShardStage {
    /// Returns true if the shard has, or is establishing, a session
    pub fn is_healthy(&self) -> bool {
        matches!(
            self,
            ShardStage::Identifying | ShardStage::Resuming | ShardStage::Heartbeating
        )
    }

    /// Returns true if the shard is connected and heartbeating
    pub fn is_ready(&self) -> bool {
        matches!(self, ShardStage::Heartbeating)
    }

    /// Returns true while a physical connection is open
    pub fn is_connection_live(&self) -> bool {
        matches!(
            self,
            ShardStage::AwaitingHello
                | ShardStage::Identifying
                | ShardStage::Resuming
                | ShardStage::Heartbeating
        )
    }
}

/// State for a single shard
#[derive(Debug)]
pub struct ShardStateEntry {
    pub stage: ShardStage,
    pub guilds: HashSet<Id>,
    pub events_received: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_heartbeat_ack: Option<Instant>,
    pub latency: Option<Duration>,
    pub connected_at: Option<Instant>,
}

impl Default for ShardStateEntry {
    fn default() -> Self {
        Self {
            stage: ShardStage::Idle,
            guilds: HashSet::new(),
            events_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_heartbeat_ack: None,
            latency: None,
            connected_at: None,
        }
    }
}

/// Point-in-time copy of one shard's entry
#[derive(Debug, Clone, Serialize)]
pub struct ShardSnapshot {
    pub shard_id: u32,
    pub stage: ShardStage,
    pub guilds: usize,
    pub events_received: u64,
    pub reconnects: u64,
    pub latency_ms: Option<u64>,
    /// Seconds since the current connection reached `Heartbeating`
    pub connected_secs: Option<u64>,
    /// Milliseconds since the last HeartbeatAck
    pub last_heartbeat_ack_ms: Option<u64>,
}

/// Shared state across all shards in a pool
#[derive(Debug, Clone)]
pub struct ShardState {
    inner: Arc<ShardStateInner>,
}

#[derive(Debug)]
struct ShardStateInner {
    pool_id: u64,
    shards: DashMap<u32, ShardStateEntry>,
    total_shards: u32,
}

impl ShardState {
    /// Create a new shard state tracker
    pub fn new(pool_id: u64, shard_ids: impl IntoIterator<Item = u32>, total_shards: u32) -> Self {
        let shards = DashMap::new();
        for shard_id in shard_ids {
            shards.insert(shard_id, ShardStateEntry::default());
        }

        Self {
            inner: Arc::new(ShardStateInner {
                pool_id,
                shards,
                total_shards,
            }),
        }
    }

    pub fn pool_id(&self) -> u64 {
        self.inner.pool_id
    }

    /// Get total shards across the fleet
    pub fn total_shards(&self) -> u32 {
        self.inner.total_shards
    }

    pub fn set_stage(&self, shard_id: u32, stage: ShardStage) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.stage = stage;
            match stage {
                ShardStage::Heartbeating if entry.connected_at.is_none() => {
                    entry.connected_at = Some(Instant::now());
                }
                ShardStage::Reconnecting | ShardStage::Shutdown => entry.connected_at = None,
                _ => {}
            }
        }
    }

    /// Like `set_stage`, but only while the connection is still live. Tasks
    /// that outlive their connection cannot undo `Reconnecting` or `Shutdown`.
    pub fn advance_stage(&self, shard_id: u32, stage: ShardStage) -> bool {
        let live = self
            .inner
            .shards
            .get(&shard_id)
            .is_some_and(|entry| entry.stage.is_connection_live());
        if live {
            self.set_stage(shard_id, stage);
        }
        live
    }

    pub fn stage(&self, shard_id: u32) -> Option<ShardStage> {
        self.inner.shards.get(&shard_id).map(|e| e.stage)
    }

    /// Replace the shard's guild set, as listed by `READY`
    pub fn set_guilds(&self, shard_id: u32, guilds: impl IntoIterator<Item = Id>) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.guilds = guilds.into_iter().collect();
        }
    }

    pub fn add_guild(&self, shard_id: u32, guild_id: Id) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.guilds.insert(guild_id);
        }
    }

    pub fn remove_guild(&self, shard_id: u32, guild_id: Id) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.guilds.remove(&guild_id);
        }
    }

    pub fn record_event(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.events_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_reconnect(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_heartbeat_ack(&self, shard_id: u32, latency: Duration) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.last_heartbeat_ack = Some(Instant::now());
            entry.latency = Some(latency);
        }
    }

    pub fn total_events_received(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.events_received.load(Ordering::Relaxed))
            .sum()
    }

    /// Get total guilds across all shards
    pub fn total_guilds(&self) -> u64 {
        self.inner.shards.iter().map(|e| e.guilds.len() as u64).sum()
    }

    pub fn ready_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.stage.is_ready())
            .count()
    }

    pub fn healthy_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.stage.is_healthy())
            .count()
    }

    /// Get total shard count in this pool
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Check if pool is ready (at least one shard ready)
    pub fn is_ready(&self) -> bool {
        self.ready_shards() > 0
    }

    /// Check if pool is fully healthy
    pub fn is_healthy(&self) -> bool {
        self.healthy_shards() == self.shard_count()
    }

    /// Per-shard snapshots ordered by shard id
    pub fn snapshots(&self) -> Vec<ShardSnapshot> {
        let mut snapshots: Vec<_> = self
            .inner
            .shards
            .iter()
            .map(|e| ShardSnapshot {
                shard_id: *e.key(),
                stage: e.stage,
                guilds: e.guilds.len(),
                events_received: e.events_received.load(Ordering::Relaxed),
                reconnects: e.reconnects.load(Ordering::Relaxed),
                latency_ms: e.latency.map(|latency| latency.as_millis() as u64),
                connected_secs: e.connected_at.map(|at| at.elapsed().as_secs()),
                last_heartbeat_ack_ms: e
                    .last_heartbeat_ack
                    .map(|at| at.elapsed().as_millis() as u64),
            })
            .collect();

        snapshots.sort_by_key(|snapshot| snapshot.shard_id);
        snapshots
    }
}
