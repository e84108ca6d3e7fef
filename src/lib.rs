//! Sharded gateway client
//!
//! - [`shard`]: one connection per shard with heartbeating, resume and
//!   reconnect, run as a pool behind a shared identify limiter
//! - [`events`]: typed dispatch decoding, cache mirroring, handler fan-out
//! - [`cache`]: segmented in-memory mirror of guilds, members, channels and
//!   friends with per-guild indices

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod model;
pub mod protocol;
pub mod shard;

pub use cache::{Cache, CacheFlags};
pub use config::{GatewayConfig, ShardConfig};
pub use error::GatewayError;
pub use events::{Event, EventContext, EventDispatcher, EventHandler};
pub use metrics::GatewayMetrics;
pub use shard::{IdentifyLimiter, ShardConnection, ShardPool, TokenBucket};
