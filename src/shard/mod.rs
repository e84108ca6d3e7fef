//! Shard management module
//!
//! Gateway connections, their reconnect and identify policy, and the pool
//! that runs them.

mod backoff;
mod connection;
mod heartbeat;
mod pool;
mod ratelimit;
mod session;
mod state;

pub use backoff::Backoff;
pub use connection::{gateway_url, ShardConnection};
pub use pool::{shard_range, ShardPool, SHARDS_PER_POOL};
pub use ratelimit::{IdentifyLimiter, TokenBucket};
pub use session::{Handshake, LiveSession, ResumeInfo};
pub use state::{ShardSnapshot, ShardStage, ShardState, ShardStateEntry};
