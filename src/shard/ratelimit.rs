//! Identify rate limiting
//!
//! Discord allows `max_concurrency` identifies per 5 seconds per bot. Every
//! shard in the pool waits on the same limiter before sending Identify.
//! Resumes do not consume a slot.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Gate in front of every Identify
#[async_trait]
pub trait IdentifyLimiter: Send + Sync {
    /// Resolves once the caller may identify
    async fn wait(&self);
}

/// Token bucket: starts full with `capacity` tokens and regains one token per
/// `interval`, never above `capacity`.
///
/// Waiters queue fairly on the underlying semaphore. Refilling runs on a
/// background task that stops when the bucket is dropped, so this must be
/// created inside a Tokio runtime.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: Arc<Semaphore>,
    capacity: usize,
    interval: Duration,
    refill: JoinHandle<()>,
}

impl TokenBucket {
    pub fn new(capacity: usize, interval: Duration) -> Self {
        let capacity = capacity.max(1);
        let interval = interval.max(Duration::from_millis(1));
        let tokens = Arc::new(Semaphore::new(capacity));
        let refill = tokio::spawn(refill(Arc::clone(&tokens), capacity, interval));

        Self {
            tokens,
            capacity,
            interval,
            refill,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Tokens that could be taken right now without waiting
    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }
}

async fn refill(tokens: Arc<Semaphore>, capacity: usize, interval: Duration) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if tokens.available_permits() < capacity {
            tokens.add_permits(1);
        }
    }
}

#[async_trait]
impl IdentifyLimiter for TokenBucket {
    async fn wait(&self) {
        // The semaphore is never closed, so acquire only fails if that changes
        if let Ok(permit) = self.tokens.acquire().await {
            permit.forget();
        }
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.refill.abort();
    }
}
