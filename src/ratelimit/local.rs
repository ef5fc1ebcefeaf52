//! In-process token bucket rate limiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::BucketConfig;
use crate::error::Result;

use super::backend::RateLimiterBackend;
use super::bucket::{BucketState, Decision, TokenBucket};
use super::clock::{Clock, SystemClock};

/// A rate limiter that keeps every bucket in process memory.
///
/// All keys share one table behind a single lock. The critical section is a
/// map lookup and a few float operations, so the lock is held only briefly.
/// Each instance owns its table; instances never share state.
pub struct LocalRateLimiter<C: Clock = SystemClock> {
    /// Refill rate and capacity applied to every key
    bucket: TokenBucket,
    /// Bucket state indexed by key
    buckets: Mutex<HashMap<String, BucketState>>,
    /// Time source for refill
    clock: C,
}

impl LocalRateLimiter {
    /// Create a limiter adding `rate` tokens per second up to `capacity`.
    pub fn new(rate: u32, capacity: u32) -> Result<Self> {
        Self::with_clock(rate, capacity, SystemClock)
    }

    /// Create a limiter from configuration.
    pub fn from_config(config: &BucketConfig) -> Result<Self> {
        Self::new(config.rate, config.capacity)
    }
}

impl<C: Clock> LocalRateLimiter<C> {
    /// Create a limiter reading time from `clock`.
    pub fn with_clock(rate: u32, capacity: u32, clock: C) -> Result<Self> {
        Ok(Self {
            bucket: TokenBucket::new(rate, capacity)?,
            buckets: Mutex::new(HashMap::new()),
            clock,
        })
    }

    /// Returns `true` when a call for `key` must be rejected.
    pub fn is_limited(&self, key: &str) -> bool {
        !self.acquire(key, 1).allowed
    }

    /// Try to take `requested` tokens from the bucket for `key`.
    ///
    /// The refilled level and the current time are stored even when the
    /// request is denied.
    pub fn acquire(&self, key: &str, requested: u32) -> Decision {
        let decision = {
            let mut buckets = self.buckets.lock();
            // Read the clock under the lock so stored timestamps never go
            // backwards between two racing callers.
            let now = self.clock.now_nanos();
            let previous = buckets.get(key).copied();
            let (decision, state) = self.bucket.acquire(previous.as_ref(), now, requested);

            match buckets.get_mut(key) {
                Some(slot) => *slot = state,
                None => {
                    buckets.insert(key.to_owned(), state);
                }
            }
            decision
        };

        trace!(
            key = %key,
            requested = requested,
            allowed = decision.allowed,
            tokens = decision.tokens,
            "Local rate limit decision"
        );

        if !decision.allowed {
            debug!(key = %key, tokens = decision.tokens, "Rate limit exceeded");
        }

        decision
    }

    /// Stored token level for `key`, or `None` if the key was never seen.
    ///
    /// This is the level left by the last decision, without refill.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets.lock().get(key).map(|state| state.tokens)
    }

    /// Remove buckets that have refilled completely.
    ///
    /// A removed key behaves exactly like a never-seen key, so purging only
    /// reclaims memory. Returns the number of keys removed.
    pub fn purge_idle(&self) -> usize {
        let mut buckets = self.buckets.lock();
        let now = self.clock.now_nanos();
        let before = buckets.len();
        buckets.retain(|_, state| !self.bucket.is_idle(state, now));
        let removed = before - buckets.len();

        if removed > 0 {
            debug!(removed = removed, remaining = buckets.len(), "Purged idle buckets");
        }
        removed
    }

    /// Run [`purge_idle`](Self::purge_idle) every `interval` on the tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the limiter is dropped.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    trace!("Limiter dropped, stopping idle sweeper");
                    break;
                };
                limiter.purge_idle();
            }
        })
    }

    /// Get the number of tracked keys.
    pub fn key_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Forget every bucket.
    pub fn clear(&self) {
        self.buckets.lock().clear();
    }

    /// Bucket parameters of this limiter.
    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }
}

#[async_trait]
impl<C: Clock> RateLimiterBackend for LocalRateLimiter<C> {
    async fn is_limited(&self, key: &str) -> Result<bool> {
        Ok(LocalRateLimiter::is_limited(self, key))
    }
}
