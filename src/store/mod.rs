//! Shared bucket stores.
//!
//! A store keeps the bucket entries of the distributed limiter and applies
//! one whole read-refill-consume-write update per call, with no other update
//! on the same entries interleaved.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::{Decision, TokenBucket};

/// Names of the two entries backing one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKeys {
    /// Entry holding the remaining token count
    pub tokens: String,
    /// Entry holding the last refill time in unix nanoseconds
    pub timestamp: String,
}

impl BucketKeys {
    /// Suffix appended to a bucket key to name its timestamp entry.
    pub const TIMESTAMP_SUFFIX: &'static str = ":timestamp";

    /// Entry names for `key` under `prefix`.
    pub fn new(prefix: &str, key: &str) -> Self {
        let tokens = format!("{}{}", prefix, key);
        let timestamp = format!("{}{}", tokens, Self::TIMESTAMP_SUFFIX);
        Self { tokens, timestamp }
    }
}

/// Arguments of one bucket update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketRequest {
    /// Tokens added per second
    pub rate: u32,
    /// Maximum stored tokens
    pub capacity: u32,
    /// Unix nanoseconds of this decision
    pub now: u64,
    /// Tokens to consume
    pub requested: u32,
}

impl BucketRequest {
    /// Request `requested` tokens from `bucket` at `now`.
    pub fn new(bucket: &TokenBucket, now: u64, requested: u32) -> Self {
        Self {
            rate: bucket.refill_per_sec(),
            capacity: bucket.max_tokens(),
            now,
            requested,
        }
    }
}

/// A key-value store able to update a bucket atomically.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Refill and consume from the bucket named by `keys`, then write both
    /// entries back with an expiry of `2 * capacity / rate + 1` seconds.
    async fn eval_bucket(&self, keys: &BucketKeys, request: &BucketRequest) -> Result<Decision>;
}
