//! Rate limiter trait for abstracting local and distributed implementations.

use async_trait::async_trait;

use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over both the `LocalRateLimiter` and the
/// `DistributedRateLimiter` so call sites can hold either one behind
/// `Arc<dyn RateLimiterBackend>`.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Decide whether a call for `key` must be rejected.
    ///
    /// Every call consumes a token when one is available. `Ok(true)` means
    /// the call is over the limit.
    async fn is_limited(&self, key: &str) -> Result<bool>;
}
