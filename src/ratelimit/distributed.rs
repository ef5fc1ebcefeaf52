//! Distributed rate limiter backed by a shared bucket store.
//!
//! The limiter itself is stateless: every decision is a single atomic
//! update executed by the store, so any number of instances pointing at the
//! same store share one bucket per key without talking to each other.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, trace};

use crate::config::BucketgateConfig;
use crate::error::Result;
use crate::store::{BucketKeys, BucketRequest, BucketStore, RedisStore};

use super::backend::RateLimiterBackend;
use super::bucket::{Decision, TokenBucket};
use super::clock::{Clock, SystemClock};

/// A rate limiter whose buckets live in a shared store.
pub struct DistributedRateLimiter<S: BucketStore, C: Clock = SystemClock> {
    /// The shared store executing bucket updates.
    store: Arc<S>,
    /// Refill rate and capacity applied to every key.
    bucket: TokenBucket,
    /// Namespace prepended to every store key.
    key_prefix: String,
    /// Time source for decision timestamps.
    clock: C,
}

impl<S: BucketStore> DistributedRateLimiter<S> {
    /// Create a distributed rate limiter.
    pub fn new(store: Arc<S>, rate: u32, capacity: u32) -> Result<Self> {
        Self::with_clock(store, rate, capacity, SystemClock)
    }
}

impl DistributedRateLimiter<RedisStore> {
    /// Connect to the configured Redis and build a limiter on top of it.
    pub async fn connect(config: &BucketgateConfig) -> Result<Self> {
        config.validate()?;
        let store = RedisStore::connect(&config.store).await?;
        Ok(Self::new(Arc::new(store), config.bucket.rate, config.bucket.capacity)?
            .with_key_prefix(config.store.key_prefix.clone()))
    }
}

impl<S: BucketStore, C: Clock> DistributedRateLimiter<S, C> {
    /// Create a distributed rate limiter stamping decisions with `clock`.
    pub fn with_clock(store: Arc<S>, rate: u32, capacity: u32, clock: C) -> Result<Self> {
        Ok(Self {
            store,
            bucket: TokenBucket::new(rate, capacity)?,
            key_prefix: String::new(),
            clock,
        })
    }

    /// Prepend `prefix` to every key written to the store.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Returns `true` when a call for `key` must be rejected.
    ///
    /// Store failures are returned as errors; they never turn into an
    /// allow or a deny.
    pub async fn is_limited(&self, key: &str) -> Result<bool> {
        let decision = self.acquire(key, 1).await?;
        Ok(!decision.allowed)
    }

    /// Try to take `requested` tokens from the shared bucket for `key`.
    pub async fn acquire(&self, key: &str, requested: u32) -> Result<Decision> {
        let keys = self.bucket_keys(key);
        let request = BucketRequest::new(&self.bucket, self.clock.now_nanos(), requested);

        trace!(
            key = %keys.tokens,
            requested = requested,
            now = request.now,
            "Checking distributed rate limit"
        );

        let decision = self
            .store
            .eval_bucket(&keys, &request)
            .await
            .map_err(|e| {
                error!(key = %keys.tokens, error = %e, "Bucket store update failed");
                e
            })?;

        if !decision.allowed {
            debug!(
                key = %keys.tokens,
                tokens = decision.tokens,
                "Distributed rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Store entry names used for `key`.
    pub fn bucket_keys(&self, key: &str) -> BucketKeys {
        BucketKeys::new(&self.key_prefix, key)
    }

    /// Bucket parameters of this limiter.
    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

#[async_trait]
impl<S: BucketStore, C: Clock> RateLimiterBackend for DistributedRateLimiter<S, C> {
    async fn is_limited(&self, key: &str) -> Result<bool> {
        DistributedRateLimiter::is_limited(self, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LimiterError;
    use crate::ratelimit::{LocalRateLimiter, ManualClock};
    use crate::store::MemoryStore;
    use std::time::Duration;

    const T0: u64 = 1_700_000_000_000_000_000;

    fn test_limiter(
        rate: u32,
        capacity: u32,
    ) -> (DistributedRateLimiter<MemoryStore<ManualClock>, ManualClock>, ManualClock) {
        let clock = ManualClock::new(T0);
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = DistributedRateLimiter::with_clock(store, rate, capacity, clock.clone()).unwrap();
        (limiter, clock)
    }

    /// A store that is always down.
    struct FailingStore;

    #[async_trait]
    impl BucketStore for FailingStore {
        async fn eval_bucket(&self, _: &BucketKeys, _: &BucketRequest) -> Result<Decision> {
            Err(LimiterError::Timeout(Duration::from_millis(5)))
        }
    }

    /// A store that remembers the last request and always allows.
    #[derive(Default)]
    struct RecordingStore {
        last: parking_lot::Mutex<Option<BucketRequest>>,
    }

    #[async_trait]
    impl BucketStore for RecordingStore {
        async fn eval_bucket(&self, _: &BucketKeys, request: &BucketRequest) -> Result<Decision> {
            *self.last.lock() = Some(*request);
            Ok(Decision { allowed: true, tokens: 0.0 })
        }
    }

    #[tokio::test]
    async fn test_distributed_limiter_creation() {
        let store = Arc::new(MemoryStore::new());
        assert!(DistributedRateLimiter::new(store.clone(), 0, 10).is_err());
        assert!(DistributedRateLimiter::new(store.clone(), 10, 0).is_err());

        let limiter = DistributedRateLimiter::new(store, 60, 10).unwrap();
        assert_eq!(limiter.bucket().capacity(), 10.0);
    }

    #[tokio::test]
    async fn test_first_call_allowed() {
        let (limiter, _) = test_limiter(1, 1);
        assert!(!limiter.is_limited("fresh").await.unwrap());
        assert!(limiter.is_limited("fresh").await.unwrap());
    }

    #[tokio::test]
    async fn test_key_prefix() {
        let (limiter, _) = test_limiter(1, 3);
        let limiter = limiter.with_key_prefix("api:");

        limiter.is_limited("user").await.unwrap();
        assert_eq!(limiter.store().get("api:user").as_deref(), Some("2"));
        assert_eq!(limiter.store().get("api:user:timestamp"), Some(T0.to_string()));
        assert!(limiter.store().get("user").is_none());
    }

    #[tokio::test]
    async fn test_burst_then_refill() {
        let (limiter, clock) = test_limiter(60, 10);

        for i in 1..=10 {
            assert!(!limiter.is_limited("key").await.unwrap(), "Request {} should be allowed", i);
        }
        assert!(limiter.is_limited("key").await.unwrap());

        clock.advance(Duration::from_millis(17));
        assert!(!limiter.is_limited("key").await.unwrap());
        assert!(limiter.is_limited("key").await.unwrap());
    }

    #[tokio::test]
    async fn test_instances_share_buckets() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let a = DistributedRateLimiter::with_clock(store.clone(), 1, 4, clock.clone()).unwrap();
        let b = DistributedRateLimiter::with_clock(store, 1, 4, clock).unwrap();

        assert!(!a.is_limited("key").await.unwrap());
        assert!(!b.is_limited("key").await.unwrap());
        assert!(!a.is_limited("key").await.unwrap());
        assert!(!b.is_limited("key").await.unwrap());
        assert!(a.is_limited("key").await.unwrap());
        assert!(b.is_limited("key").await.unwrap());
    }

    #[tokio::test]
    async fn test_idle_key_expires_and_resets() {
        let (limiter, clock) = test_limiter(10, 5);
        for _ in 0..5 {
            limiter.is_limited("key").await.unwrap();
        }
        assert!(limiter.is_limited("key").await.unwrap());

        clock.advance(limiter.bucket().expiry());
        assert!(limiter.store().is_empty());

        let decision = limiter.acquire("key", 1).await.unwrap();
        assert_eq!(decision, Decision { allowed: true, tokens: 4.0 });
    }

    #[tokio::test]
    async fn test_replay_is_deterministic() {
        // Two keys fed the same history at the same instants end up in the
        // same place.
        let (limiter, clock) = test_limiter(60, 10);
        let mut results = Vec::new();

        for key in ["first", "second"] {
            clock.set(T0);
            let mut history = Vec::new();
            for step in 0..20 {
                clock.set(T0 + step * 7_000_000);
                history.push(limiter.acquire(key, 1).await.unwrap());
            }
            results.push(history);
        }

        assert_eq!(results[0], results[1]);
    }

    #[tokio::test]
    async fn test_matches_local_limiter() {
        let clock = ManualClock::new(T0);
        let local = LocalRateLimiter::with_clock(60, 10, clock.clone()).unwrap();
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let distributed = DistributedRateLimiter::with_clock(store, 60, 10, clock.clone()).unwrap();

        // 100 calls per second for 5 seconds
        for _ in 0..500 {
            let expected = local.acquire("key", 1);
            let actual = distributed.acquire("key", 1).await.unwrap();
            assert_eq!(expected.allowed, actual.allowed);
            assert!((expected.tokens - actual.tokens).abs() < 1e-9);
            clock.advance(Duration::from_millis(10));
        }
    }

    #[tokio::test]
    async fn test_request_carries_bucket_parameters() {
        let store = Arc::new(RecordingStore::default());
        let clock = ManualClock::new(T0);
        let limiter = DistributedRateLimiter::with_clock(store.clone(), 25, 7, clock).unwrap();

        limiter.acquire("key", 3).await.unwrap();
        let recorded = *store.last.lock();
        let request = recorded.unwrap();
        assert_eq!(request.rate, limiter.bucket().refill_per_sec());
        assert_eq!(request.capacity, limiter.bucket().max_tokens());
        assert_eq!(request, BucketRequest { rate: 25, capacity: 7, now: T0, requested: 3 });
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error() {
        let limiter = DistributedRateLimiter::new(Arc::new(FailingStore), 60, 10).unwrap();

        let err = limiter.is_limited("key").await.unwrap_err();
        assert!(matches!(err, LimiterError::Timeout(_)));
        tokio_test::assert_err!(limiter.acquire("key", 1).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_instances_never_double_grant() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::new(
                    DistributedRateLimiter::with_clock(store.clone(), 60, 10, clock.clone()).unwrap(),
                );
                tokio::spawn(async move {
                    let mut allowed = 0;
                    for _ in 0..25 {
                        if !limiter.is_limited("shared").await.unwrap() {
                            allowed += 1;
                        }
                    }
                    allowed
                })
            })
            .collect();

        let mut total = 0;
        for task in tasks {
            total += task.await.unwrap();
        }
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn test_backend_trait() {
        let (limiter, _) = test_limiter(1, 1);
        let backend: Arc<dyn RateLimiterBackend> = Arc::new(limiter);

        assert!(!backend.is_limited("key").await.unwrap());
        assert!(backend.is_limited("key").await.unwrap());
    }
}
