//! In-process bucket store with entry expiry.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::Result;
use crate::ratelimit::{BucketState, Clock, Decision, SystemClock, TokenBucket};

use super::{BucketKeys, BucketRequest, BucketStore};

/// A stored string value and the store time it expires at.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: u64,
}

impl Entry {
    fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// Store time between sweeps of expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// The entry table and when it is next swept.
#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Entry>,
    next_sweep_at: u64,
}

impl Entries {
    /// Drop every expired entry, at most once per [`SWEEP_INTERVAL`].
    fn sweep_expired(&mut self, now: u64) {
        if now < self.next_sweep_at {
            return;
        }
        let before = self.map.len();
        self.map.retain(|_, entry| entry.is_live(now));
        self.next_sweep_at = now.saturating_add(SWEEP_INTERVAL.as_nanos() as u64);

        let dropped = before - self.map.len();
        if dropped > 0 {
            trace!(dropped = dropped, remaining = self.map.len(), "Swept expired entries");
        }
    }

    fn live(&self, key: &str, now: u64) -> Option<&Entry> {
        self.map.get(key).filter(|entry| entry.is_live(now))
    }
}

/// A bucket store living in process memory.
///
/// Entries are strings with an expiry, like their Redis counterparts, and
/// every bucket update runs under one lock. Several limiters holding the same
/// `Arc<MemoryStore>` therefore share buckets exactly as separate processes
/// sharing one Redis would.
///
/// Expired entries read as absent. They are removed from memory by a sweep
/// that runs at most once per second of store time, piggybacked on reads and
/// bucket updates.
pub struct MemoryStore<C: Clock = SystemClock> {
    entries: Mutex<Entries>,
    /// Store-side time, used only for expiry
    clock: C,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryStore<C> {
    /// Create a store that expires entries according to `clock`.
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            clock,
        }
    }

    /// Current value of an unexpired entry.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = self.clock.now_nanos();
        let mut entries = self.entries.lock();
        entries.sweep_expired(now);
        entries.live(key, now).map(|entry| entry.value.clone())
    }

    /// Remaining lifetime of an unexpired entry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_nanos();
        let mut entries = self.entries.lock();
        entries.sweep_expired(now);
        entries
            .live(key, now)
            .map(|entry| Duration::from_nanos(entry.expires_at - now))
    }

    /// Number of unexpired entries. Expired entries are dropped on the way.
    pub fn len(&self) -> usize {
        let now = self.clock.now_nanos();
        let mut entries = self.entries.lock();
        entries.map.retain(|_, entry| entry.is_live(now));
        entries.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries held in memory, expired or not.
    #[cfg(test)]
    fn resident(&self) -> usize {
        self.entries.lock().map.len()
    }
}

fn read_number<T: std::str::FromStr>(entries: &Entries, key: &str, now: u64) -> Option<T> {
    entries
        .live(key, now)
        .and_then(|entry| entry.value.parse().ok())
}

#[async_trait]
impl<C: Clock> BucketStore for MemoryStore<C> {
    async fn eval_bucket(&self, keys: &BucketKeys, request: &BucketRequest) -> Result<Decision> {
        let bucket = TokenBucket::new(request.rate, request.capacity)?;

        let mut entries = self.entries.lock();
        let store_now = self.clock.now_nanos();
        entries.sweep_expired(store_now);

        // Missing entries default independently, as the Redis script does.
        let tokens = read_number(&entries, &keys.tokens, store_now).unwrap_or(bucket.capacity());
        let last_refill = read_number(&entries, &keys.timestamp, store_now).unwrap_or(0);
        let previous = BucketState { tokens, last_refill };

        let (decision, state) = bucket.acquire(Some(&previous), request.now, request.requested);

        let expires_at = store_now.saturating_add(bucket.expiry().as_nanos() as u64);
        entries.map.insert(
            keys.tokens.clone(),
            Entry {
                value: state.tokens.to_string(),
                expires_at,
            },
        );
        entries.map.insert(
            keys.timestamp.clone(),
            Entry {
                value: state.last_refill.to_string(),
                expires_at,
            },
        );

        trace!(
            key = %keys.tokens,
            allowed = decision.allowed,
            tokens = decision.tokens,
            "Evaluated bucket in memory store"
        );

        Ok(decision)
    }
}
