//! Token bucket arithmetic shared by every limiter and store.

use std::time::Duration;

use crate::error::{LimiterError, Result};

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Stored state of one key's bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens left after the last decision, in `[0, capacity]`
    pub tokens: f64,
    /// Unix nanoseconds of the last decision
    pub last_refill: u64,
}

/// Outcome of a single admission decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the requested tokens were granted
    pub allowed: bool,
    /// Tokens left in the bucket after this decision
    pub tokens: f64,
}

/// Refill rate and capacity of a token bucket.
///
/// This type holds no per-key state. It turns a previous [`BucketState`] and
/// a timestamp into a decision plus the state to store back, so the same
/// arithmetic runs in process memory and inside the shared store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    /// Tokens added per second
    rate: u32,
    /// Maximum stored tokens
    capacity: u32,
}

impl TokenBucket {
    /// Create a bucket description from tokens per second and capacity.
    pub fn new(rate: u32, capacity: u32) -> Result<Self> {
        if rate == 0 {
            return Err(LimiterError::Config("rate must be positive".to_string()));
        }
        if capacity == 0 {
            return Err(LimiterError::Config("capacity must be positive".to_string()));
        }
        Ok(Self { rate, capacity })
    }

    /// Tokens added per second, as configured.
    pub fn refill_per_sec(&self) -> u32 {
        self.rate
    }

    /// Maximum stored tokens, as configured.
    pub fn max_tokens(&self) -> u32 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.rate as f64
    }

    /// Maximum stored tokens.
    pub fn capacity(&self) -> f64 {
        self.capacity as f64
    }

    /// How long stored state may live before it is certainly full again.
    ///
    /// Twice the time to refill an empty bucket, plus one second, rounded
    /// down to whole seconds.
    pub fn expiry(&self) -> Duration {
        let secs = (2.0 * self.capacity() / self.rate()).floor() as u64 + 1;
        Duration::from_secs(secs)
    }

    /// Token level at `now`, before anything is consumed.
    ///
    /// A missing state is a full bucket. Time running backwards adds nothing.
    pub fn refill(&self, state: Option<&BucketState>, now: u64) -> f64 {
        match state {
            None => self.capacity(),
            Some(state) => {
                let elapsed = now.saturating_sub(state.last_refill) as f64;
                let filled = state.tokens + elapsed * self.rate() / NANOS_PER_SEC;
                filled.clamp(0.0, self.capacity())
            }
        }
    }

    /// Decide whether `requested` tokens may be taken at `now`.
    ///
    /// The returned state must be stored whether or not the request was
    /// allowed: a denied call still records the refilled level and `now`.
    pub fn acquire(
        &self,
        state: Option<&BucketState>,
        now: u64,
        requested: u32,
    ) -> (Decision, BucketState) {
        let filled = self.refill(state, now);
        let requested = requested as f64;
        let allowed = filled >= requested;
        let tokens = if allowed { filled - requested } else { filled };

        (
            Decision { allowed, tokens },
            BucketState {
                tokens,
                last_refill: now,
            },
        )
    }

    /// Whether a stored state would read as a full bucket at `now`.
    ///
    /// Dropping such a state changes no future decision.
    pub fn is_idle(&self, state: &BucketState, now: u64) -> bool {
        self.refill(Some(state), now) >= self.capacity()
    }
}
