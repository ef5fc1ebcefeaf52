//! Token bucket rate limiting, in process or through a shared store.

mod backend;
mod bucket;
mod clock;
mod distributed;
mod local;

pub use backend::RateLimiterBackend;
pub use bucket::{BucketState, Decision, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::DistributedRateLimiter;
pub use local::LocalRateLimiter;
