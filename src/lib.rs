//! Bucketgate - Token Bucket Rate Limiting
//!
//! This crate decides whether a keyed call may proceed using the token bucket
//! algorithm. `LocalRateLimiter` keeps buckets in process memory, while
//! `DistributedRateLimiter` keeps them in a shared store that applies each
//! update atomically, so several instances enforce one limit per key without
//! a coordinator. Both implement `RateLimiterBackend` and can be swapped
//! without touching call sites.

pub mod config;
pub mod error;
pub mod harness;
pub mod ratelimit;
pub mod store;

pub use error::{LimiterError, Result};
pub use ratelimit::{DistributedRateLimiter, LocalRateLimiter, RateLimiterBackend};
