// src/algorithms/mod.rs

pub mod concurrency;
pub mod fixed_window;
pub mod sliding_window;
pub mod sliding_window_counter;
pub mod token_bucket;

#[cfg(test)]
mod tests;

pub use concurrency::ConcurrencyLimiter;
pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;
pub use sliding_window_counter::SlidingWindowCounter;
pub use token_bucket::TokenBucket;

use super::config::StrategyKind;
use super::error::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// Status returned by rate limiting operations
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStatus {
    /// Whether the request was allowed
    pub allowed: bool,

    /// Capacity left after this request
    pub remaining: u64,

    /// Total capacity of the rate limiter
    pub limit: u64,

    /// When capacity is next restored, epoch milliseconds
    pub reset_time: u64,

    /// Slot handle, set only by the concurrency limiter on admission
    pub request_id: Option<String>,
}

/// Core trait that all rate limiting algorithms must implement
///
/// `check_and_record` is a single store round trip; the decision and the
/// state update happen together at the store.
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync + Debug {
    fn kind(&self) -> StrategyKind;

    /// Decide whether one request for `identifier` may proceed at `now_ms`
    /// and, if so, account for it.
    async fn check_and_record(&self, identifier: &str, now_ms: u64) -> Result<RateLimitStatus>;

    /// Drop the persisted state for `identifier`. Returns whether anything
    /// was there.
    async fn reset(&self, identifier: &str, now_ms: u64) -> Result<bool>;
}

/// Storage key for one identifier under one strategy.
///
/// The identifier is wrapped in a hash tag so every key belonging to it
/// lands on the same Redis Cluster slot.
pub(crate) fn state_key(prefix: &str, kind: StrategyKind, identifier: &str) -> String {
    format!("{prefix}:{kind}:{{{identifier}}}")
}

pub(crate) use crate::clock::duration_millis as as_millis;
