// src/algorithms/sliding_window_counter.rs

use crate::algorithms::{as_millis, state_key, RateLimitAlgorithm, RateLimitStatus};
use crate::config::{SlidingWindowCounterConfig, StrategyKind};
use crate::error::Result;
use crate::storage::StorageBackend;
use async_trait::async_trait;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Sliding Window Counter rate limiting algorithm
///
/// The window is divided into `sub_windows` equal buckets and the most recent
/// `sub_windows` buckets are summed as an estimate of the exact sliding
/// count. Memory is bounded by the bucket count no matter the traffic.
///
/// Any `sub_windows` consecutive buckets never hold more than `limit`
/// accepted requests. A real window-length interval that is not aligned to
/// bucket edges overlaps one extra bucket; for evenly paced traffic it sees
/// at most `limit + limit / sub_windows` accepted requests. Bursts packed at
/// both edges of an unaligned interval can approach `2 * limit`, as with a
/// fixed window.
#[derive(Debug)]
pub struct SlidingWindowCounter<'a, S>
where
    S: StorageBackend,
{
    /// Storage backend for persisting bucket counters
    storage: &'a S,

    config: &'a SlidingWindowCounterConfig,

    key_prefix: &'a str,
}

impl<'a, S> SlidingWindowCounter<'a, S>
where
    S: StorageBackend,
{
    pub fn new(
        storage: &'a S,
        config: &'a SlidingWindowCounterConfig,
        key_prefix: &'a str,
    ) -> Self {
        Self {
            storage,
            config,
            key_prefix,
        }
    }

    /// Bucket width in milliseconds. Validation guarantees at least 1ms.
    fn bucket_size_ms(&self) -> u64 {
        (as_millis(self.config.window_size) / u64::from(self.config.sub_windows)).max(1)
    }

    /// Bucket ids that make up the window ending in the bucket of `now_ms`
    fn bucket_range(&self, now_ms: u64) -> RangeInclusive<u64> {
        let current = now_ms / self.bucket_size_ms();
        let oldest = current.saturating_sub(u64::from(self.config.sub_windows) - 1);
        oldest..=current
    }

    fn bucket_keys(&self, identifier: &str, now_ms: u64) -> Vec<String> {
        let base = state_key(
            self.key_prefix,
            StrategyKind::SlidingWindowCounter,
            identifier,
        );
        self.bucket_range(now_ms)
            .map(|id| format!("{base}:{id}"))
            .collect()
    }
}

#[async_trait]
impl<'a, S> RateLimitAlgorithm for SlidingWindowCounter<'a, S>
where
    S: StorageBackend,
{
    fn kind(&self) -> StrategyKind {
        StrategyKind::SlidingWindowCounter
    }

    async fn check_and_record(&self, identifier: &str, now_ms: u64) -> Result<RateLimitStatus> {
        let bucket_size = self.bucket_size_ms();
        let keys = self.bucket_keys(identifier, now_ms);

        // A bucket has to outlive every window it belongs to, which is
        // sub_windows buckets after its own, plus one bucket of slack.
        let ttl = Duration::from_millis(
            bucket_size.saturating_mul(u64::from(self.config.sub_windows) + 1),
        );
        let outcome = self
            .storage
            .increment_window(&keys, self.config.limit, ttl)
            .await?;

        // the oldest bucket leaves the window when the current one ends
        let reset_time = (now_ms / bucket_size)
            .saturating_add(1)
            .saturating_mul(bucket_size);

        Ok(RateLimitStatus {
            allowed: outcome.allowed,
            remaining: self.config.limit.saturating_sub(outcome.count),
            limit: self.config.limit,
            reset_time,
            request_id: None,
        })
    }

    async fn reset(&self, identifier: &str, now_ms: u64) -> Result<bool> {
        let removed = self
            .storage
            .delete_many(&self.bucket_keys(identifier, now_ms))
            .await?;
        Ok(removed > 0)
    }
}
