// src/algorithms/fixed_window.rs

use crate::algorithms::{as_millis, state_key, RateLimitAlgorithm, RateLimitStatus};
use crate::config::{FixedWindowConfig, StrategyKind};
use crate::error::Result;
use crate::storage::StorageBackend;
use async_trait::async_trait;
use std::time::Duration;

/// Fixed Window rate limiting algorithm
///
/// The fixed window algorithm divides time into fixed windows aligned to the
/// epoch (e.g., 1 minute) and limits the number of requests in each window.
/// When a new window starts, the counter resets. Up to twice the limit can
/// pass in a short span straddling a window boundary.
#[derive(Debug)]
pub struct FixedWindow<'a, S>
where
    S: StorageBackend,
{
    /// Storage backend for persisting window counters
    storage: &'a S,

    /// Configuration for the fixed window
    config: &'a FixedWindowConfig,

    key_prefix: &'a str,
}

impl<'a, S> FixedWindow<'a, S>
where
    S: StorageBackend,
{
    /// Creates a new fixed window with the given storage and configuration
    pub fn new(storage: &'a S, config: &'a FixedWindowConfig, key_prefix: &'a str) -> Self {
        Self {
            storage,
            config,
            key_prefix,
        }
    }

    /// Start of the window containing `now_ms`
    fn window_start(&self, now_ms: u64) -> u64 {
        let window = as_millis(self.config.window_size);
        now_ms - (now_ms % window)
    }

    fn counter_key(&self, identifier: &str, window_start: u64) -> String {
        format!(
            "{}:{}",
            state_key(self.key_prefix, StrategyKind::FixedWindow, identifier),
            window_start
        )
    }
}

#[async_trait]
impl<'a, S> RateLimitAlgorithm for FixedWindow<'a, S>
where
    S: StorageBackend,
{
    fn kind(&self) -> StrategyKind {
        StrategyKind::FixedWindow
    }

    async fn check_and_record(&self, identifier: &str, now_ms: u64) -> Result<RateLimitStatus> {
        let window_start = self.window_start(now_ms);
        let window_end = window_start.saturating_add(as_millis(self.config.window_size));

        // the counter lives exactly as long as its window
        let ttl = Duration::from_millis(window_end - now_ms);
        let outcome = self
            .storage
            .increment_below(
                &self.counter_key(identifier, window_start),
                self.config.limit,
                ttl,
            )
            .await?;

        Ok(RateLimitStatus {
            allowed: outcome.allowed,
            remaining: self.config.limit.saturating_sub(outcome.count),
            limit: self.config.limit,
            reset_time: window_end,
            request_id: None,
        })
    }

    async fn reset(&self, identifier: &str, now_ms: u64) -> Result<bool> {
        let window_start = self.window_start(now_ms);
        self.storage
            .delete(&self.counter_key(identifier, window_start))
            .await
    }
}
