// src/algorithms/sliding_window.rs

use crate::algorithms::{as_millis, state_key, RateLimitAlgorithm, RateLimitStatus};
use crate::config::{SlidingWindowConfig, StrategyKind};
use crate::error::Result;
use crate::storage::{MemberAdmission, StorageBackend};
use async_trait::async_trait;
use uuid::Uuid;

/// Sliding Window Log rate limiting algorithm
///
/// Keeps one timestamped entry per accepted request and counts the entries
/// inside the trailing window. Exact, at the cost of one stored entry per
/// request in flight through the window.
#[derive(Debug)]
pub struct SlidingWindow<'a, S>
where
    S: StorageBackend,
{
    /// Storage backend for the request log
    storage: &'a S,

    /// Configuration for the sliding window
    config: &'a SlidingWindowConfig,

    key_prefix: &'a str,
}

impl<'a, S> SlidingWindow<'a, S>
where
    S: StorageBackend,
{
    /// Creates a new sliding window with the given storage and configuration
    pub fn new(storage: &'a S, config: &'a SlidingWindowConfig, key_prefix: &'a str) -> Self {
        Self {
            storage,
            config,
            key_prefix,
        }
    }

    fn key(&self, identifier: &str) -> String {
        state_key(self.key_prefix, StrategyKind::SlidingWindow, identifier)
    }
}

#[async_trait]
impl<'a, S> RateLimitAlgorithm for SlidingWindow<'a, S>
where
    S: StorageBackend,
{
    fn kind(&self) -> StrategyKind {
        StrategyKind::SlidingWindow
    }

    async fn check_and_record(&self, identifier: &str, now_ms: u64) -> Result<RateLimitStatus> {
        let window = as_millis(self.config.window_size);

        // Two requests in the same millisecond still need distinct entries
        let admission = MemberAdmission {
            member: format!("{}-{}", now_ms, Uuid::new_v4()),
            score_ms: now_ms,
            min_score_ms: now_ms.saturating_sub(window),
            limit: self.config.limit,
            ttl: self.config.window_size,
        };
        let outcome = self
            .storage
            .admit_member(&self.key(identifier), &admission)
            .await?;

        Ok(RateLimitStatus {
            allowed: outcome.allowed,
            remaining: self.config.limit.saturating_sub(outcome.count),
            limit: self.config.limit,
            reset_time: now_ms.saturating_add(window),
            request_id: None,
        })
    }

    async fn reset(&self, identifier: &str, _now_ms: u64) -> Result<bool> {
        self.storage.delete(&self.key(identifier)).await
    }
}
