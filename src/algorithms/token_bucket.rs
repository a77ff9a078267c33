// src/algorithms/token_bucket.rs

use crate::algorithms::{state_key, RateLimitAlgorithm, RateLimitStatus};
use crate::config::{StrategyKind, TokenBucketConfig};
use crate::error::Result;
use crate::storage::{StorageBackend, TokenRequest};
use async_trait::async_trait;
use std::time::Duration;

/// Bucket state is dropped after this long without a check
const IDLE_TTL: Duration = Duration::from_secs(60 * 60);

/// Token Bucket rate limiting algorithm
///
/// The token bucket algorithm works by maintaining a "bucket" of tokens that are
/// replenished at a constant rate. Each request consumes `tokens_requested`
/// tokens, and if there are not enough tokens available, the request is
/// rejected. Bursts up to `capacity` pass straight through.
#[derive(Debug)]
pub struct TokenBucket<'a, S>
where
    S: StorageBackend,
{
    /// Storage backend for persisting bucket state
    storage: &'a S,

    /// Configuration for the token bucket
    config: &'a TokenBucketConfig,

    key_prefix: &'a str,
}

impl<'a, S> TokenBucket<'a, S>
where
    S: StorageBackend,
{
    /// Creates a new token bucket with the given storage and configuration
    pub fn new(storage: &'a S, config: &'a TokenBucketConfig, key_prefix: &'a str) -> Self {
        Self {
            storage,
            config,
            key_prefix,
        }
    }

    fn key(&self, identifier: &str) -> String {
        state_key(self.key_prefix, StrategyKind::TokenBucket, identifier)
    }

    /// Milliseconds until the bucket is full again. The float-to-int cast
    /// saturates for very slow refill rates.
    fn refill_delay_ms(&self, tokens: f64) -> u64 {
        let missing = (self.config.capacity as f64 - tokens).max(0.0);
        (missing / self.config.refill_rate * 1000.0).ceil() as u64
    }
}

#[async_trait]
impl<'a, S> RateLimitAlgorithm for TokenBucket<'a, S>
where
    S: StorageBackend,
{
    fn kind(&self) -> StrategyKind {
        StrategyKind::TokenBucket
    }

    async fn check_and_record(&self, identifier: &str, now_ms: u64) -> Result<RateLimitStatus> {
        let request = TokenRequest {
            capacity: self.config.capacity as f64,
            refill_rate: self.config.refill_rate,
            requested: self.config.tokens_requested as f64,
            now_ms,
            ttl: IDLE_TTL,
        };
        let outcome = self
            .storage
            .take_tokens(&self.key(identifier), &request)
            .await?;

        Ok(RateLimitStatus {
            allowed: outcome.allowed,
            remaining: outcome.tokens.max(0.0).floor() as u64,
            limit: self.config.capacity,
            reset_time: now_ms.saturating_add(self.refill_delay_ms(outcome.tokens)),
            request_id: None,
        })
    }

    async fn reset(&self, identifier: &str, _now_ms: u64) -> Result<bool> {
        self.storage.delete(&self.key(identifier)).await
    }
}
