// src/algorithms/concurrency.rs

use crate::algorithms::{as_millis, state_key, RateLimitAlgorithm, RateLimitStatus};
use crate::config::{ConcurrencyConfig, StrategyKind};
use crate::error::Result;
use crate::storage::{MemberAdmission, StorageBackend};
use async_trait::async_trait;
use uuid::Uuid;

/// Concurrency limiter
///
/// Bounds how many operations for one identifier are in flight at once.
/// Each admitted request holds a slot until [`release`] is called with the
/// returned request id. Slots older than `timeout` are treated as abandoned
/// by a crashed caller and reclaimed on the next check; the timeout is a
/// safety net, not the release path.
#[derive(Debug)]
pub struct ConcurrencyLimiter<'a, S>
where
    S: StorageBackend,
{
    storage: &'a S,

    config: &'a ConcurrencyConfig,

    key_prefix: &'a str,
}

impl<'a, S> ConcurrencyLimiter<'a, S>
where
    S: StorageBackend,
{
    pub fn new(storage: &'a S, config: &'a ConcurrencyConfig, key_prefix: &'a str) -> Self {
        Self {
            storage,
            config,
            key_prefix,
        }
    }
}

fn slots_key(key_prefix: &str, identifier: &str) -> String {
    state_key(key_prefix, StrategyKind::Concurrent, identifier)
}

/// Give back the slot held by `request_id`. Unknown ids are a no-op.
pub async fn release<S>(
    storage: &S,
    key_prefix: &str,
    identifier: &str,
    request_id: &str,
) -> Result<bool>
where
    S: StorageBackend,
{
    storage
        .remove_member(&slots_key(key_prefix, identifier), request_id)
        .await
}

#[async_trait]
impl<'a, S> RateLimitAlgorithm for ConcurrencyLimiter<'a, S>
where
    S: StorageBackend,
{
    fn kind(&self) -> StrategyKind {
        StrategyKind::Concurrent
    }

    async fn check_and_record(&self, identifier: &str, now_ms: u64) -> Result<RateLimitStatus> {
        let timeout = as_millis(self.config.timeout);
        let request_id = Uuid::new_v4().to_string();

        let admission = MemberAdmission {
            member: request_id.clone(),
            score_ms: now_ms,
            min_score_ms: now_ms.saturating_sub(timeout),
            limit: self.config.max_concurrent,
            ttl: self.config.timeout,
        };
        let outcome = self
            .storage
            .admit_member(&slots_key(self.key_prefix, identifier), &admission)
            .await?;

        Ok(RateLimitStatus {
            allowed: outcome.allowed,
            remaining: self.config.max_concurrent.saturating_sub(outcome.count),
            limit: self.config.max_concurrent,
            // latest moment a held slot is reclaimed without a release
            reset_time: now_ms.saturating_add(timeout),
            request_id: outcome.allowed.then_some(request_id),
        })
    }

    async fn reset(&self, identifier: &str, _now_ms: u64) -> Result<bool> {
        self.storage
            .delete(&slots_key(self.key_prefix, identifier))
            .await
    }
}
