// src/storage/mod.rs
//! The shared counter store.
//!
//! Every process that enforces a limit talks to the same store, so the
//! store is the only point of coordination. Each compound operation on
//! [`StorageBackend`] (`take_tokens`, `increment_below`, `increment_window`,
//! `admit_member`) runs as one indivisible read-compute-write at the store:
//! two concurrent callers can never both observe the same pre-update state.

pub mod memory;
pub mod redis;
mod scripts;

#[cfg(test)]
mod tests;

pub use memory::MemoryStorage;
pub use redis::RedisStorage;

use super::error::{Result, StorageError};
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

/// Inputs for one refill-and-take against a token bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRequest {
    pub capacity: f64,
    /// Tokens per second
    pub refill_rate: f64,
    pub requested: f64,
    pub now_ms: u64,
    /// Idle expiry for the bucket state
    pub ttl: Duration,
}

/// Bucket state after a refill-and-take.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenOutcome {
    pub allowed: bool,
    /// Tokens left after this request
    pub tokens: f64,
}

/// Result of a conditional increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterOutcome {
    pub allowed: bool,
    /// Count after the operation; includes this request when allowed
    pub count: u64,
}

/// Inputs for a prune-count-add against an ordered set.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberAdmission {
    pub member: String,
    /// Score of the new member, epoch milliseconds
    pub score_ms: u64,
    /// Members scored strictly below this are removed first
    pub min_score_ms: u64,
    pub limit: u64,
    pub ttl: Duration,
}

/// Core trait that all storage backends must implement
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    // The type of configuration this storage backend accepts
    type Config: Send + Sync;

    // Creates a new instance of this storage backend with the given configuration
    async fn new(config: Self::Config) -> Result<Self>
    where
        Self: Sized;

    // Retrieves a value by key
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    // Stores a value with a key
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    // Checks if a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    // Deletes a key
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Deletes several keys at once, returning how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<u64>;

    /// Round trip used for health checks.
    async fn ping(&self) -> Result<()>;

    /// Refill a token bucket for the elapsed time, then take
    /// `requested` tokens if that many are available. Absent state starts
    /// full.
    async fn take_tokens(&self, key: &str, request: &TokenRequest) -> Result<TokenOutcome>;

    /// Increment the counter at `key` only if it is currently below
    /// `limit`. The key expires after `ttl`.
    async fn increment_below(&self, key: &str, limit: u64, ttl: Duration)
        -> Result<CounterOutcome>;

    /// Sum the counters at `keys`; if the sum is below `limit`, increment
    /// the last key and give it `ttl`.
    async fn increment_window(
        &self,
        keys: &[String],
        limit: u64,
        ttl: Duration,
    ) -> Result<CounterOutcome>;

    /// Drop members scored below `min_score_ms`, count the rest and add the
    /// new member if the count is below `limit`. The set expires after `ttl`.
    async fn admit_member(&self, key: &str, admission: &MemberAdmission)
        -> Result<CounterOutcome>;

    /// Remove one member from an ordered set.
    async fn remove_member(&self, key: &str, member: &str) -> Result<bool>;
}

/// Run one store round trip, giving up after `limit`.
pub(crate) async fn bounded<T, F>(limit: Duration, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout(format!(
            "{operation} did not finish within {}ms",
            limit.as_millis()
        ))
        .into()),
    }
}
