// src/test_utils.rs

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, ManualClock};
use crate::config::{FailurePolicy, InMemoryConfig, RateLimiterConfig, StrategyConfig};
use crate::error::{Result, StorageError};
use crate::limiter::RateLimiter;
use crate::storage::{
    CounterOutcome, MemberAdmission, MemoryStorage, StorageBackend, TokenOutcome, TokenRequest,
};

/// Start of every test timeline; a whole number of minutes since the epoch
/// so minute windows begin exactly here.
pub const TEST_EPOCH_MS: u64 = 1_699_999_980_000;

pub fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(TEST_EPOCH_MS))
}

/// In-memory store without the background sweeper, on `clock`
pub fn memory_storage(clock: Arc<ManualClock>) -> MemoryStorage {
    let config = InMemoryConfig {
        use_background_task: false,
        ..InMemoryConfig::default()
    };
    MemoryStorage::with_clock(config, clock as Arc<dyn Clock>)
}

/// Helper function to create a test rate limiter over an in-memory store.
/// The engine and the store share the returned clock.
pub fn create_test_rate_limiter() -> (RateLimiter<MemoryStorage>, Arc<ManualClock>) {
    create_test_rate_limiter_with(RateLimiterConfig {
        key_prefix: "test".to_string(),
        ..RateLimiterConfig::default()
    })
}

pub fn create_test_rate_limiter_with(
    config: RateLimiterConfig,
) -> (RateLimiter<MemoryStorage>, Arc<ManualClock>) {
    let clock = test_clock();
    let storage = Arc::new(memory_storage(Arc::clone(&clock)));
    let limiter = RateLimiter::with_clock(storage, config, clock.clone() as Arc<dyn Clock>);
    (limiter, clock)
}

/// Engine over a [`FailingStorage`], breaker disabled unless `config` says
/// otherwise.
pub fn create_failing_rate_limiter(
    policy: FailurePolicy,
) -> (RateLimiter<FailingStorage>, Arc<FailingStorage>, Arc<ManualClock>) {
    create_failing_rate_limiter_with(RateLimiterConfig {
        key_prefix: "test".to_string(),
        failure_policy: policy,
        circuit_breaker: None,
        ..RateLimiterConfig::default()
    })
}

pub fn create_failing_rate_limiter_with(
    config: RateLimiterConfig,
) -> (RateLimiter<FailingStorage>, Arc<FailingStorage>, Arc<ManualClock>) {
    let clock = test_clock();
    let storage = Arc::new(FailingStorage::new(memory_storage(Arc::clone(&clock))));
    let limiter = RateLimiter::with_clock(
        Arc::clone(&storage),
        config,
        clock.clone() as Arc<dyn Clock>,
    );
    (limiter, storage, clock)
}

/// Run `requests` checks back to back and count how many were allowed
pub async fn count_allowed<S>(
    limiter: &RateLimiter<S>,
    identifier: &str,
    config: &StrategyConfig,
    requests: usize,
) -> usize
where
    S: StorageBackend,
{
    let mut allowed = 0;
    for _ in 0..requests {
        let decision = limiter.check(identifier, config).await.unwrap();
        if decision.allowed {
            allowed += 1;
        }
    }
    allowed
}

/// A store whose outages are switched on and off by the test.
///
/// While `failing` is set every call returns a connection error; while
/// `stalled` is set every call hangs. Otherwise calls go to the wrapped
/// in-memory store. `calls` counts every attempted round trip.
#[derive(Debug)]
pub struct FailingStorage {
    inner: MemoryStorage,
    failing: AtomicBool,
    stalled: AtomicBool,
    calls: AtomicUsize,
}

impl FailingStorage {
    pub fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::RedisConnection("simulated store outage".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FailingStorage {
    type Config = InMemoryConfig;

    async fn new(config: Self::Config) -> Result<Self> {
        Ok(Self::new(MemoryStorage::new(config)))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.gate().await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.gate().await?;
        self.inner.set(key, value, ttl).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.gate().await?;
        self.inner.exists(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.gate().await?;
        self.inner.delete(key).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        self.gate().await?;
        self.inner.delete_many(keys).await
    }

    async fn ping(&self) -> Result<()> {
        self.gate().await?;
        self.inner.ping().await
    }

    async fn take_tokens(&self, key: &str, request: &TokenRequest) -> Result<TokenOutcome> {
        self.gate().await?;
        self.inner.take_tokens(key, request).await
    }

    async fn increment_below(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<CounterOutcome> {
        self.gate().await?;
        self.inner.increment_below(key, limit, ttl).await
    }

    async fn increment_window(
        &self,
        keys: &[String],
        limit: u64,
        ttl: Duration,
    ) -> Result<CounterOutcome> {
        self.gate().await?;
        self.inner.increment_window(keys, limit, ttl).await
    }

    async fn admit_member(
        &self,
        key: &str,
        admission: &MemberAdmission,
    ) -> Result<CounterOutcome> {
        self.gate().await?;
        self.inner.admit_member(key, admission).await
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<bool> {
        self.gate().await?;
        self.inner.remove_member(key, member).await
    }
}
