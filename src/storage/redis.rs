// src/storage/redis.rs

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisResult, Script};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::duration_millis;
use crate::config::RedisConfig;
use crate::error::{RateLimiterError, Result, StorageError};
use crate::storage::scripts;
use crate::storage::{
    CounterOutcome, MemberAdmission, StorageBackend, TokenOutcome, TokenRequest,
};

/// Compiled forms of the Lua scripts. `Script` sends EVALSHA first and
/// falls back to EVAL when the server has not cached the body yet.
struct Scripts {
    take_tokens: Script,
    increment_below: Script,
    increment_window: Script,
    admit_member: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            take_tokens: Script::new(scripts::TAKE_TOKENS),
            increment_below: Script::new(scripts::INCREMENT_BELOW),
            increment_window: Script::new(scripts::INCREMENT_WINDOW),
            admit_member: Script::new(scripts::ADMIT_MEMBER),
        }
    }
}

/// Redis-backed shared store.
///
/// `ConnectionManager` multiplexes one connection and reconnects on its
/// own; each call works on a cheap clone of it.
#[derive(Clone)]
pub struct RedisStorage {
    connection: ConnectionManager,
    scripts: Arc<Scripts>,
    config: RedisConfig,
}

// Manually implement Debug
impl fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStorage")
            .field("url", &self.config.url)
            .field("connection_timeout", &self.config.connection_timeout)
            .finish()
    }
}

/// Redis rejects expiries whose absolute time overflows a signed 64-bit
/// millisecond count, so very long TTLs are clamped below that.
const MAX_TTL_MS: u64 = i64::MAX as u64 / 2;

/// TTL as a PEXPIRE/PX argument: at least 1ms and never past [`MAX_TTL_MS`]
pub(crate) fn millis(ttl: Duration) -> u64 {
    duration_millis(ttl).clamp(1, MAX_TTL_MS)
}

impl RedisStorage {
    /// Creates a new Redis storage with the given configuration
    pub async fn new(config: RedisConfig) -> Result<Self> {
        // Open the client - this doesn't actually connect to Redis yet
        let client = Client::open(config.url.as_str())
            .map_err(|e| RateLimiterError::Storage(StorageError::RedisConnection(e.to_string())))?;

        let connection_future = ConnectionManager::new(client);
        let connection =
            match tokio::time::timeout(config.connection_timeout, connection_future).await {
                Ok(result) => result.map_err(|e| {
                    RateLimiterError::Storage(StorageError::RedisConnection(e.to_string()))
                })?,
                Err(_) => {
                    return Err(RateLimiterError::Storage(StorageError::RedisConnection(
                        format!(
                            "Connection to Redis at {} timed out after {:?}",
                            config.url, config.connection_timeout
                        ),
                    )));
                }
            };

        Ok(Self {
            connection,
            scripts: Arc::new(Scripts::load()),
            config,
        })
    }

    async fn timed<T, F>(&self, operation: &'static str, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>> + Send,
    {
        let started = Instant::now();
        let result = fut.await.map_err(RateLimiterError::from);
        crate::storage_op!(operation, key, result, started.elapsed().as_millis() as u64);
        result
    }
}

#[async_trait]
impl StorageBackend for RedisStorage {
    type Config = RedisConfig;

    async fn new(config: Self::Config) -> Result<Self> {
        Self::new(config).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        self.timed("get", key, conn.get(key)).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection.clone();
        match ttl {
            Some(ttl) => {
                self.timed("pset_ex", key, conn.pset_ex(key, value, millis(ttl)))
                    .await
            }
            None => self.timed("set", key, conn.set(key, value)).await,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        self.timed("exists", key, conn.exists(key)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = self.timed("del", key, conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        let Some(first) = keys.first() else {
            return Ok(0);
        };
        let mut conn = self.connection.clone();
        self.timed("del", first, conn.del(keys.to_vec())).await
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let reply: String = self
            .timed("ping", "", redis::cmd("PING").query_async(&mut conn))
            .await?;

        if reply == "PONG" {
            Ok(())
        } else {
            Err(RateLimiterError::Storage(StorageError::RedisCommand(
                format!("Unexpected response from Redis PING: {}", reply),
            )))
        }
    }

    async fn take_tokens(&self, key: &str, request: &TokenRequest) -> Result<TokenOutcome> {
        let mut conn = self.connection.clone();
        let mut invocation = self.scripts.take_tokens.prepare_invoke();
        invocation
            .key(key)
            .arg(request.capacity)
            .arg(request.refill_rate)
            .arg(request.requested)
            .arg(request.now_ms)
            .arg(millis(request.ttl));

        let (allowed, tokens): (i64, String) = self
            .timed("take_tokens", key, invocation.invoke_async(&mut conn))
            .await?;
        let tokens = tokens.parse::<f64>().map_err(|e| {
            RateLimiterError::Storage(StorageError::Serialization(format!(
                "token count '{tokens}' is not a number: {e}"
            )))
        })?;

        Ok(TokenOutcome {
            allowed: allowed == 1,
            tokens,
        })
    }

    async fn increment_below(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<CounterOutcome> {
        let mut conn = self.connection.clone();
        let mut invocation = self.scripts.increment_below.prepare_invoke();
        invocation.key(key).arg(limit).arg(millis(ttl));

        let (allowed, count): (i64, u64) = self
            .timed("increment_below", key, invocation.invoke_async(&mut conn))
            .await?;
        Ok(CounterOutcome {
            allowed: allowed == 1,
            count,
        })
    }

    async fn increment_window(
        &self,
        keys: &[String],
        limit: u64,
        ttl: Duration,
    ) -> Result<CounterOutcome> {
        let Some(newest) = keys.last() else {
            return Err(RateLimiterError::Internal(
                "increment_window needs at least one key".to_string(),
            ));
        };

        let mut conn = self.connection.clone();
        let mut invocation = self.scripts.increment_window.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation.arg(limit).arg(millis(ttl));

        let (allowed, count): (i64, u64) = self
            .timed("increment_window", newest, invocation.invoke_async(&mut conn))
            .await?;
        Ok(CounterOutcome {
            allowed: allowed == 1,
            count,
        })
    }

    async fn admit_member(
        &self,
        key: &str,
        admission: &MemberAdmission,
    ) -> Result<CounterOutcome> {
        let mut conn = self.connection.clone();
        let mut invocation = self.scripts.admit_member.prepare_invoke();
        invocation
            .key(key)
            .arg(admission.min_score_ms)
            .arg(admission.limit)
            .arg(admission.score_ms)
            .arg(&admission.member)
            .arg(millis(admission.ttl));

        let (allowed, count): (i64, u64) = self
            .timed("admit_member", key, invocation.invoke_async(&mut conn))
            .await?;
        Ok(CounterOutcome {
            allowed: allowed == 1,
            count,
        })
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = self.timed("zrem", key, conn.zrem(key, member)).await?;
        Ok(removed > 0)
    }
}
