// src/storage/memory.rs

// In-memory storage for single-process deployments and tests.
// Every operation takes the map lock once, so each compound operation is
// atomic with respect to every other caller in the process.
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::debug;

use crate::clock::{duration_millis, Clock, SystemClock};
use crate::config::InMemoryConfig;
use crate::error::{RateLimiterError, Result, StorageError};
use crate::storage::{
    CounterOutcome, MemberAdmission, StorageBackend, TokenOutcome, TokenRequest,
};

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Counter(u64),
    Bucket { tokens: f64, last_refill: u64 },
    /// (score, member), ordered by score first
    SortedSet(BTreeSet<(u64, String)>),
}

/// Entry in the in-memory storage
#[derive(Debug)]
struct MemoryEntry {
    value: Value,
    /// Epoch milliseconds
    expires_at: Option<u64>,
}

impl MemoryEntry {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

type Entries = HashMap<String, MemoryEntry>;

/// In-memory storage backend implementation
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    data: Arc<Mutex<Entries>>,
    clock: Arc<dyn Clock>,
    config: InMemoryConfig,
}

impl MemoryStorage {
    /// Creates a new in-memory storage on the system clock
    pub fn new(config: InMemoryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a new in-memory storage whose TTLs follow `clock`
    pub fn with_clock(config: InMemoryConfig, clock: Arc<dyn Clock>) -> Self {
        let data = Arc::new(Mutex::new(HashMap::with_capacity(
            config.max_entries.min(10_000),
        )));

        if config.use_background_task && !config.cleanup_interval.is_zero() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    // The sweeper holds a weak reference and stops once every
                    // clone of this storage is gone.
                    let weak = Arc::downgrade(&data);
                    let sweep_clock = Arc::clone(&clock);
                    let every = config.cleanup_interval;
                    handle.spawn(async move {
                        let mut ticker = time::interval(every);
                        ticker.tick().await;
                        loop {
                            ticker.tick().await;
                            let Some(data) = weak.upgrade() else { break };
                            let removed =
                                Self::cleanup_expired_entries(&data, sweep_clock.now_millis());
                            if removed > 0 {
                                debug!(removed, "Swept expired in-memory entries");
                            }
                        }
                    });
                }
                Err(_) => debug!("No tokio runtime, expired entries are purged lazily"),
            }
        }

        Self {
            data,
            clock,
            config,
        }
    }

    /// Number of unexpired entries
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.data.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries held in the map, expired or not
    #[cfg(test)]
    pub(crate) fn stored_entries(&self) -> usize {
        self.data.lock().len()
    }

    /// Clean up expired entries
    fn cleanup_expired_entries(data: &Mutex<Entries>, now: u64) -> usize {
        let mut data = data.lock();
        let before = data.len();
        data.retain(|_, entry| entry.is_live(now));
        before - data.len()
    }

    fn purge_if_expired(data: &mut Entries, key: &str, now: u64) {
        if data.get(key).is_some_and(|entry| !entry.is_live(now)) {
            data.remove(key);
        }
    }

    fn ensure_capacity(&self, data: &mut Entries, key: &str, now: u64) -> Result<()> {
        if data.contains_key(key) || data.len() < self.config.max_entries {
            return Ok(());
        }
        data.retain(|_, entry| entry.is_live(now));
        if data.len() < self.config.max_entries {
            Ok(())
        } else {
            Err(RateLimiterError::Storage(StorageError::CapacityExceeded(
                "Maximum entries limit exceeded".to_string(),
            )))
        }
    }

    fn expiry(now: u64, ttl: Duration) -> Option<u64> {
        Some(now.saturating_add(duration_millis(ttl)))
    }

    fn counter(data: &Entries, key: &str) -> Result<u64> {
        match data.get(key).map(|entry| &entry.value) {
            None => Ok(0),
            Some(Value::Counter(n)) => Ok(*n),
            Some(_) => Err(wrong_type(key)),
        }
    }
}

fn wrong_type(key: &str) -> RateLimiterError {
    RateLimiterError::Storage(StorageError::Serialization(format!(
        "key '{key}' holds a value of another type"
    )))
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    type Config = InMemoryConfig;

    async fn new(config: Self::Config) -> Result<Self> {
        Ok(Self::new(config))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now_millis();
        let mut data = self.data.lock();
        Self::purge_if_expired(&mut data, key, now);

        match data.get(key).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(Value::Counter(n)) => Ok(Some(n.to_string().into_bytes())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let now = self.clock.now_millis();
        let mut data = self.data.lock();
        Self::purge_if_expired(&mut data, key, now);
        self.ensure_capacity(&mut data, key, now)?;

        data.insert(
            key.to_string(),
            MemoryEntry {
                value: Value::Bytes(value.to_vec()),
                expires_at: ttl.and_then(|ttl| Self::expiry(now, ttl)),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = self.clock.now_millis();
        let mut data = self.data.lock();
        Self::purge_if_expired(&mut data, key, now);
        Ok(data.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now_millis();
        let mut data = self.data.lock();
        Ok(data.remove(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        let now = self.clock.now_millis();
        let mut data = self.data.lock();
        let removed = keys
            .iter()
            .filter_map(|key| data.remove(key))
            .filter(|entry| entry.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn take_tokens(&self, key: &str, request: &TokenRequest) -> Result<TokenOutcome> {
        let now = self.clock.now_millis();
        let mut data = self.data.lock();
        Self::purge_if_expired(&mut data, key, now);

        let (tokens, last_refill) = match data.get(key).map(|entry| &entry.value) {
            None => (request.capacity, request.now_ms),
            Some(Value::Bucket {
                tokens,
                last_refill,
            }) => (*tokens, *last_refill),
            Some(_) => return Err(wrong_type(key)),
        };

        let elapsed = request.now_ms.saturating_sub(last_refill) as f64 / 1000.0;
        let mut tokens = request
            .capacity
            .min(tokens + elapsed * request.refill_rate);
        let allowed = tokens >= request.requested;
        if allowed {
            tokens -= request.requested;
        }

        self.ensure_capacity(&mut data, key, now)?;
        data.insert(
            key.to_string(),
            MemoryEntry {
                value: Value::Bucket {
                    tokens,
                    last_refill: request.now_ms,
                },
                expires_at: Self::expiry(now, request.ttl),
            },
        );

        Ok(TokenOutcome { allowed, tokens })
    }

    async fn increment_below(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<CounterOutcome> {
        let now = self.clock.now_millis();
        let mut data = self.data.lock();
        Self::purge_if_expired(&mut data, key, now);

        let current = Self::counter(&data, key)?;
        if current >= limit {
            return Ok(CounterOutcome {
                allowed: false,
                count: current,
            });
        }

        self.ensure_capacity(&mut data, key, now)?;
        data.insert(
            key.to_string(),
            MemoryEntry {
                value: Value::Counter(current + 1),
                expires_at: Self::expiry(now, ttl),
            },
        );

        Ok(CounterOutcome {
            allowed: true,
            count: current + 1,
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

        let now = self.clock.now_millis();
        let mut data = self.data.lock();

        let mut total = 0;
        for key in keys {
            Self::purge_if_expired(&mut data, key, now);
            total += Self::counter(&data, key)?;
        }

        if total >= limit {
            return Ok(CounterOutcome {
                allowed: false,
                count: total,
            });
        }

        let current = Self::counter(&data, newest)?;
        self.ensure_capacity(&mut data, newest, now)?;
        data.insert(
            newest.clone(),
            MemoryEntry {
                value: Value::Counter(current + 1),
                expires_at: Self::expiry(now, ttl),
            },
        );

        Ok(CounterOutcome {
            allowed: true,
            count: total + 1,
        })
    }

    async fn admit_member(
        &self,
        key: &str,
        admission: &MemberAdmission,
    ) -> Result<CounterOutcome> {
        let now = self.clock.now_millis();
        let mut data = self.data.lock();
        Self::purge_if_expired(&mut data, key, now);

        let mut members = match data.remove(key) {
            None => BTreeSet::new(),
            Some(MemoryEntry {
                value: Value::SortedSet(members),
                ..
            }) => members,
            Some(other) => {
                data.insert(key.to_string(), other);
                return Err(wrong_type(key));
            }
        };

        // keep everything scored at or above the cutoff
        let mut members = members.split_off(&(admission.min_score_ms, String::new()));
        let count = members.len() as u64;
        let allowed = count < admission.limit;
        if allowed {
            members.insert((admission.score_ms, admission.member.clone()));
        }

        let count = members.len() as u64;
        if !members.is_empty() {
            self.ensure_capacity(&mut data, key, now)?;
            data.insert(
                key.to_string(),
                MemoryEntry {
                    value: Value::SortedSet(members),
                    expires_at: Self::expiry(now, admission.ttl),
                },
            );
        }

        Ok(CounterOutcome { allowed, count })
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<bool> {
        let now = self.clock.now_millis();
        let mut data = self.data.lock();
        Self::purge_if_expired(&mut data, key, now);

        let Some(entry) = data.get_mut(key) else {
            return Ok(false);
        };
        let Value::SortedSet(members) = &mut entry.value else {
            return Err(wrong_type(key));
        };

        let before = members.len();
        members.retain(|(_, m)| m != member);
        let removed = members.len() < before;
        if members.is_empty() {
            data.remove(key);
        }
        Ok(removed)
    }
}
