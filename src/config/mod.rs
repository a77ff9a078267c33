// src/config/mod.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RateLimiterError, Result};
use crate::resilience::CircuitBreakerConfig;

/// Engine-wide settings shared by every check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Key prefix to use for all keys in storage
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single store round trip
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// What a check returns when the store cannot be reached
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Stop calling a failing store for a while; `None` disables the breaker
    #[serde(default = "default_circuit_breaker")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Longest bypass an operator may grant
    #[serde(default = "default_bypass_max_duration", with = "duration_serde")]
    pub bypass_max_duration: Duration,
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_circuit_breaker() -> Option<CircuitBreakerConfig> {
    Some(CircuitBreakerConfig::default())
}

fn default_bypass_max_duration() -> Duration {
    Duration::from_secs(60 * 60 * 24)
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            timeout: default_timeout(),
            failure_policy: FailurePolicy::default(),
            circuit_breaker: default_circuit_breaker(),
            bypass_max_duration: default_bypass_max_duration(),
        }
    }
}

impl RateLimiterConfig {
    /// Build a config from `RATE_LIMITER_*` environment variables, falling
    /// back to defaults for anything unset.
    ///
    /// Recognised variables: `RATE_LIMITER_KEY_PREFIX`,
    /// `RATE_LIMITER_TIMEOUT_MS`, `RATE_LIMITER_FAILURE_POLICY`
    /// (`open`/`closed`) and `RATE_LIMITER_BREAKER_THRESHOLD` (0 disables
    /// the circuit breaker).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(prefix) = std::env::var("RATE_LIMITER_KEY_PREFIX") {
            if prefix.is_empty() {
                return Err(RateLimiterError::config(
                    "RATE_LIMITER_KEY_PREFIX must not be empty",
                ));
            }
            config.key_prefix = prefix;
        }

        if let Ok(raw) = std::env::var("RATE_LIMITER_TIMEOUT_MS") {
            let millis: u64 = raw.parse().map_err(|_| {
                RateLimiterError::config(format!("RATE_LIMITER_TIMEOUT_MS is not a number: {raw}"))
            })?;
            config.timeout = Duration::from_millis(millis);
        }

        if let Ok(raw) = std::env::var("RATE_LIMITER_FAILURE_POLICY") {
            config.failure_policy = raw.parse()?;
        }

        if let Ok(raw) = std::env::var("RATE_LIMITER_BREAKER_THRESHOLD") {
            let threshold: usize = raw.parse().map_err(|_| {
                RateLimiterError::config(format!(
                    "RATE_LIMITER_BREAKER_THRESHOLD is not a number: {raw}"
                ))
            })?;
            config.circuit_breaker = match threshold {
                0 => None,
                n => Some(CircuitBreakerConfig {
                    failure_threshold: n,
                    ..CircuitBreakerConfig::default()
                }),
            };
        }

        Ok(config)
    }
}

/// Outcome of a check when the store itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Let the request through; availability wins over enforcement.
    #[default]
    Open,
    /// Deny the request; enforcement wins over availability.
    Closed,
}

impl FromStr for FailurePolicy {
    type Err = RateLimiterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(FailurePolicy::Open),
            "closed" => Ok(FailurePolicy::Closed),
            other => Err(RateLimiterError::config(format!(
                "unknown failure policy '{other}', expected 'open' or 'closed'"
            ))),
        }
    }
}

/// The closed set of strategy names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    TokenBucket,
    FixedWindow,
    SlidingWindow,
    SlidingWindowCounter,
    Concurrent,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::TokenBucket,
        StrategyKind::FixedWindow,
        StrategyKind::SlidingWindow,
        StrategyKind::SlidingWindowCounter,
        StrategyKind::Concurrent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::TokenBucket => "token_bucket",
            StrategyKind::FixedWindow => "fixed_window",
            StrategyKind::SlidingWindow => "sliding_window",
            StrategyKind::SlidingWindowCounter => "sliding_window_counter",
            StrategyKind::Concurrent => "concurrent",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = RateLimiterError;

    fn from_str(s: &str) -> Result<Self> {
        StrategyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| RateLimiterError::config(format!("unknown strategy '{s}'")))
    }
}

/// Configuration for token bucket algorithm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Capacity of the token bucket
    pub capacity: u64,

    /// Rate at which tokens are refilled (tokens per second)
    pub refill_rate: f64,

    /// Tokens consumed by one check
    #[serde(default = "default_tokens_requested")]
    pub tokens_requested: u64,
}

fn default_tokens_requested() -> u64 {
    1
}

/// Configuration for fixed window algorithm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedWindowConfig {
    /// Maximum number of requests allowed in the window
    pub limit: u64,

    /// Window duration
    #[serde(with = "duration_serde")]
    pub window_size: Duration,
}

/// Configuration for the exact sliding window log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    /// Maximum number of requests allowed in any window
    pub limit: u64,

    /// Window duration
    #[serde(with = "duration_serde")]
    pub window_size: Duration,
}

/// Configuration for the bucketed sliding window approximation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowCounterConfig {
    /// Maximum number of requests allowed in the window
    pub limit: u64,

    /// Window duration
    #[serde(with = "duration_serde")]
    pub window_size: Duration,

    /// Number of buckets the window is divided into
    #[serde(default = "default_sub_windows")]
    pub sub_windows: u32,
}

fn default_sub_windows() -> u32 {
    10
}

/// Configuration for the in-flight limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Slots that may be held at once
    pub max_concurrent: u64,

    /// Age after which an unreleased slot is considered abandoned
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

/// One of the five strategies together with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Strategy {
    TokenBucket(TokenBucketConfig),
    FixedWindow(FixedWindowConfig),
    SlidingWindow(SlidingWindowConfig),
    SlidingWindowCounter(SlidingWindowCounterConfig),
    Concurrent(ConcurrencyConfig),
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::TokenBucket(_) => StrategyKind::TokenBucket,
            Strategy::FixedWindow(_) => StrategyKind::FixedWindow,
            Strategy::SlidingWindow(_) => StrategyKind::SlidingWindow,
            Strategy::SlidingWindowCounter(_) => StrategyKind::SlidingWindowCounter,
            Strategy::Concurrent(_) => StrategyKind::Concurrent,
        }
    }

    /// The configured cap, as reported to callers.
    pub fn limit(&self) -> u64 {
        match self {
            Strategy::TokenBucket(c) => c.capacity,
            Strategy::FixedWindow(c) => c.limit,
            Strategy::SlidingWindow(c) => c.limit,
            Strategy::SlidingWindowCounter(c) => c.limit,
            Strategy::Concurrent(c) => c.max_concurrent,
        }
    }
}

/// A strategy plus an optional tier label used in multi-tier reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(flatten)]
    pub strategy: Strategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
}

impl From<Strategy> for StrategyConfig {
    fn from(strategy: Strategy) -> Self {
        Self {
            strategy,
            tier: None,
        }
    }
}

impl StrategyConfig {
    pub fn token_bucket(capacity: u64, refill_rate: f64) -> Self {
        Strategy::TokenBucket(TokenBucketConfig {
            capacity,
            refill_rate,
            tokens_requested: default_tokens_requested(),
        })
        .into()
    }

    pub fn fixed_window(limit: u64, window_size: Duration) -> Self {
        Strategy::FixedWindow(FixedWindowConfig { limit, window_size }).into()
    }

    pub fn sliding_window(limit: u64, window_size: Duration) -> Self {
        Strategy::SlidingWindow(SlidingWindowConfig { limit, window_size }).into()
    }

    pub fn sliding_window_counter(limit: u64, window_size: Duration, sub_windows: u32) -> Self {
        Strategy::SlidingWindowCounter(SlidingWindowCounterConfig {
            limit,
            window_size,
            sub_windows,
        })
        .into()
    }

    pub fn concurrent(max_concurrent: u64, timeout: Duration) -> Self {
        Strategy::Concurrent(ConcurrencyConfig {
            max_concurrent,
            timeout,
        })
        .into()
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// Parse a config from JSON. Unknown strategy names and missing fields
    /// are configuration errors.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| RateLimiterError::config(format!("invalid strategy config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value)
            .map_err(|e| RateLimiterError::config(format!("invalid strategy config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject parameter combinations no strategy can evaluate.
    pub fn validate(&self) -> Result<()> {
        if let Some(tier) = &self.tier {
            if tier.trim().is_empty() {
                return Err(RateLimiterError::config("tier label must not be empty"));
            }
            // tier labels become part of storage keys next to the hash tag
            if tier.contains(|c: char| c == '{' || c == '}') {
                return Err(RateLimiterError::config(format!(
                    "tier label '{tier}' must not contain braces"
                )));
            }
        }

        match &self.strategy {
            Strategy::TokenBucket(c) => {
                if c.capacity == 0 {
                    return Err(RateLimiterError::config("token_bucket: capacity must be positive"));
                }
                if !c.refill_rate.is_finite() || c.refill_rate <= 0.0 {
                    return Err(RateLimiterError::config(
                        "token_bucket: refill_rate must be a positive number",
                    ));
                }
                if c.tokens_requested == 0 || c.tokens_requested > c.capacity {
                    return Err(RateLimiterError::config(format!(
                        "token_bucket: tokens_requested must be between 1 and capacity ({})",
                        c.capacity
                    )));
                }
            }
            Strategy::FixedWindow(FixedWindowConfig { limit, window_size })
            | Strategy::SlidingWindow(SlidingWindowConfig { limit, window_size }) => {
                let name = self.kind();
                if *limit == 0 {
                    return Err(RateLimiterError::config(format!("{name}: limit must be positive")));
                }
                if window_size.as_millis() == 0 {
                    return Err(RateLimiterError::config(format!(
                        "{name}: window_size must be at least 1ms"
                    )));
                }
            }
            Strategy::SlidingWindowCounter(c) => {
                if c.limit == 0 {
                    return Err(RateLimiterError::config(
                        "sliding_window_counter: limit must be positive",
                    ));
                }
                if c.sub_windows == 0 {
                    return Err(RateLimiterError::config(
                        "sliding_window_counter: sub_windows must be positive",
                    ));
                }
                if c.window_size.as_millis() < u128::from(c.sub_windows) {
                    return Err(RateLimiterError::config(
                        "sliding_window_counter: each sub-window must span at least 1ms",
                    ));
                }
            }
            Strategy::Concurrent(c) => {
                if c.max_concurrent == 0 {
                    return Err(RateLimiterError::config(
                        "concurrent: max_concurrent must be positive",
                    ));
                }
                if c.timeout.as_millis() == 0 {
                    return Err(RateLimiterError::config("concurrent: timeout must be at least 1ms"));
                }
            }
        }

        Ok(())
    }
}

/// Configuration for Redis storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Connection timeout. The store multiplexes every call over one
    /// reconnecting connection, so there is no pool to size.
    #[serde(default = "default_conn_timeout", with = "duration_serde")]
    pub connection_timeout: Duration,
}

fn default_conn_timeout() -> Duration {
    Duration::from_secs(2)
}

impl RedisConfig {
    /// `REDIS_URL` or a local default.
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            connection_timeout: default_conn_timeout(),
        }
    }
}

/// Configuration for in-memory storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryConfig {
    /// Maximum number of entries to store.
    ///
    /// Once full, writes for keys not already held fail with
    /// `CapacityExceeded` and the engine answers those checks through its
    /// failure policy. Under `FailurePolicy::Open` a flood of new
    /// identifiers is therefore admitted unlimited while identifiers
    /// already stored keep being enforced. Size this above the number of
    /// identifiers live within the longest window, or use fail-closed.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Whether to use a background task for expiration
    #[serde(default = "default_use_background_task")]
    pub use_background_task: bool,

    /// How often to run the background expiration task
    #[serde(default = "default_cleanup_interval", with = "duration_serde")]
    pub cleanup_interval: Duration,
}

fn default_max_entries() -> usize {
    10_000
}

fn default_use_background_task() -> bool {
    true
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            use_background_task: default_use_background_task(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

// Helper module to serialize/deserialize Duration with serde
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(crate::clock::duration_millis(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
