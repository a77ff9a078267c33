// src/limiter.rs

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::algorithms::concurrency;
use crate::algorithms::{
    ConcurrencyLimiter, FixedWindow, RateLimitAlgorithm, RateLimitStatus, SlidingWindow,
    SlidingWindowCounter, TokenBucket,
};
use crate::bypass::{BypassManager, BypassRecord};
use crate::clock::{Clock, SystemClock};
use crate::config::{FailurePolicy, RateLimiterConfig, Strategy, StrategyConfig, StrategyKind};
use crate::decision_event;
use crate::error::{RateLimiterError, Result, StorageError};
use crate::resilience::{CircuitBreaker, CircuitState};
use crate::storage::{self, StorageBackend};

/// The outcome of one check, the only value handed back to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u64,
    /// The configured cap
    pub limit: u64,
    /// Epoch milliseconds at which capacity is next restored
    pub reset_time: u64,
    pub strategy: StrategyKind,
    pub identifier: String,
    /// Epoch milliseconds at which the decision was made
    pub timestamp: u64,
    /// Concurrency slot to hand back through [`RateLimiter::release`].
    /// Slots taken through a labelled tier read `<tier>/<slot>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    /// Set when an active bypass short-circuited evaluation
    #[serde(default)]
    pub bypassed: bool,
    /// Store failure that forced the failure policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Decision {
    fn from_status(
        identifier: &str,
        config: &StrategyConfig,
        now_ms: u64,
        status: RateLimitStatus,
    ) -> Self {
        Self {
            allowed: status.allowed,
            remaining: status.remaining,
            limit: status.limit,
            reset_time: status.reset_time,
            strategy: config.kind(),
            identifier: identifier.to_string(),
            timestamp: now_ms,
            request_id: status
                .request_id
                .map(|slot| slot_handle(config.tier.as_deref(), &slot)),
            tier: config.tier.clone(),
            bypassed: false,
            error: None,
        }
    }

    fn bypassed(
        identifier: &str,
        config: &StrategyConfig,
        now_ms: u64,
        record: &BypassRecord,
    ) -> Self {
        let limit = config.strategy.limit();
        Self {
            allowed: true,
            remaining: limit,
            limit,
            reset_time: record.expires_at,
            strategy: config.kind(),
            identifier: identifier.to_string(),
            timestamp: now_ms,
            request_id: None,
            tier: config.tier.clone(),
            bypassed: true,
            error: None,
        }
    }

    fn degraded(
        identifier: &str,
        config: &StrategyConfig,
        now_ms: u64,
        policy: FailurePolicy,
        error: &RateLimiterError,
    ) -> Self {
        Self {
            allowed: policy == FailurePolicy::Open,
            remaining: 0,
            limit: config.strategy.limit(),
            reset_time: now_ms,
            strategy: config.kind(),
            identifier: identifier.to_string(),
            timestamp: now_ms,
            request_id: None,
            tier: config.tier.clone(),
            bypassed: false,
            error: Some(error.to_string()),
        }
    }

    /// How long a denied caller should wait before trying again.
    pub fn retry_after(&self) -> Duration {
        if self.allowed {
            return Duration::ZERO;
        }
        Duration::from_millis(self.reset_time.saturating_sub(self.timestamp))
    }
}

/// Combined outcome of an ordered list of tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiTierDecision {
    pub allowed: bool,
    /// One entry per evaluated tier, in order; tiers after a denial are absent
    pub results: Vec<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exceeded_tier: Option<String>,
}

fn tier_label(config: &StrategyConfig, index: usize) -> String {
    config
        .tier
        .clone()
        .unwrap_or_else(|| format!("tier{index}"))
}

/// Separates a tier label from the slot id in a request id. Slot ids are
/// UUIDs, so the last separator always starts the slot.
const SLOT_SEPARATOR: char = '/';

fn slot_handle(tier: Option<&str>, slot: &str) -> String {
    match tier {
        Some(tier) => format!("{tier}{SLOT_SEPARATOR}{slot}"),
        None => slot.to_string(),
    }
}

/// Split a request id into the tier its slot lives under and the slot id.
fn parse_slot_handle(request_id: &str) -> Result<(Option<&str>, &str)> {
    let (tier, slot) = match request_id.rsplit_once(SLOT_SEPARATOR) {
        Some((tier, slot)) => (Some(tier), slot),
        None => (None, request_id),
    };
    if slot.is_empty() || tier.is_some_and(str::is_empty) {
        return Err(RateLimiterError::config(format!(
            "malformed request id '{request_id}'"
        )));
    }
    Ok((tier, slot))
}

fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(RateLimiterError::config("identifier must not be empty"));
    }
    Ok(())
}

/// The decision engine.
///
/// Owns a handle to the shared store and nothing else mutable: every call
/// is an independent round trip, so one engine can be shared freely across
/// tasks, and any number of engines in other processes can point at the
/// same store.
#[derive(Debug)]
pub struct RateLimiter<S>
where
    S: StorageBackend,
{
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    config: RateLimiterConfig,
    bypass: BypassManager<S>,
    breaker: Option<CircuitBreaker>,
}

impl<S> RateLimiter<S>
where
    S: StorageBackend,
{
    /// Creates a new engine on the system clock
    pub fn new(storage: Arc<S>, config: RateLimiterConfig) -> Self {
        Self::with_clock(storage, config, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: Arc<S>, config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let bypass = BypassManager::new(
            Arc::clone(&storage),
            Arc::clone(&clock),
            config.key_prefix.clone(),
            config.bypass_max_duration,
        );
        let breaker = config.circuit_breaker.clone().map(CircuitBreaker::new);

        Self {
            storage,
            clock,
            config,
            bypass,
            breaker,
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn bypass_manager(&self) -> &BypassManager<S> {
        &self.bypass
    }

    /// State of the store circuit breaker, `None` when it is disabled.
    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.breaker.as_ref().map(CircuitBreaker::state)
    }

    /// Labelled tiers keep their state apart from every other tier, so two
    /// tiers using the same strategy never share counters.
    fn key_prefix(&self, tier: Option<&str>) -> Cow<'_, str> {
        match tier {
            Some(tier) => Cow::Owned(format!("{}:{}", self.config.key_prefix, tier)),
            None => Cow::Borrowed(self.config.key_prefix.as_str()),
        }
    }

    fn algorithm<'a>(
        &'a self,
        config: &'a StrategyConfig,
        prefix: &'a str,
    ) -> Box<dyn RateLimitAlgorithm + 'a> {
        let storage = self.storage.as_ref();
        match &config.strategy {
            Strategy::TokenBucket(c) => Box::new(TokenBucket::new(storage, c, prefix)),
            Strategy::FixedWindow(c) => Box::new(FixedWindow::new(storage, c, prefix)),
            Strategy::SlidingWindow(c) => Box::new(SlidingWindow::new(storage, c, prefix)),
            Strategy::SlidingWindowCounter(c) => {
                Box::new(SlidingWindowCounter::new(storage, c, prefix))
            }
            Strategy::Concurrent(c) => Box::new(ConcurrencyLimiter::new(storage, c, prefix)),
        }
    }

    /// Time-bound a store call and feed its outcome to the circuit breaker.
    async fn guarded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(breaker) = &self.breaker {
            if !breaker.allow_request(self.clock.now_millis()) {
                return Err(StorageError::CircuitOpen.into());
            }
        }

        let result = storage::bounded(self.config.timeout, operation, fut).await;

        if let Some(breaker) = &self.breaker {
            match &result {
                Ok(_) => breaker.record_success(),
                Err(e) if e.is_outage() => breaker.record_failure(self.clock.now_millis()),
                Err(_) => {}
            }
        }
        result
    }

    fn degrade(
        &self,
        identifier: &str,
        config: &StrategyConfig,
        now_ms: u64,
        error: &RateLimiterError,
    ) -> Decision {
        let policy = self.config.failure_policy;
        warn!(
            identifier,
            strategy = %config.kind(),
            policy = ?policy,
            error = %error,
            "Rate limit store failure, applying failure policy"
        );
        Decision::degraded(identifier, config, now_ms, policy, error)
    }

    /// Run one strategy, converting store failures through the policy.
    async fn evaluate(&self, identifier: &str, config: &StrategyConfig, now_ms: u64) -> Decision {
        let prefix = self.key_prefix(config.tier.as_deref());
        let algorithm = self.algorithm(config, &prefix);
        let decision = match self
            .guarded("check", algorithm.check_and_record(identifier, now_ms))
            .await
        {
            Ok(status) => Decision::from_status(identifier, config, now_ms, status),
            Err(e) => self.degrade(identifier, config, now_ms, &e),
        };
        decision_event!(decision);
        decision
    }

    /// Decide whether one request for `identifier` may proceed under
    /// `config`, recording it if so.
    ///
    /// Invalid configs and empty identifiers are returned as
    /// [`RateLimiterError::Config`] before the store is touched. Store
    /// failures never surface as `Err`; they become a decision shaped by
    /// the configured [`FailurePolicy`].
    pub async fn check(&self, identifier: &str, config: &StrategyConfig) -> Result<Decision> {
        validate_identifier(identifier)?;
        config.validate()?;

        let now = self.clock.now_millis();
        match self
            .guarded("bypass_lookup", self.bypass.active_at(identifier, now))
            .await
        {
            Ok(Some(record)) => {
                let decision = Decision::bypassed(identifier, config, now, &record);
                decision_event!(decision);
                Ok(decision)
            }
            Ok(None) => Ok(self.evaluate(identifier, config, now).await),
            Err(e) => {
                let decision = self.degrade(identifier, config, now, &e);
                decision_event!(decision);
                Ok(decision)
            }
        }
    }

    /// Evaluate `configs` in order, stopping at the first denial.
    ///
    /// Tiers evaluated before the denying tier keep what they consumed;
    /// nothing is rolled back. A caller denied by a later tier has still
    /// spent capacity in the earlier ones.
    pub async fn check_multi_tier(
        &self,
        identifier: &str,
        configs: &[StrategyConfig],
    ) -> Result<MultiTierDecision> {
        validate_identifier(identifier)?;
        if configs.is_empty() {
            return Err(RateLimiterError::config(
                "multi-tier check needs at least one tier",
            ));
        }
        for config in configs {
            config.validate()?;
        }

        let now = self.clock.now_millis();
        match self
            .guarded("bypass_lookup", self.bypass.active_at(identifier, now))
            .await
        {
            Ok(Some(record)) => {
                let results: Vec<Decision> = configs
                    .iter()
                    .map(|config| Decision::bypassed(identifier, config, now, &record))
                    .collect();
                for decision in &results {
                    decision_event!(decision);
                }
                return Ok(MultiTierDecision {
                    allowed: true,
                    results,
                    exceeded_tier: None,
                });
            }
            Ok(None) => {}
            Err(e) => return Ok(self.degrade_tiers(identifier, configs, now, &e)),
        }

        let mut results = Vec::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            let decision = self.evaluate(identifier, config, now).await;
            let allowed = decision.allowed;
            results.push(decision);

            if !allowed {
                return Ok(MultiTierDecision {
                    allowed: false,
                    results,
                    exceeded_tier: Some(tier_label(config, index)),
                });
            }
        }

        Ok(MultiTierDecision {
            allowed: true,
            results,
            exceeded_tier: None,
        })
    }

    /// The bypass lookup failed, so no tier can be evaluated reliably.
    fn degrade_tiers(
        &self,
        identifier: &str,
        configs: &[StrategyConfig],
        now_ms: u64,
        error: &RateLimiterError,
    ) -> MultiTierDecision {
        match self.config.failure_policy {
            FailurePolicy::Open => MultiTierDecision {
                allowed: true,
                results: configs
                    .iter()
                    .map(|config| self.degrade(identifier, config, now_ms, error))
                    .collect(),
                exceeded_tier: None,
            },
            FailurePolicy::Closed => MultiTierDecision {
                allowed: false,
                results: vec![self.degrade(identifier, &configs[0], now_ms, error)],
                exceeded_tier: Some(tier_label(&configs[0], 0)),
            },
        }
    }

    /// Drop the persisted state for `identifier` under `config`, so the next
    /// check starts fresh. Returns whether any state existed; store failures
    /// are logged and reported as `false`.
    pub async fn reset(&self, identifier: &str, config: &StrategyConfig) -> Result<bool> {
        validate_identifier(identifier)?;
        config.validate()?;

        let now = self.clock.now_millis();
        let prefix = self.key_prefix(config.tier.as_deref());
        let algorithm = self.algorithm(config, &prefix);
        match self.guarded("reset", algorithm.reset(identifier, now)).await {
            Ok(existed) => Ok(existed),
            Err(e) => {
                warn!(identifier, strategy = %config.kind(), error = %e, "Rate limit reset failed");
                Ok(false)
            }
        }
    }

    /// Hand back a concurrency slot obtained from a `concurrent` check,
    /// labelled tier or not; the tier travels inside `request_id`.
    ///
    /// Unknown or already released ids are a no-op returning `false`.
    pub async fn release(&self, identifier: &str, request_id: &str) -> Result<bool> {
        validate_identifier(identifier)?;
        if request_id.is_empty() {
            return Err(RateLimiterError::config("request id must not be empty"));
        }
        let (tier, slot) = parse_slot_handle(request_id)?;

        let prefix = self.key_prefix(tier);
        let released = concurrency::release(self.storage.as_ref(), &prefix, identifier, slot);
        match self.guarded("release", released).await {
            Ok(released) => Ok(released),
            Err(e) => {
                warn!(identifier, request_id, error = %e, "Concurrency slot release failed");
                Ok(false)
            }
        }
    }

    /// Grant `identifier` a bypass for `duration`.
    pub async fn create_bypass(
        &self,
        identifier: &str,
        duration: Duration,
        reason: &str,
        bypassed_by: &str,
    ) -> Result<BypassRecord> {
        self.bypass.validate(identifier, duration)?;
        storage::bounded(
            self.config.timeout,
            "bypass_create",
            self.bypass.create(identifier, duration, reason, bypassed_by),
        )
        .await
    }

    pub async fn check_bypass(&self, identifier: &str) -> Result<Option<BypassRecord>> {
        validate_identifier(identifier)?;
        storage::bounded(
            self.config.timeout,
            "bypass_check",
            self.bypass.check(identifier),
        )
        .await
    }

    pub async fn revoke_bypass(&self, identifier: &str) -> Result<bool> {
        validate_identifier(identifier)?;
        storage::bounded(
            self.config.timeout,
            "bypass_revoke",
            self.bypass.revoke(identifier),
        )
        .await
    }
}
