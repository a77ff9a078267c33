use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::duration_millis;
use crate::config::duration_serde;

/// The state of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Store calls flow normally
    Closed,
    /// Store calls are skipped until the reset timeout elapses
    Open,
    /// Probe calls are let through to test recovery
    HalfOpen,
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: usize,
    /// Duration to keep the circuit open before transitioning to half-open
    #[serde(with = "duration_serde")]
    pub reset_timeout: Duration,
    /// Number of consecutive successes in half-open state to close the circuit
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: usize,
    successes: usize,
    opened_at: Option<u64>,
}

/// Tracks store health across calls.
///
/// Time is passed in as epoch milliseconds so the breaker follows the same
/// clock as the engine.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerState>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
            }),
            config,
        }
    }

    /// Whether a store call may be attempted at `now_ms`.
    pub fn allow_request(&self, now_ms: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now_ms);
                let reset_after = duration_millis(self.config.reset_timeout);
                if now_ms.saturating_sub(opened_at) >= reset_after {
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    debug!("Circuit breaker state transitioned to half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.successes = 0;
                    inner.failures = 0;
                    inner.opened_at = None;
                    debug!("Circuit breaker closed after successful trial calls");
                }
            }
            // a call that started before the circuit opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, now_ms: u64) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now_ms);
                    warn!(
                        failures = inner.failures,
                        "Circuit breaker opened after consecutive store failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now_ms);
                inner.successes = 0;
                warn!("Circuit breaker re-opened after failure in half-open state");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }
}
