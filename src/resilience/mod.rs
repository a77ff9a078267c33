// src/resilience/mod.rs
//! Resilience features for the decision engine.
//!
//! A store outage must never stall callers. The engine bounds every round
//! trip with a timeout and, once the store has failed repeatedly, stops
//! calling it for a cooling-off period. While the circuit is open every
//! check resolves immediately through the configured failure policy.

mod circuit_breaker;

#[cfg(test)]
mod tests;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
