// library entry
pub mod algorithms;
pub mod bypass;
pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod logging;
pub mod resilience;
pub mod storage;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

// Re-export key components for convenience
pub use algorithms::{RateLimitAlgorithm, RateLimitStatus};
pub use bypass::{BypassManager, BypassRecord};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    FailurePolicy, RateLimiterConfig, Strategy, StrategyConfig, StrategyKind,
};
pub use error::{RateLimiterError, Result, StorageError};
pub use limiter::{Decision, MultiTierDecision, RateLimiter};
pub use logging::init as init_logging;
pub use storage::{MemoryStorage, RedisStorage, StorageBackend};
