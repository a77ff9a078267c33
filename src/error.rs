// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RateLimiterError {
    /// Invalid strategy configuration or caller input. Never converted into
    /// a decision; these surface immediately.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to the storage backend
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Unexpected or internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RateLimiterError {
    /// Whether this error says the store is unhealthy. A full in-memory
    /// store is still answering, so it does not count.
    pub fn is_outage(&self) -> bool {
        matches!(self, RateLimiterError::Storage(e) if !matches!(e, StorageError::CapacityExceeded(_)))
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        RateLimiterError::Config(msg.into())
    }
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Redis connection errors
    #[error("Redis connection error: {0}")]
    RedisConnection(String),

    /// Redis authentication errors
    #[error("Redis authentication error: {0}")]
    RedisAuth(String),

    /// Redis command errors
    #[error("Redis command error: {0}")]
    RedisCommand(String),

    /// Data serialization/deserialization errors
    #[error("Data serialization error: {0}")]
    Serialization(String),

    /// A store round trip did not finish within the configured timeout
    #[error("Storage operation timed out: {0}")]
    Timeout(String),

    /// The in-memory store refused a new key
    #[error("Storage capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The circuit breaker is holding calls away from the store
    #[error("Storage circuit open")]
    CircuitOpen,
}

// Authentication and transport failures keep their own variants
impl From<redis::RedisError> for RateLimiterError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::AuthenticationFailed => {
                RateLimiterError::Storage(StorageError::RedisAuth(err.to_string()))
            }
            redis::ErrorKind::IoError | redis::ErrorKind::ClientError => {
                RateLimiterError::Storage(StorageError::RedisConnection(err.to_string()))
            }
            _ => RateLimiterError::Storage(StorageError::RedisCommand(err.to_string())),
        }
    }
}

// A stored record that no longer decodes
impl From<serde_json::Error> for RateLimiterError {
    fn from(err: serde_json::Error) -> Self {
        RateLimiterError::Storage(StorageError::Serialization(err.to_string()))
    }
}

impl From<StorageError> for RateLimiterError {
    fn from(err: StorageError) -> Self {
        RateLimiterError::Storage(err)
    }
}

pub type Result<T> = std::result::Result<T, RateLimiterError>;
