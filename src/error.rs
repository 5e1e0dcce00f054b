// src/error.rs

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RateLimiterError {
    /// The caller-supplied identifier cannot name a client
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The shared store could not complete the check
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StorageError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected or internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RateLimiterError {
    /// Whether the failed check may be re-run without risking a double charge
    pub fn is_retriable(&self) -> bool {
        match self {
            RateLimiterError::StoreUnavailable(err) => err.is_retriable(),
            _ => false,
        }
    }
}

/// Storage-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// The store could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// The store rejected our credentials
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The store rejected or failed a command
    #[error("Command error: {0}")]
    Command(String),

    /// Stored data could not be decoded
    #[error("Data serialization error: {0}")]
    Serialization(String),

    /// No answer within the deadline; the write may or may not have landed
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Every optimistic transaction attempt was invalidated by a concurrent writer
    #[error("Transaction on {key} aborted by concurrent writers after {attempts} attempts")]
    Contention { key: String, attempts: usize },

    /// The connection failed while the commit was in flight
    #[error("Commit outcome unknown: {0}")]
    CommitUnknown(String),

    /// The circuit breaker is refusing calls to the store
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// The in-memory store refused a new key
    #[error("Maximum entries limit exceeded ({0})")]
    CapacityExceeded(usize),
}

impl StorageError {
    /// Only failures known to have happened before anything was committed
    /// are safe to retry.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StorageError::Connection(_) | StorageError::Contention { .. }
        )
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            return StorageError::Timeout(Duration::ZERO);
        }

        match err.kind() {
            redis::ErrorKind::AuthenticationFailed => StorageError::Auth(err.to_string()),
            redis::ErrorKind::IoError | redis::ErrorKind::ClientError => {
                StorageError::Connection(err.to_string())
            }
            redis::ErrorKind::TypeError => StorageError::Serialization(err.to_string()),
            _ => StorageError::Command(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for RateLimiterError {
    fn from(err: redis::RedisError) -> Self {
        RateLimiterError::StoreUnavailable(err.into())
    }
}

impl From<serde_json::Error> for RateLimiterError {
    fn from(err: serde_json::Error) -> Self {
        RateLimiterError::Config(err.to_string())
    }
}

// define a Result type alias for convenience
pub type Result<T> = std::result::Result<T, RateLimiterError>;
