use thiserror::Error;

use crate::types::EventId;

/// Errors raised by an outbox backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend-level failure (connection, query).
    #[error("outbox backend error: {0}")]
    Backend(String),

    /// Row does not exist.
    #[error("outbox event not found: {0}")]
    NotFound(EventId),

    /// Row could not be decoded.
    #[error("invalid outbox row: {0}")]
    InvalidRow(String),
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Errors raised by a lock coordinator backend.
///
/// Contention is *not* an error; see [`LockCoordinator::try_acquire`](crate::LockCoordinator::try_acquire).
#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),

    #[error("lock {0} is not held by this coordinator")]
    NotHeld(String),
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for LockError {
    fn from(err: tokio_postgres::Error) -> Self {
        LockError::Backend(err.to_string())
    }
}

/// Failure reported by a delivery collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ChannelError(pub String);

impl ChannelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure of a shared rate limiter backend.
#[derive(Error, Debug)]
#[error("rate limiter backend error: {0}")]
pub struct RateLimitError(pub String);

#[cfg(feature = "redis")]
impl From<redis::RedisError> for RateLimitError {
    fn from(err: redis::RedisError) -> Self {
        RateLimitError(err.to_string())
    }
}

/// Reasons a claimed event could not be handled.
///
/// Every variant is retryable; the display text is persisted as `last_error`.
#[derive(Error, Debug)]
pub enum HandleError {
    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// One or more channel branches failed, e.g. `push: timeout; email: refused`.
    #[error("{0}")]
    Channels(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

/// Errors that abort a whole tick.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// Shutdown cut the batch short. The lock has been released.
    #[error("tick interrupted by shutdown")]
    Interrupted,
}

/// Invalid configuration value.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid value for {key}: {value:?} ({reason})")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

impl ConfigError {
    pub(crate) fn new(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}
