//! A transactional outbox dispatcher for merchant notifications.
//!
//! Producers write notification intents (`notify.broadcast`, `notify.test`)
//! into an outbox table. This crate polls that table, claims due rows, and
//! turns them into calls against push, SMS and email collaborators.
//!
//! ## Guarantees
//! - At-least-once delivery attempts for every claimed event
//! - One claimer per row, enforced by a conditional `PENDING -> SENDING` update
//! - One active tick per worker name, enforced by a non-blocking named lock
//! - Bounded retries with capped, jittered exponential backoff, then `DEAD`
//! - Throttling never consumes the retry budget
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering beyond oldest-first within a batch
//! - Cluster-wide rate limits with the default process-local limiter
//!   (use `RedisRateLimiter` behind the `redis` feature for that)
//! - Bounded tick duration: a hung provider call holds the tick open
//!
//! Concrete providers are out of scope; hosts implement the traits in
//! [`channels`].

mod backoff;
pub mod channels;
mod config;
mod dispatcher;
mod error;
mod lock;
mod rate_limit;
mod storage;
mod telemetry;
mod types;
mod worker;

#[cfg(feature = "postgres")]
mod lock_postgres;
#[cfg(feature = "postgres")]
mod storage_postgres;

#[cfg(feature = "redis")]
mod rate_limit_redis;

pub use backoff::{RetryDecision, RetryPolicy};
pub use channels::{
    Channels, EmailChannel, EmailContact, EmailMessage, PushChannel, PushMessage, RecipientDirectory,
    SendReport, SmsChannel, SmsMessage,
};
pub use config::{DispatcherConfig, RateBudget, RuntimeMode};
pub use dispatcher::{Dispatcher, DispatcherHandle, SkipReason, TickOutcome, TickReport, WorkerStatus};
pub use error::{
    ChannelError, ConfigError, DispatchError, HandleError, LockError, RateLimitError, StoreError,
};
pub use lock::{LocalLock, LockCoordinator, LockToken};
pub use rate_limit::{FixedWindowLimiter, RateLimiter, RateLimiterStats};
pub use storage::{InMemoryOutbox, OutboxStore, Transition, STALE_MARKER};
pub use types::{
    BroadcastPayload, Channel, ChannelSelector, EventId, MerchantId, Notification, OutboxEvent,
    OutboxStatus, Template, TestPayload, BROADCAST_EVENT, TEST_EVENT,
};
pub use worker::{
    DRY_RUN_MARKER, PUSH_TEST_SKIPPED_MARKER, TEST_ENV_MARKER, THROTTLED_MARKER, UNKNOWN_TYPE_MARKER,
};

#[cfg(feature = "postgres")]
pub use lock_postgres::PostgresAdvisoryLock;
#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresOutbox;

#[cfg(feature = "redis")]
pub use rate_limit_redis::RedisRateLimiter;
