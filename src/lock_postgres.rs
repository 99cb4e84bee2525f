#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use std::sync::Arc;
#[cfg(feature = "postgres")]
use tokio_postgres::Client;

#[cfg(feature = "postgres")]
use crate::error::LockError;
#[cfg(feature = "postgres")]
use crate::lock::{LockCoordinator, LockToken};

/// Session-level Postgres advisory lock keyed by `hashtext(name)`.
///
/// Advisory locks belong to the database session, so acquire and release
/// must go through the same client. If the session drops, Postgres frees the
/// lock on its own.
#[cfg(feature = "postgres")]
pub struct PostgresAdvisoryLock {
    client: Arc<Client>,
}

#[cfg(feature = "postgres")]
impl PostgresAdvisoryLock {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl LockCoordinator for PostgresAdvisoryLock {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockToken>, LockError> {
        let row = self
            .client
            .query_one(
                "SELECT pg_try_advisory_lock(hashtext($1)::bigint), hashtext($1)::bigint",
                &[&name],
            )
            .await?;
        let acquired: bool = row.try_get(0)?;
        let key: i64 = row.try_get(1)?;
        Ok(acquired.then(|| LockToken::new(name, key as u64)))
    }

    async fn release(&self, token: LockToken) -> Result<(), LockError> {
        let row = self
            .client
            .query_one(
                "SELECT pg_advisory_unlock(hashtext($1)::bigint)",
                &[&token.name()],
            )
            .await?;
        let released: bool = row.try_get(0)?;
        if released {
            Ok(())
        } else {
            Err(LockError::NotHeld(token.name().to_string()))
        }
    }
}
