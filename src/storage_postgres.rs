#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use chrono::{DateTime, Utc};
#[cfg(feature = "postgres")]
use std::sync::Arc;
#[cfg(feature = "postgres")]
use tokio_postgres::{Client, Row};

#[cfg(feature = "postgres")]
use crate::error::StoreError;
#[cfg(feature = "postgres")]
use crate::storage::{OutboxStore, Transition, STALE_MARKER};
#[cfg(feature = "postgres")]
use crate::types::{EventId, MerchantId, OutboxEvent, OutboxStatus};

#[cfg(feature = "postgres")]
const COLUMNS: &str =
    "id, merchant_id, event_type, payload, status, retries, next_retry_at, last_error, created_at, updated_at";

/// Outbox backed by the `event_outbox` Postgres table.
///
/// The client can be shared with [`PostgresAdvisoryLock`](crate::PostgresAdvisoryLock).
#[cfg(feature = "postgres")]
pub struct PostgresOutbox {
    client: Arc<Client>,
}

#[cfg(feature = "postgres")]
impl PostgresOutbox {
    pub async fn new(client: Arc<Client>) -> Result<Self, StoreError> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS event_outbox (
                    id TEXT PRIMARY KEY,
                    merchant_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    retries INTEGER NOT NULL DEFAULT 0,
                    next_retry_at TIMESTAMPTZ,
                    last_error TEXT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );
                CREATE INDEX IF NOT EXISTS event_outbox_status_created_idx
                    ON event_outbox (status, created_at);",
            )
            .await?;

        Ok(Self { client })
    }

    /// Insert a new event. Producers normally do this inside their own
    /// transaction; this helper exists for tooling and tests.
    pub async fn enqueue(&self, event: &OutboxEvent) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO event_outbox (id, merchant_id, event_type, payload, status, retries,
                                           next_retry_at, last_error, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &event.id.0,
                    &event.merchant_id.0,
                    &event.event_type,
                    &event.payload,
                    &event.status.as_str(),
                    &(event.retries as i32),
                    &event.next_retry_at,
                    &event.last_error,
                    &event.created_at,
                    &event.updated_at,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &EventId) -> Result<Option<OutboxEvent>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM event_outbox WHERE id = $1");
        let row = self.client.query_opt(query.as_str(), &[&id.0]).await?;
        row.as_ref().map(row_to_event).transpose()
    }
}

#[cfg(feature = "postgres")]
fn row_to_event(row: &Row) -> Result<OutboxEvent, StoreError> {
    let status: String = row.try_get(4)?;
    let retries: i32 = row.try_get(5)?;
    Ok(OutboxEvent {
        id: EventId(row.try_get(0)?),
        merchant_id: MerchantId(row.try_get(1)?),
        event_type: row.try_get(2)?,
        payload: row.try_get(3)?,
        status: status.parse::<OutboxStatus>().map_err(StoreError::InvalidRow)?,
        retries: u32::try_from(retries)
            .map_err(|_| StoreError::InvalidRow(format!("negative retries: {retries}")))?,
        next_retry_at: row.try_get(6)?,
        last_error: row.try_get(7)?,
        created_at: row.try_get(8)?,
        updated_at: row.try_get(9)?,
    })
}

#[cfg(feature = "postgres")]
fn like_prefix(namespace: &str) -> String {
    let escaped = namespace
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("{escaped}%")
}

#[cfg(feature = "postgres")]
#[async_trait]
impl OutboxStore for PostgresOutbox {
    async fn fetch_due(
        &self,
        namespace: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM event_outbox
             WHERE status = 'PENDING'
               AND event_type LIKE $1
               AND (next_retry_at IS NULL OR next_retry_at <= $2)
             ORDER BY created_at ASC, id ASC
             LIMIT $3"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(query.as_str(), &[&like_prefix(namespace), &now, &limit])
            .await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn claim(&self, id: &EventId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let updated = self
            .client
            .execute(
                "UPDATE event_outbox SET status = 'SENDING', updated_at = $2
                 WHERE id = $1 AND status = 'PENDING'",
                &[&id.0, &now],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn resolve(
        &self,
        id: &EventId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let updated = match transition {
            Transition::Sent { marker } => {
                self.client
                    .execute(
                        "UPDATE event_outbox
                         SET status = 'SENT', next_retry_at = NULL, last_error = $2, updated_at = $3
                         WHERE id = $1 AND status = 'SENDING'",
                        &[&id.0, marker, &now],
                    )
                    .await?
            }
            Transition::Reschedule {
                retries,
                next_retry_at,
                last_error,
            } => {
                self.client
                    .execute(
                        "UPDATE event_outbox
                         SET status = 'PENDING', retries = $2, next_retry_at = $3,
                             last_error = $4, updated_at = $5
                         WHERE id = $1 AND status = 'SENDING'",
                        &[&id.0, &(*retries as i32), next_retry_at, last_error, &now],
                    )
                    .await?
            }
            Transition::Dead { retries, last_error } => {
                self.client
                    .execute(
                        "UPDATE event_outbox
                         SET status = 'DEAD', retries = $2, next_retry_at = NULL,
                             last_error = $3, updated_at = $4
                         WHERE id = $1 AND status = 'SENDING'",
                        &[&id.0, &(*retries as i32), last_error, &now],
                    )
                    .await?
            }
        };
        Ok(updated == 1)
    }

    async fn recover_stale(
        &self,
        namespace: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let recovered = self
            .client
            .execute(
                "UPDATE event_outbox SET status = 'PENDING', updated_at = $3, last_error = $4
                 WHERE status = 'SENDING' AND event_type LIKE $1 AND updated_at < $2",
                &[&like_prefix(namespace), &stale_before, &now, &STALE_MARKER],
            )
            .await?;
        Ok(recovered)
    }
}

#[cfg(all(test, feature = "postgres"))]
mod tests {
    use super::like_prefix;

    #[test]
    fn namespace_wildcards_are_escaped() {
        assert_eq!(like_prefix("notify."), "notify.%");
        assert_eq!(like_prefix("a_b%"), "a\\_b\\%%");
    }
}
