use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{EventId, OutboxEvent, OutboxStatus};

/// State change recorded against a claimed (`SENDING`) row.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Terminal success, or an intentionally acknowledged no-op.
    Sent { marker: Option<String> },
    /// Back to `PENDING` until `next_retry_at`.
    Reschedule {
        retries: u32,
        next_retry_at: DateTime<Utc>,
        last_error: String,
    },
    /// Terminal failure; the retry budget is spent.
    Dead { retries: u32, last_error: String },
}

impl Transition {
    pub fn status(&self) -> OutboxStatus {
        match self {
            Transition::Sent { .. } => OutboxStatus::Sent,
            Transition::Reschedule { .. } => OutboxStatus::Pending,
            Transition::Dead { .. } => OutboxStatus::Dead,
        }
    }

    pub(crate) fn apply_to(&self, event: &mut OutboxEvent, now: DateTime<Utc>) {
        event.status = self.status();
        event.updated_at = now;
        match self {
            Transition::Sent { marker } => {
                event.next_retry_at = None;
                event.last_error = marker.clone();
            }
            Transition::Reschedule {
                retries,
                next_retry_at,
                last_error,
            } => {
                event.retries = *retries;
                event.next_retry_at = Some(*next_retry_at);
                event.last_error = Some(last_error.clone());
            }
            Transition::Dead { retries, last_error } => {
                event.retries = *retries;
                event.next_retry_at = None;
                event.last_error = Some(last_error.clone());
            }
        }
    }
}

/// Durable outbox table. The single source of truth for event status.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` pending rows whose type starts with `namespace` and
    /// whose `next_retry_at` is unset or not after `now`, oldest first.
    async fn fetch_due(
        &self,
        namespace: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Atomically move a row from `PENDING` to `SENDING`.
    ///
    /// Returns `false` when the row is no longer pending.
    async fn claim(&self, id: &EventId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Record the outcome of a handling attempt.
    ///
    /// Returns `false` when the row is no longer `SENDING`, e.g. because it
    /// was recovered as stale and picked up elsewhere.
    async fn resolve(
        &self,
        id: &EventId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Return rows stuck in `SENDING` since before `stale_before` to `PENDING`.
    async fn recover_stale(
        &self,
        namespace: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// Marker written to `last_error` by stale recovery.
pub const STALE_MARKER: &str = "stale sending";

/// In-memory outbox for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryOutbox {
    rows: Mutex<HashMap<EventId, OutboxEvent>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an event, replacing any row with the same id.
    pub async fn insert(&self, event: OutboxEvent) {
        self.rows.lock().await.insert(event.id.clone(), event);
    }

    pub async fn get(&self, id: &EventId) -> Option<OutboxEvent> {
        self.rows.lock().await.get(id).cloned()
    }

    /// All rows, oldest first.
    pub async fn snapshot(&self) -> Vec<OutboxEvent> {
        let mut rows: Vec<_> = self.rows.lock().await.values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        rows
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn fetch_due(
        &self,
        namespace: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows = self.rows.lock().await;
        let mut due: Vec<OutboxEvent> = rows
            .values()
            .filter(|e| e.event_type.starts_with(namespace) && e.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(&self, id: &EventId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if row.status != OutboxStatus::Pending {
            return Ok(false);
        }
        row.status = OutboxStatus::Sending;
        row.updated_at = now;
        Ok(true)
    }

    async fn resolve(
        &self,
        id: &EventId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if row.status != OutboxStatus::Sending {
            return Ok(false);
        }
        transition.apply_to(row, now);
        Ok(true)
    }

    async fn recover_stale(
        &self,
        namespace: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut recovered = 0;
        for row in rows.values_mut() {
            if row.status == OutboxStatus::Sending
                && row.event_type.starts_with(namespace)
                && row.updated_at < stale_before
            {
                row.status = OutboxStatus::Pending;
                row.updated_at = now;
                row.last_error = Some(STALE_MARKER.to_string());
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
