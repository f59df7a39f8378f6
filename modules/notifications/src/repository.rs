//! Notification storage
//!
//! `(source_event_id, template)` is unique, so creating the notification for
//! an event is itself idempotent. The Postgres repository also writes the
//! consumer's ledger entry in the same transaction.

use crate::error::RepositoryError;
use crate::models::Notification;
use async_trait::async_trait;
use event_consumer::PgLedger;
use sqlx::PgPool;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Store `notification` for the event that caused it; `false` when it already existed
    async fn create_for_event(
        &self,
        notification: &Notification,
        event_type: &str,
    ) -> Result<bool, RepositoryError>;

    async fn list_by_reference(&self, reference_id: &str) -> Result<Vec<Notification>, RepositoryError>;
}

#[derive(Clone, Debug)]
pub struct PgNotificationRepository {
    pool: PgPool,
    consumer_name: String,
}

impl PgNotificationRepository {
    pub fn new(pool: PgPool, consumer_name: impl Into<String>) -> Self {
        Self {
            pool,
            consumer_name: consumer_name.into(),
        }
    }
}

#[async_trait]
impl NotificationRepository for PgNotificationRepository {
    async fn create_for_event(
        &self,
        n: &Notification,
        event_type: &str,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO notifications (
                id, tenant_id, source_event_id, template, channel, recipient_id,
                reference_id, body, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (source_event_id, template) DO NOTHING
            "#,
        )
        .bind(n.id)
        .bind(&n.tenant_id)
        .bind(n.source_event_id)
        .bind(&n.template)
        .bind(&n.channel)
        .bind(&n.recipient_id)
        .bind(&n.reference_id)
        .bind(&n.body)
        .bind(&n.status)
        .bind(n.created_at)
        .execute(&mut *tx)
        .await?;

        PgLedger::record_in_tx(&mut tx, n.source_event_id, &self.consumer_name, event_type)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_by_reference(&self, reference_id: &str) -> Result<Vec<Notification>, RepositoryError> {
        let rows = sqlx::query_as::<_, Notification>(
            r#"
            SELECT id, tenant_id, source_event_id, template, channel, recipient_id,
                   reference_id, body, status, created_at
            FROM notifications
            WHERE reference_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(reference_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationRepository {
    rows: Arc<Mutex<Vec<Notification>>>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Notification> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn exists(rows: &[Notification], source_event_id: Uuid, template: &str) -> bool {
        rows.iter()
            .any(|n| n.source_event_id == source_event_id && n.template == template)
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationRepository {
    async fn create_for_event(
        &self,
        notification: &Notification,
        _event_type: &str,
    ) -> Result<bool, RepositoryError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        if Self::exists(&rows, notification.source_event_id, &notification.template) {
            return Ok(false);
        }
        rows.push(notification.clone());
        Ok(true)
    }

    async fn list_by_reference(&self, reference_id: &str) -> Result<Vec<Notification>, RepositoryError> {
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|n| n.reference_id == reference_id)
            .cloned()
            .collect())
    }
}
