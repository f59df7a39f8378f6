//! Processed-event ledger: the consumer side of exactly-once effects
//!
//! A row per `(event_id, consumer_name)` records that the consumer applied the
//! event. The unique key turns a concurrent or repeated insert into
//! [`LedgerOutcome::Duplicate`] instead of an error.

use crate::error::LedgerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../sql/processed_events.sql");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    Inserted,
    Duplicate,
}

#[async_trait]
pub trait ProcessedEventLedger: Send + Sync {
    async fn is_processed(&self, event_id: Uuid, consumer: &str) -> Result<bool, LedgerError>;

    async fn record(
        &self,
        event_id: Uuid,
        consumer: &str,
        event_type: &str,
    ) -> Result<LedgerOutcome, LedgerError>;
}

/// Ledger kept in process memory
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    entries: Arc<Mutex<HashMap<(Uuid, String), (String, DateTime<Utc>)>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProcessedEventLedger for InMemoryLedger {
    async fn is_processed(&self, event_id: Uuid, consumer: &str) -> Result<bool, LedgerError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(event_id, consumer.to_string())))
    }

    async fn record(
        &self,
        event_id: Uuid,
        consumer: &str,
        event_type: &str,
    ) -> Result<LedgerOutcome, LedgerError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (event_id, consumer.to_string());
        if entries.contains_key(&key) {
            return Ok(LedgerOutcome::Duplicate);
        }
        entries.insert(key, (event_type.to_string(), Utc::now()));
        Ok(LedgerOutcome::Inserted)
    }
}

/// Ledger in the consumer's Postgres database (`processed_events`)
#[derive(Clone, Debug)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Record inside the handler's own transaction, committing the ledger
    /// entry atomically with the side effect
    pub async fn record_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
        consumer: &str,
        event_type: &str,
    ) -> Result<LedgerOutcome, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, consumer_name, event_type)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id, consumer_name) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(consumer)
        .bind(event_type)
        .execute(&mut **tx)
        .await?;

        Ok(outcome(result.rows_affected()))
    }

    /// Drop ledger rows older than `older_than`; returns how many were removed
    pub async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, LedgerError> {
        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn outcome(rows_affected: u64) -> LedgerOutcome {
    if rows_affected == 0 {
        LedgerOutcome::Duplicate
    } else {
        LedgerOutcome::Inserted
    }
}

#[async_trait]
impl ProcessedEventLedger for PgLedger {
    async fn is_processed(&self, event_id: Uuid, consumer: &str) -> Result<bool, LedgerError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = $1 AND consumer_name = $2)",
        )
        .bind(event_id)
        .bind(consumer)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn record(
        &self,
        event_id: Uuid,
        consumer: &str,
        event_type: &str,
    ) -> Result<LedgerOutcome, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, consumer_name, event_type)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id, consumer_name) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(consumer)
        .bind(event_type)
        .execute(&self.pool)
        .await?;

        Ok(outcome(result.rows_affected()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_insert_is_reported_not_raised() {
        let ledger = InMemoryLedger::new();
        let event_id = Uuid::new_v4();

        assert!(!ledger.is_processed(event_id, "notifications").await.unwrap());
        assert_eq!(
            ledger
                .record(event_id, "notifications", "billing.subscription.created")
                .await
                .unwrap(),
            LedgerOutcome::Inserted
        );
        assert_eq!(
            ledger
                .record(event_id, "notifications", "billing.subscription.created")
                .await
                .unwrap(),
            LedgerOutcome::Duplicate
        );
        assert!(ledger.is_processed(event_id, "notifications").await.unwrap());
    }

    #[tokio::test]
    async fn entries_are_scoped_per_consumer() {
        let ledger = InMemoryLedger::new();
        let event_id = Uuid::new_v4();
        ledger.record(event_id, "notifications", "a.b.c").await.unwrap();

        assert!(!ledger.is_processed(event_id, "analytics").await.unwrap());
        assert_eq!(
            ledger.record(event_id, "analytics", "a.b.c").await.unwrap(),
            LedgerOutcome::Inserted
        );
        assert_eq!(ledger.len(), 2);
    }
}
