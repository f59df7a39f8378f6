//! Subscription rows, written in the same transaction as the outbox record

use crate::error::SubscriptionError;
use crate::models::Subscription;
use async_trait::async_trait;
use event_bus::{InMemoryOutboxStore, OutboxStore, PgOutboxStore};
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Transaction type shared by the repository and its outbox
pub type RepoTx<R> = <<R as SubscriptionRepository>::Outbox as OutboxStore>::Tx<'static>;

#[async_trait]
pub trait SubscriptionRepository: Send + Sync + 'static {
    type Outbox: OutboxStore;

    fn outbox(&self) -> &Self::Outbox;

    async fn begin(&self) -> Result<RepoTx<Self>, SubscriptionError>;

    async fn commit(&self, tx: RepoTx<Self>) -> Result<(), SubscriptionError>;

    async fn insert(
        &self,
        tx: &mut RepoTx<Self>,
        subscription: &Subscription,
    ) -> Result<(), SubscriptionError>;

    /// Fetch and lock a row for the rest of the transaction
    async fn get_for_update(
        &self,
        tx: &mut RepoTx<Self>,
        id: Uuid,
    ) -> Result<Option<Subscription>, SubscriptionError>;

    async fn update(
        &self,
        tx: &mut RepoTx<Self>,
        subscription: &Subscription,
    ) -> Result<(), SubscriptionError>;

    async fn get(&self, id: Uuid) -> Result<Option<Subscription>, SubscriptionError>;
}

#[derive(Clone, Debug)]
pub struct PgSubscriptionRepository {
    outbox: PgOutboxStore,
}

impl PgSubscriptionRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            outbox: PgOutboxStore::new(pool),
        }
    }
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    type Outbox = PgOutboxStore;

    fn outbox(&self) -> &PgOutboxStore {
        &self.outbox
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, SubscriptionError> {
        Ok(self.outbox.begin().await?)
    }

    async fn commit(&self, tx: Transaction<'static, Postgres>) -> Result<(), SubscriptionError> {
        tx.commit().await?;
        Ok(())
    }

    async fn insert(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        s: &Subscription,
    ) -> Result<(), SubscriptionError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, tenant_id, coach_id, client_id, plan_id, price_minor, currency,
                status, cancel_reason, created_at, cancelled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(s.id)
        .bind(&s.tenant_id)
        .bind(&s.coach_id)
        .bind(&s.client_id)
        .bind(&s.plan_id)
        .bind(s.price_minor)
        .bind(&s.currency)
        .bind(&s.status)
        .bind(&s.cancel_reason)
        .bind(s.created_at)
        .bind(s.cancelled_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn get_for_update(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        id: Uuid,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT id, tenant_id, coach_id, client_id, plan_id, price_minor, currency,
                   status, cancel_reason, created_at, cancelled_at
            FROM subscriptions
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row)
    }

    async fn update(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        s: &Subscription,
    ) -> Result<(), SubscriptionError> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2, cancel_reason = $3, cancelled_at = $4
            WHERE id = $1
            "#,
        )
        .bind(s.id)
        .bind(&s.status)
        .bind(&s.cancel_reason)
        .bind(s.cancelled_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Subscription>, SubscriptionError> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT id, tenant_id, coach_id, client_id, plan_id, price_minor, currency,
                   status, cancel_reason, created_at, cancelled_at
            FROM subscriptions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.outbox.pool())
        .await?;
        Ok(row)
    }
}

/// In-process repository; rows become visible when the outbox transaction commits
#[derive(Clone, Default)]
pub struct InMemorySubscriptionRepository {
    outbox: InMemoryOutboxStore,
    rows: Arc<Mutex<HashMap<Uuid, Subscription>>>,
}

impl InMemorySubscriptionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outbox(outbox: InMemoryOutboxStore) -> Self {
        Self {
            outbox,
            rows: Arc::default(),
        }
    }

    fn stage(&self, tx: &mut event_bus::MemoryTx, subscription: &Subscription) {
        let rows = self.rows.clone();
        let row = subscription.clone();
        tx.on_commit(move || {
            rows.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(row.id, row);
        });
    }
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptionRepository {
    type Outbox = InMemoryOutboxStore;

    fn outbox(&self) -> &InMemoryOutboxStore {
        &self.outbox
    }

    async fn begin(&self) -> Result<event_bus::MemoryTx, SubscriptionError> {
        Ok(self.outbox.begin())
    }

    async fn commit(&self, tx: event_bus::MemoryTx) -> Result<(), SubscriptionError> {
        tx.commit()?;
        Ok(())
    }

    async fn insert(
        &self,
        tx: &mut event_bus::MemoryTx,
        subscription: &Subscription,
    ) -> Result<(), SubscriptionError> {
        self.stage(tx, subscription);
        Ok(())
    }

    async fn get_for_update(
        &self,
        _tx: &mut event_bus::MemoryTx,
        id: Uuid,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        self.get(id).await
    }

    async fn update(
        &self,
        tx: &mut event_bus::MemoryTx,
        subscription: &Subscription,
    ) -> Result<(), SubscriptionError> {
        self.stage(tx, subscription);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Subscription>, SubscriptionError> {
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }
}
