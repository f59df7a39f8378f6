//! Postgres-backed outbox (`events_outbox` table)

use super::{OutboxError, OutboxRecord, OutboxResult, OutboxStatus, OutboxStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../sql/events_outbox.sql");

const COLUMNS: &str = "id, seq, event_id, aggregate_type, aggregate_id, event_type, \
     schema_version, envelope, routing_key, status, attempts, last_error, lease_owner, \
     lease_expires_at, next_attempt_at, created_at, published_at";

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    seq: i64,
    event_id: Uuid,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    schema_version: i32,
    envelope: serde_json::Value,
    routing_key: String,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    next_attempt_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = OutboxError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<OutboxStatus>()
            .map_err(|reason| OutboxError::Corrupt { id: row.id, reason })?;

        Ok(OutboxRecord {
            id: row.id,
            seq: row.seq,
            event_id: row.event_id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            schema_version: row.schema_version,
            envelope: row.envelope,
            routing_key: row.routing_key,
            status,
            attempts: row.attempts,
            last_error: row.last_error,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
            published_at: row.published_at,
        })
    }
}

/// Outbox stored in the service's own Postgres database
#[derive(Clone, Debug)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table and indexes if missing
    pub async fn ensure_schema(&self) -> OutboxResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Start the business transaction records are appended in
    pub async fn begin(&self) -> OutboxResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn count_by_status(&self, status: OutboxStatus) -> OutboxResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM events_outbox WHERE status = $1",
        )
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Failed records, oldest first, for operator review
    pub async fn list_failed(&self, limit: i64) -> OutboxResult<Vec<OutboxRecord>> {
        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {COLUMNS} FROM events_outbox WHERE status = 'failed' ORDER BY seq LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OutboxRecord::try_from).collect()
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    type Tx<'t> = Transaction<'t, Postgres>;

    async fn insert(&self, tx: &mut Self::Tx<'_>, record: &OutboxRecord) -> OutboxResult<()> {
        // `seq` is taken at insert time; writers of one aggregate must commit
        // in that order, so they queue on a lock held until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{}:{}", record.aggregate_type, record.aggregate_id))
            .execute(&mut **tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO events_outbox (
                id, event_id, aggregate_type, aggregate_id, event_type, schema_version,
                envelope, routing_key, status, attempts, next_attempt_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(record.event_id)
        .bind(&record.aggregate_type)
        .bind(&record.aggregate_id)
        .bind(&record.event_type)
        .bind(record.schema_version)
        .bind(&record.envelope)
        .bind(&record.routing_key)
        .bind(OutboxStatus::Pending.as_str())
        .bind(record.next_attempt_at)
        .bind(record.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn claim_batch(
        &self,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> OutboxResult<Vec<OutboxRecord>> {
        // Lease conditions sit on `o` so a concurrent claimer's commit is
        // re-checked after the row lock is acquired.
        let sql = format!(
            r#"
            WITH heads AS (
                SELECT DISTINCT ON (aggregate_type, aggregate_id) id
                FROM events_outbox
                WHERE status <> 'published'
                ORDER BY aggregate_type, aggregate_id, seq
            ),
            candidates AS (
                SELECT o.id
                FROM events_outbox o
                JOIN heads h ON h.id = o.id
                WHERE o.status = 'pending'
                  AND o.next_attempt_at <= NOW()
                  AND (o.lease_expires_at IS NULL OR o.lease_expires_at <= NOW())
                ORDER BY o.seq
                LIMIT $3
                FOR UPDATE OF o SKIP LOCKED
            )
            UPDATE events_outbox o
            SET lease_owner = $1,
                lease_expires_at = NOW() + make_interval(secs => $2::double precision)
            FROM candidates c
            WHERE o.id = c.id
            RETURNING {}
            "#,
            COLUMNS
                .split(", ")
                .map(|c| format!("o.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(owner)
            .bind(lease.as_secs_f64())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut records = rows
            .into_iter()
            .map(OutboxRecord::try_from)
            .collect::<OutboxResult<Vec<_>>>()?;
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }

    async fn mark_published(&self, id: Uuid, owner: &str) -> OutboxResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE events_outbox
            SET status = 'published',
                published_at = NOW(),
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND status = 'pending' AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        owner: &str,
        error: &str,
        retry_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> OutboxResult<OutboxStatus> {
        let updated: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE events_outbox
            SET attempts = attempts + 1,
                last_error = $3,
                lease_owner = NULL,
                lease_expires_at = NULL,
                status = CASE WHEN attempts + 1 >= $5 THEN 'failed' ELSE 'pending' END,
                next_attempt_at = CASE WHEN attempts + 1 >= $5 THEN next_attempt_at ELSE $4 END
            WHERE id = $1 AND status = 'pending' AND lease_owner = $2
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(error)
        .bind(retry_at)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await?;

        let status = match updated {
            Some(status) => status,
            // Lease was lost; report the record as it stands
            None => self
                .find(id)
                .await?
                .map(|r| r.status.as_str().to_string())
                .ok_or(OutboxError::NotFound(id))?,
        };

        status
            .parse::<OutboxStatus>()
            .map_err(|reason| OutboxError::Corrupt { id, reason })
    }

    async fn release(&self, ids: &[Uuid], owner: &str) -> OutboxResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE events_outbox
            SET lease_owner = NULL, lease_expires_at = NULL
            WHERE id = ANY($1) AND status = 'pending' AND lease_owner = $2
            "#,
        )
        .bind(ids)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn purge_published(&self, older_than: DateTime<Utc>) -> OutboxResult<u64> {
        let result = sqlx::query(
            "DELETE FROM events_outbox WHERE status = 'published' AND published_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn find(&self, id: Uuid) -> OutboxResult<Option<OutboxRecord>> {
        let row = sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {COLUMNS} FROM events_outbox WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OutboxRecord::try_from).transpose()
    }

    async fn requeue_failed(&self, id: Uuid) -> OutboxResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE events_outbox
            SET status = 'pending',
                attempts = 0,
                next_attempt_at = NOW(),
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
