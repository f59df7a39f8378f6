//! Transactional outbox storage
//!
//! Records are inserted inside the caller's business transaction and later
//! claimed, published and marked by the relay. Two backends share the
//! [`OutboxStore`] contract: [`PgOutboxStore`] for services and
//! [`InMemoryOutboxStore`] for tests and local development.

mod memory;
mod postgres;

pub use memory::{InMemoryOutboxStore, MemoryTx};
pub use postgres::PgOutboxStore;

use crate::envelope::RawEnvelope;
use crate::registry::RegistryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("event rejected: {0}")]
    Validation(#[from] RegistryError),

    #[error("invalid routing key '{0}'")]
    InvalidRoutingKey(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt outbox row {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },

    #[error("outbox record {0} not found")]
    NotFound(Uuid),

    #[error("transaction already finished")]
    TransactionClosed,
}

pub type OutboxResult<T> = Result<T, OutboxError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxStatus {
    Pending,
    Published,
    /// Retries exhausted; waits for an operator
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "published" => Ok(OutboxStatus::Published),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(format!("unknown outbox status '{}'", other)),
        }
    }
}

/// One event waiting in (or delivered from) a service's outbox
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: Uuid,
    /// Insertion order, assigned by the store
    pub seq: i64,
    pub event_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub schema_version: i32,
    /// Full wire envelope
    pub envelope: Value,
    pub routing_key: String,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Build a pending record for an already validated envelope
    ///
    /// Envelopes without an aggregate are ordered on their own event ID.
    pub fn pending(envelope: &RawEnvelope, routing_key: String) -> OutboxResult<Self> {
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            seq: 0,
            event_id: envelope.event_id,
            aggregate_type: envelope
                .aggregate_type
                .clone()
                .unwrap_or_else(|| envelope.event_type.clone()),
            aggregate_id: envelope.ordering_key(),
            event_type: envelope.event_type.clone(),
            schema_version: envelope.schema_version as i32,
            envelope: serde_json::to_value(envelope)?,
            routing_key,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            lease_owner: None,
            lease_expires_at: None,
            next_attempt_at: now,
            created_at: now,
            published_at: None,
        })
    }

    pub fn payload(&self) -> Option<&Value> {
        self.envelope.get("payload")
    }

    /// Wire bytes of the stored envelope
    pub fn envelope_bytes(&self) -> OutboxResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.envelope)?)
    }
}

/// `now + lease`, saturating at a century for absurd leases
pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Storage backend for outbox records
///
/// `insert` joins the caller's transaction; every other operation is the
/// relay's and runs on its own.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    /// Business transaction the record is written in
    type Tx<'t>: Send;

    async fn insert(&self, tx: &mut Self::Tx<'_>, record: &OutboxRecord) -> OutboxResult<()>;

    /// Lease up to `limit` due pending records to `owner` for `lease`
    ///
    /// Only the oldest unpublished record of each aggregate is eligible, and
    /// only if it is pending, due, and unleased or its lease expired. A failed
    /// record therefore blocks its aggregate. Results are in `seq` order.
    async fn claim_batch(
        &self,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> OutboxResult<Vec<OutboxRecord>>;

    /// Mark a leased record published; `false` when `owner` lost the lease
    async fn mark_published(&self, id: Uuid, owner: &str) -> OutboxResult<bool>;

    /// Count a failed attempt and release the lease
    ///
    /// The record goes back to pending until `retry_at`, or to failed once
    /// `max_attempts` is reached. Returns the resulting status.
    async fn record_failure(
        &self,
        id: Uuid,
        owner: &str,
        error: &str,
        retry_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> OutboxResult<OutboxStatus>;

    /// Give claimed records back without counting an attempt
    async fn release(&self, ids: &[Uuid], owner: &str) -> OutboxResult<u64>;

    /// Delete published records older than `older_than`
    async fn purge_published(&self, older_than: DateTime<Utc>) -> OutboxResult<u64>;

    async fn find(&self, id: Uuid) -> OutboxResult<Option<OutboxRecord>>;

    /// Operator action: reset a failed record to pending with zero attempts
    async fn requeue_failed(&self, id: Uuid) -> OutboxResult<bool>;
}
