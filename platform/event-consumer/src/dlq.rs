//! Dead-letter handling
//!
//! Envelopes a consumer gives up on are written to a [`DeadLetterSink`]. The
//! Postgres and in-memory stores also keep them for inspection and replay
//! (republish to the original subject) through [`DeadLetterReplayer`].

use crate::error::DeadLetterError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::{BrokerClient, BusMessage, HEADER_EVENT_TYPE, HEADER_MSG_ID};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../sql/failed_events.sql");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    /// Handler declared the envelope unprocessable
    Poison,
    /// Transient failures outlasted the attempt budget
    RetriesExhausted,
    /// Not a decodable envelope
    Malformed,
}

impl DeadLetterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterKind::Poison => "poison",
            DeadLetterKind::RetriesExhausted => "retries_exhausted",
            DeadLetterKind::Malformed => "malformed",
        }
    }
}

impl fmt::Display for DeadLetterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeadLetterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poison" => Ok(DeadLetterKind::Poison),
            "retries_exhausted" => Ok(DeadLetterKind::RetriesExhausted),
            "malformed" => Ok(DeadLetterKind::Malformed),
            other => Err(format!("unknown dead letter kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event_id: Uuid,
    pub consumer_name: String,
    /// Subject the envelope was received on
    pub subject: String,
    pub event_type: Option<String>,
    /// Parsed envelope, or `{"raw": "<text>"}` when it was not JSON
    pub envelope: Value,
    pub error: String,
    pub kind: DeadLetterKind,
    pub attempts: i32,
    pub failed_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
}

impl DeadLetter {
    /// Keep the received bytes as JSON when possible, otherwise as text
    pub fn envelope_from_bytes(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap_or_else(|_| {
            serde_json::json!({ "raw": String::from_utf8_lossy(bytes) })
        })
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Persist a dead letter; re-dead-lettering the same event updates it
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

/// A sink that also supports inspection and replay bookkeeping
#[async_trait]
pub trait DeadLetterStore: DeadLetterSink {
    /// Letters not yet replayed, oldest first
    async fn list_pending(
        &self,
        consumer: &str,
        limit: i64,
    ) -> Result<Vec<DeadLetter>, DeadLetterError>;

    async fn get(
        &self,
        event_id: Uuid,
        consumer: &str,
    ) -> Result<Option<DeadLetter>, DeadLetterError>;

    async fn mark_replayed(&self, event_id: Uuid, consumer: &str) -> Result<bool, DeadLetterError>;

    /// Operator discard
    async fn delete(&self, event_id: Uuid, consumer: &str) -> Result<bool, DeadLetterError>;
}

#[derive(Clone, Default)]
pub struct InMemoryDeadLetterStore {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterStore {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let mut letters = self.letters.lock().unwrap_or_else(PoisonError::into_inner);
        match letters
            .iter_mut()
            .find(|l| l.event_id == letter.event_id && l.consumer_name == letter.consumer_name)
        {
            Some(existing) => {
                existing.error = letter.error.clone();
                existing.kind = letter.kind;
                existing.attempts = letter.attempts;
                existing.failed_at = letter.failed_at;
                existing.replayed_at = None;
            }
            None => letters.push(letter.clone()),
        }
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn list_pending(
        &self,
        consumer: &str,
        limit: i64,
    ) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let letters = self.letters.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(letters
            .iter()
            .filter(|l| l.consumer_name == consumer && l.replayed_at.is_none())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn get(
        &self,
        event_id: Uuid,
        consumer: &str,
    ) -> Result<Option<DeadLetter>, DeadLetterError> {
        let letters = self.letters.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(letters
            .iter()
            .find(|l| l.event_id == event_id && l.consumer_name == consumer)
            .cloned())
    }

    async fn mark_replayed(&self, event_id: Uuid, consumer: &str) -> Result<bool, DeadLetterError> {
        let mut letters = self.letters.lock().unwrap_or_else(PoisonError::into_inner);
        match letters
            .iter_mut()
            .find(|l| l.event_id == event_id && l.consumer_name == consumer)
        {
            Some(letter) => {
                letter.replayed_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, event_id: Uuid, consumer: &str) -> Result<bool, DeadLetterError> {
        let mut letters = self.letters.lock().unwrap_or_else(PoisonError::into_inner);
        let before = letters.len();
        letters.retain(|l| !(l.event_id == event_id && l.consumer_name == consumer));
        Ok(letters.len() < before)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FailedEventRow {
    event_id: Uuid,
    consumer_name: String,
    subject: String,
    event_type: Option<String>,
    envelope: Value,
    error: String,
    kind: String,
    attempts: i32,
    failed_at: DateTime<Utc>,
    replayed_at: Option<DateTime<Utc>>,
}

impl TryFrom<FailedEventRow> for DeadLetter {
    type Error = DeadLetterError;

    fn try_from(row: FailedEventRow) -> Result<Self, Self::Error> {
        Ok(DeadLetter {
            kind: row.kind.parse().map_err(DeadLetterError::Corrupt)?,
            event_id: row.event_id,
            consumer_name: row.consumer_name,
            subject: row.subject,
            event_type: row.event_type,
            envelope: row.envelope,
            error: row.error,
            attempts: row.attempts,
            failed_at: row.failed_at,
            replayed_at: row.replayed_at,
        })
    }
}

/// Dead letters in the consumer's Postgres database (`failed_events`)
#[derive(Clone, Debug)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), DeadLetterError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterStore {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        sqlx::query(
            r#"
            INSERT INTO failed_events (
                event_id, consumer_name, subject, event_type, envelope, error, kind, attempts, failed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (event_id, consumer_name) DO UPDATE
            SET error = EXCLUDED.error,
                kind = EXCLUDED.kind,
                attempts = EXCLUDED.attempts,
                failed_at = EXCLUDED.failed_at,
                replayed_at = NULL
            "#,
        )
        .bind(letter.event_id)
        .bind(&letter.consumer_name)
        .bind(&letter.subject)
        .bind(&letter.event_type)
        .bind(&letter.envelope)
        .bind(&letter.error)
        .bind(letter.kind.as_str())
        .bind(letter.attempts)
        .bind(letter.failed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

const DEAD_LETTER_COLUMNS: &str = "event_id, consumer_name, subject, event_type, envelope, \
     error, kind, attempts, failed_at, replayed_at";

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn list_pending(
        &self,
        consumer: &str,
        limit: i64,
    ) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let rows = sqlx::query_as::<_, FailedEventRow>(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM failed_events \
             WHERE consumer_name = $1 AND replayed_at IS NULL \
             ORDER BY failed_at LIMIT $2"
        ))
        .bind(consumer)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeadLetter::try_from).collect()
    }

    async fn get(
        &self,
        event_id: Uuid,
        consumer: &str,
    ) -> Result<Option<DeadLetter>, DeadLetterError> {
        let row = sqlx::query_as::<_, FailedEventRow>(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM failed_events \
             WHERE event_id = $1 AND consumer_name = $2"
        ))
        .bind(event_id)
        .bind(consumer)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeadLetter::try_from).transpose()
    }

    async fn mark_replayed(&self, event_id: Uuid, consumer: &str) -> Result<bool, DeadLetterError> {
        let result = sqlx::query(
            "UPDATE failed_events SET replayed_at = NOW() WHERE event_id = $1 AND consumer_name = $2",
        )
        .bind(event_id)
        .bind(consumer)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, event_id: Uuid, consumer: &str) -> Result<bool, DeadLetterError> {
        let result =
            sqlx::query("DELETE FROM failed_events WHERE event_id = $1 AND consumer_name = $2")
                .bind(event_id)
                .bind(consumer)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// Publishes dead letters to `dlq.<consumer>.<kind>` for broker-side tooling
#[derive(Clone, Debug)]
pub struct BusDeadLetterSink {
    broker: BrokerClient,
    prefix: String,
}

impl BusDeadLetterSink {
    pub fn new(broker: BrokerClient) -> Self {
        Self {
            broker,
            prefix: "dlq".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

#[async_trait]
impl DeadLetterSink for BusDeadLetterSink {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let subject = format!("{}.{}.{}", self.prefix, letter.consumer_name, letter.kind);
        let mut headers = HashMap::new();
        headers.insert(
            HEADER_MSG_ID.to_string(),
            format!("{}-{}", letter.event_id, letter.consumer_name),
        );
        if let Some(event_type) = &letter.event_type {
            headers.insert(HEADER_EVENT_TYPE.to_string(), event_type.clone());
        }

        let msg = BusMessage::new(subject, serde_json::to_vec(letter)?).with_headers(headers);
        self.broker.publish_confirmed(msg).await?;
        Ok(())
    }
}

/// Writes to every sink in order; the first failure aborts
pub struct FanoutDeadLetterSink {
    sinks: Vec<Arc<dyn DeadLetterSink>>,
}

impl FanoutDeadLetterSink {
    pub fn new(sinks: Vec<Arc<dyn DeadLetterSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl DeadLetterSink for FanoutDeadLetterSink {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        for sink in &self.sinks {
            sink.dead_letter(letter).await?;
        }
        Ok(())
    }
}

/// Operator tool: put dead-lettered envelopes back on their subject
pub struct DeadLetterReplayer {
    store: Arc<dyn DeadLetterStore>,
    broker: BrokerClient,
}

impl DeadLetterReplayer {
    pub fn new(store: Arc<dyn DeadLetterStore>, broker: BrokerClient) -> Self {
        Self { store, broker }
    }

    /// Republish one dead letter and mark it replayed
    pub async fn replay(&self, event_id: Uuid, consumer: &str) -> Result<(), DeadLetterError> {
        let letter = self
            .store
            .get(event_id, consumer)
            .await?
            .ok_or_else(|| DeadLetterError::NotFound {
                event_id,
                consumer: consumer.to_string(),
            })?;

        if letter.kind == DeadLetterKind::Malformed {
            return Err(DeadLetterError::NotReplayable(event_id));
        }

        let mut headers = HashMap::new();
        // Fresh message ID so the broker's dedup window does not swallow the replay
        headers.insert(
            HEADER_MSG_ID.to_string(),
            format!("{}-replay-{}", letter.event_id, Utc::now().timestamp_millis()),
        );
        if let Some(event_type) = &letter.event_type {
            headers.insert(HEADER_EVENT_TYPE.to_string(), event_type.clone());
        }
        if let Some(aggregate_id) = letter.envelope.get("aggregateID").and_then(Value::as_str) {
            headers.insert(
                event_bus::HEADER_AGGREGATE_ID.to_string(),
                aggregate_id.to_string(),
            );
        }

        let msg = BusMessage::new(letter.subject.clone(), serde_json::to_vec(&letter.envelope)?)
            .with_headers(headers);
        self.broker.publish_confirmed(msg).await?;
        self.store.mark_replayed(event_id, consumer).await?;

        tracing::info!(
            event_id = %event_id,
            consumer = %consumer,
            subject = %letter.subject,
            "Dead letter replayed"
        );
        Ok(())
    }

    /// Replay up to `limit` pending letters; malformed ones are skipped
    pub async fn replay_pending(&self, consumer: &str, limit: i64) -> Result<usize, DeadLetterError> {
        let mut replayed = 0;
        for letter in self.store.list_pending(consumer, limit).await? {
            if letter.kind == DeadLetterKind::Malformed {
                continue;
            }
            self.replay(letter.event_id, consumer).await?;
            replayed += 1;
        }
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::{EventBus, InMemoryBus};
    use futures::StreamExt;
    use serde_json::json;

    fn letter(kind: DeadLetterKind) -> DeadLetter {
        DeadLetter {
            event_id: Uuid::new_v4(),
            consumer_name: "notifications".to_string(),
            subject: "events.billing.subscription.created".to_string(),
            event_type: Some("billing.subscription.created".to_string()),
            envelope: json!({"eventType": "billing.subscription.created", "aggregateID": "s1"}),
            error: "bad".to_string(),
            kind,
            attempts: 1,
            failed_at: Utc::now(),
            replayed_at: None,
        }
    }

    #[test]
    fn non_json_bytes_are_kept_as_text() {
        assert_eq!(
            DeadLetter::envelope_from_bytes(b"not json"),
            json!({"raw": "not json"})
        );
        assert_eq!(DeadLetter::envelope_from_bytes(b"{\"a\":1}"), json!({"a": 1}));
    }

    #[tokio::test]
    async fn re_dead_lettering_updates_in_place() {
        let store = InMemoryDeadLetterStore::new();
        let mut l = letter(DeadLetterKind::RetriesExhausted);
        store.dead_letter(&l).await.unwrap();

        l.attempts = 5;
        l.kind = DeadLetterKind::Poison;
        store.dead_letter(&l).await.unwrap();

        let all = store.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].attempts, 5);
        assert_eq!(all[0].kind, DeadLetterKind::Poison);
    }

    #[tokio::test]
    async fn replay_republishes_and_marks() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let broker = BrokerClient::from_bus(bus.clone());
        let mut stream = bus.subscribe("events.>").await.unwrap();

        let l = letter(DeadLetterKind::Poison);
        store.dead_letter(&l).await.unwrap();

        let replayer = DeadLetterReplayer::new(store.clone(), broker);
        assert_eq!(replayer.replay_pending("notifications", 10).await.unwrap(), 1);

        let msg = stream.next().await.unwrap();
        assert_eq!(msg.subject, l.subject);
        assert_eq!(msg.header(event_bus::HEADER_AGGREGATE_ID), Some("s1"));
        assert!(store
            .get(l.event_id, "notifications")
            .await
            .unwrap()
            .unwrap()
            .replayed_at
            .is_some());
        assert!(store.list_pending("notifications", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_letters_are_not_replayable() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let l = letter(DeadLetterKind::Malformed);
        store.dead_letter(&l).await.unwrap();

        let replayer = DeadLetterReplayer::new(
            store.clone(),
            BrokerClient::from_bus(Arc::new(InMemoryBus::new())),
        );
        assert!(matches!(
            replayer.replay(l.event_id, "notifications").await,
            Err(DeadLetterError::NotReplayable(_))
        ));
        assert!(matches!(
            replayer.replay(Uuid::new_v4(), "notifications").await,
            Err(DeadLetterError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn bus_sink_publishes_to_dlq_subject() {
        let bus = Arc::new(InMemoryBus::new());
        let sink = BusDeadLetterSink::new(BrokerClient::from_bus(bus.clone()));
        sink.dead_letter(&letter(DeadLetterKind::Poison)).await.unwrap();

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].subject, "dlq.notifications.poison");
        let body: DeadLetter = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(body.kind, DeadLetterKind::Poison);
    }
}
