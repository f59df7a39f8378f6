//! Outbox writer: the producer-side API called inside business transactions

use crate::envelope::{default_routing_key, EventEnvelope, RawEnvelope};
use crate::outbox::{OutboxError, OutboxRecord, OutboxResult, OutboxStore};
use crate::registry::{EventPayload, EventRegistry};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// The entity an event concerns; also the ordering key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRef {
    pub aggregate_type: String,
    pub aggregate_id: String,
}

impl AggregateRef {
    pub fn new(aggregate_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
        }
    }
}

/// Optional envelope metadata for [`OutboxWriter::emit`]
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub routing_key: Option<String>,
    pub tenant_id: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub event_id: Option<Uuid>,
    pub occurred_at: Option<DateTime<Utc>>,
}

impl EmitOptions {
    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }
}

/// Appends validated events to the outbox within the caller's transaction
///
/// The writer never talks to the broker: if the surrounding transaction
/// commits the record is durable and the relay will publish it, if it rolls
/// back the record never existed.
///
/// # Example
/// ```rust
/// use event_bus::{AggregateRef, EmitOptions, EventRegistry, InMemoryOutboxStore, OutboxWriter};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), event_bus::OutboxError> {
/// let registry = EventRegistry::new().with_validator("billing.subscription.created", 1, |_| Ok(()));
/// let store = InMemoryOutboxStore::new();
/// let writer = OutboxWriter::new(store.clone(), registry, "subscriptions");
///
/// let mut tx = store.begin();
/// writer
///     .emit(
///         &mut tx,
///         "billing.subscription.created",
///         1,
///         AggregateRef::new("subscription", "s1"),
///         json!({"subscriptionID": "s1", "coachID": "c1"}),
///         EmitOptions::default(),
///     )
///     .await?;
/// tx.commit()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct OutboxWriter<S> {
    store: S,
    registry: EventRegistry,
    producer: String,
    source: String,
}

impl<S: OutboxStore> OutboxWriter<S> {
    pub fn new(store: S, registry: EventRegistry, producer: impl Into<String>) -> Self {
        let producer = producer.into();
        Self {
            store,
            registry,
            source: producer.clone(),
            producer,
        }
    }

    /// Component name stamped into `source` (defaults to the producer)
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    /// Append a complete envelope to the outbox
    ///
    /// Rejects unknown `(eventType, schemaVersion)` pairs and invalid payloads
    /// before anything is written.
    pub async fn append(
        &self,
        tx: &mut S::Tx<'_>,
        envelope: RawEnvelope,
        routing_key: Option<&str>,
    ) -> OutboxResult<OutboxRecord> {
        self.registry.validate_envelope(&envelope)?;

        let routing_key = match routing_key {
            Some(key) => {
                validate_routing_key(key)?;
                key.to_string()
            }
            None => default_routing_key(&envelope.event_type),
        };

        let record = OutboxRecord::pending(&envelope, routing_key)?;
        self.store.insert(tx, &record).await?;

        tracing::debug!(
            event_id = %record.event_id,
            event_type = %record.event_type,
            aggregate_id = %record.aggregate_id,
            routing_key = %record.routing_key,
            "Event appended to outbox"
        );

        Ok(record)
    }

    /// Build an envelope from the writer's producer settings and append it
    pub async fn emit(
        &self,
        tx: &mut S::Tx<'_>,
        event_type: &str,
        schema_version: u32,
        aggregate: AggregateRef,
        payload: Value,
        options: EmitOptions,
    ) -> OutboxResult<OutboxRecord> {
        let mut envelope = EventEnvelope::new(event_type, schema_version, &self.producer, payload)
            .with_source(&self.source)
            .with_aggregate(aggregate.aggregate_type, aggregate.aggregate_id)
            .with_tenant_id(options.tenant_id)
            .with_correlation_id(options.correlation_id)
            .with_causation_id(options.causation_id);
        if let Some(event_id) = options.event_id {
            envelope = envelope.with_event_id(event_id);
        }
        if let Some(at) = options.occurred_at {
            envelope = envelope.with_occurred_at(at);
        }

        self.append(tx, envelope, options.routing_key.as_deref())
            .await
    }

    /// Emit a typed payload; type, version and aggregate come from `T`
    pub async fn emit_typed<T: EventPayload>(
        &self,
        tx: &mut S::Tx<'_>,
        payload: &T,
        options: EmitOptions,
    ) -> OutboxResult<OutboxRecord> {
        let aggregate = AggregateRef::new(T::AGGREGATE_TYPE, payload.aggregate_id());
        let payload = serde_json::to_value(payload)?;
        self.emit(
            tx,
            T::EVENT_TYPE,
            T::SCHEMA_VERSION,
            aggregate,
            payload,
            options,
        )
        .await
    }
}

fn validate_routing_key(key: &str) -> OutboxResult<()> {
    let valid = !key.is_empty()
        && key.split('.').all(|token| {
            !token.is_empty()
                && !token.contains(['*', '>'])
                && !token.chars().any(char::is_whitespace)
        });
    if valid {
        Ok(())
    } else {
        Err(OutboxError::InvalidRoutingKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryOutboxStore, OutboxStatus, RegistryError};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Created {
        #[serde(rename = "subscriptionID")]
        subscription_id: String,
        #[serde(rename = "coachID")]
        coach_id: String,
    }

    impl EventPayload for Created {
        const EVENT_TYPE: &'static str = "billing.subscription.created";
        const SCHEMA_VERSION: u32 = 1;
        const AGGREGATE_TYPE: &'static str = "subscription";

        fn aggregate_id(&self) -> String {
            self.subscription_id.clone()
        }
    }

    fn writer() -> (InMemoryOutboxStore, OutboxWriter<InMemoryOutboxStore>) {
        let store = InMemoryOutboxStore::new();
        let registry = EventRegistry::new().with::<Created>();
        let writer = OutboxWriter::new(store.clone(), registry, "subscriptions")
            .with_source("subscriptions-api");
        (store, writer)
    }

    #[tokio::test]
    async fn emit_typed_builds_full_envelope() {
        let (store, writer) = writer();
        let mut tx = store.begin();
        let record = writer
            .emit_typed(
                &mut tx,
                &Created {
                    subscription_id: "s1".into(),
                    coach_id: "c1".into(),
                },
                EmitOptions::default().tenant("t1").correlation("req-1"),
            )
            .await
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(record.aggregate_type, "subscription");
        assert_eq!(record.aggregate_id, "s1");
        assert_eq!(record.routing_key, "billing.subscription.created");
        assert_eq!(record.envelope["producer"], json!("subscriptions"));
        assert_eq!(record.envelope["source"], json!("subscriptions-api"));
        assert_eq!(record.envelope["tenantID"], json!("t1"));
        assert_eq!(record.envelope["correlationID"], json!("req-1"));
        assert!(record.envelope.get("causationID").is_none());

        let stored = store.records();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_before_write() {
        let (store, writer) = writer();
        let mut tx = store.begin();
        let err = writer
            .emit(
                &mut tx,
                "billing.subscription.created",
                1,
                AggregateRef::new("subscription", "s1"),
                json!({"subscriptionID": "s1"}),
                EmitOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OutboxError::Validation(RegistryError::InvalidPayload { .. })
        ));
        assert!(tx.staged().is_empty());
    }

    #[tokio::test]
    async fn unknown_version_is_rejected() {
        let (store, writer) = writer();
        let mut tx = store.begin();
        let err = writer
            .emit(
                &mut tx,
                "billing.subscription.created",
                2,
                AggregateRef::new("subscription", "s1"),
                json!({"subscriptionID": "s1", "coachID": "c1"}),
                EmitOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OutboxError::Validation(RegistryError::UnknownEvent { .. })
        ));
    }

    #[tokio::test]
    async fn routing_key_override_is_validated() {
        let (store, writer) = writer();
        let payload = json!({"subscriptionID": "s1", "coachID": "c1"});
        let mut tx = store.begin();

        let record = writer
            .emit(
                &mut tx,
                "billing.subscription.created",
                1,
                AggregateRef::new("subscription", "s1"),
                payload.clone(),
                EmitOptions::default().routing_key("billing.subscription.created.eu"),
            )
            .await
            .unwrap();
        assert_eq!(record.routing_key, "billing.subscription.created.eu");

        let err = writer
            .emit(
                &mut tx,
                "billing.subscription.created",
                1,
                AggregateRef::new("subscription", "s1"),
                payload,
                EmitOptions::default().routing_key("billing.>"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::InvalidRoutingKey(_)));
    }

    #[tokio::test]
    async fn rollback_discards_appended_event() {
        let (store, writer) = writer();
        let mut tx = store.begin();
        writer
            .emit_typed(
                &mut tx,
                &Created {
                    subscription_id: "s1".into(),
                    coach_id: "c1".into(),
                },
                EmitOptions::default(),
            )
            .await
            .unwrap();
        tx.rollback();

        assert!(store.records().is_empty());
    }
}
