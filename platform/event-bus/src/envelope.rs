//! # Event Envelope
//!
//! Platform-wide event envelope for all inter-service communication. The wire
//! format is JSON with camelCase keys and is stable across every producer and
//! consumer:
//!
//! ```json
//! {
//!   "eventID": "6f1c…",
//!   "eventType": "billing.subscription.created",
//!   "schemaVersion": 1,
//!   "occurredAt": "2026-01-01T00:00:00Z",
//!   "producer": "subscriptions",
//!   "source": "subscriptions-api",
//!   "payload": { "subscriptionID": "s1", "coachID": "c1" }
//! }
//! ```
//!
//! `aggregateType`, `aggregateID`, `tenantID`, `correlationID` and
//! `causationID` are optional and omitted when absent.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Standard event envelope following the platform event contract
///
/// # Type Parameter
///
/// * `T` - The event-specific payload type; [`RawEnvelope`] keeps it as JSON
///
/// # Examples
///
/// ```rust
/// use event_bus::EventEnvelope;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct SubscriptionCreated {
///     subscription_id: String,
/// }
///
/// let envelope = EventEnvelope::new(
///     "billing.subscription.created",
///     1,
///     "subscriptions",
///     SubscriptionCreated { subscription_id: "s1".to_string() },
/// )
/// .with_aggregate("subscription", "s1")
/// .with_correlation_id(Some("req-42".to_string()));
/// assert_eq!(envelope.source, "subscriptions");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T = serde_json::Value> {
    /// Unique event identifier (idempotency key)
    #[serde(rename = "eventID")]
    pub event_id: Uuid,

    /// Dotted `<domain>.<entity>.<action>` name
    #[serde(rename = "eventType")]
    pub event_type: String,

    /// Payload shape version for `event_type`
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    /// When the fact happened
    #[serde(rename = "occurredAt")]
    pub occurred_at: DateTime<Utc>,

    /// Service that produced the event
    pub producer: String,

    /// Component within the producer that originated the fact
    pub source: String,

    #[serde(rename = "aggregateType", default, skip_serializing_if = "Option::is_none")]
    pub aggregate_type: Option<String>,

    #[serde(rename = "aggregateID", default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<String>,

    #[serde(rename = "tenantID", default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Links related events in a business transaction
    #[serde(rename = "correlationID", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Links this event to the command/event that caused it
    #[serde(rename = "causationID", default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Event-specific payload
    pub payload: T,
}

/// Envelope with an undecoded JSON payload, as stored in the outbox and seen on the wire
pub type RawEnvelope = EventEnvelope<serde_json::Value>;

impl<T> EventEnvelope<T> {
    /// Create a new event envelope with a fresh event ID and `occurred_at = now`
    ///
    /// `source` defaults to the producer name.
    pub fn new(
        event_type: impl Into<String>,
        schema_version: u32,
        producer: impl Into<String>,
        payload: T,
    ) -> Self {
        let producer = producer.into();
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            schema_version,
            occurred_at: Utc::now(),
            source: producer.clone(),
            producer,
            aggregate_type: None,
            aggregate_id: None,
            tenant_id: None,
            correlation_id: None,
            causation_id: None,
            payload,
        }
    }

    /// Set an explicit event ID (useful for testing and replays)
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_aggregate(
        mut self,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
    ) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    /// Set the correlation ID
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the causation ID
    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.causation_id = causation_id;
        self
    }

    /// Key used to keep same-aggregate events in order; falls back to the event ID
    pub fn ordering_key(&self) -> String {
        self.aggregate_id
            .clone()
            .unwrap_or_else(|| self.event_id.to_string())
    }

    /// Swap the payload, keeping all metadata
    pub fn map_payload<U>(self, f: impl FnOnce(T) -> U) -> EventEnvelope<U> {
        EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type,
            schema_version: self.schema_version,
            occurred_at: self.occurred_at,
            producer: self.producer,
            source: self.source,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            tenant_id: self.tenant_id,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            payload: f(self.payload),
        }
    }
}

impl<T: Serialize> EventEnvelope<T> {
    /// Serialize the payload into JSON, producing the stored/wire form
    pub fn into_raw(self) -> Result<RawEnvelope, serde_json::Error> {
        let payload = serde_json::to_value(&self.payload)?;
        Ok(self.map_payload(|_| payload))
    }
}

impl RawEnvelope {
    /// Parse a wire envelope from bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Decode the JSON payload into a typed struct
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Routing key used when the producer supplies no override
pub fn default_routing_key(event_type: &str) -> String {
    event_type.to_string()
}

/// Validate an event type name: `<domain>.<entity>.<action>`
///
/// At least three dot-separated tokens of lowercase ASCII letters, digits or
/// underscores. Wildcards are rejected so a type can never act as a pattern.
pub fn validate_event_type(event_type: &str) -> Result<(), String> {
    let tokens: Vec<&str> = event_type.split('.').collect();
    if tokens.len() < 3 {
        return Err(format!(
            "event type '{}' must be <domain>.<entity>.<action>",
            event_type
        ));
    }

    for token in tokens {
        if token.is_empty() {
            return Err(format!("event type '{}' has an empty segment", event_type));
        }
        if !token
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(format!(
                "event type '{}' segment '{}' must be lowercase alphanumeric or '_'",
                event_type, token
            ));
        }
    }

    Ok(())
}

/// Validate the envelope fields of a raw JSON message
///
/// # Validation Rules
///
/// - `eventID`: Must be a valid UUID
/// - `eventType`: Must satisfy [`validate_event_type`]
/// - `schemaVersion`: Must be a positive integer
/// - `occurredAt`: Must be an RFC 3339 timestamp
/// - `producer`, `source`: Must be non-empty strings
/// - `payload`: Must be a JSON object
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    let event_id = envelope
        .get("eventID")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid eventID")?;
    Uuid::parse_str(event_id).map_err(|e| format!("eventID is not a UUID: {}", e))?;

    let event_type = envelope
        .get("eventType")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid eventType")?;
    validate_event_type(event_type)?;

    let schema_version = envelope
        .get("schemaVersion")
        .and_then(|v| v.as_u64())
        .ok_or("Missing or invalid schemaVersion")?;
    if schema_version == 0 {
        return Err("schemaVersion must be at least 1".to_string());
    }

    let occurred_at = envelope
        .get("occurredAt")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid occurredAt")?;
    DateTime::parse_from_rfc3339(occurred_at)
        .map_err(|e| format!("occurredAt is not ISO-8601: {}", e))?;

    for field in ["producer", "source"] {
        let value = envelope
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("Missing or invalid {}", field))?;
        if value.is_empty() {
            return Err(format!("{} cannot be empty", field));
        }
    }

    if !envelope.get("payload").map(|p| p.is_object()).unwrap_or(false) {
        return Err("payload must be a JSON object".to_string());
    }

    Ok(())
}
