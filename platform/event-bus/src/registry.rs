//! Closed registry of known events
//!
//! Every `(eventType, schemaVersion)` a service may write or read is registered
//! with a validator. Writers reject unregistered or invalid payloads before
//! touching the database; consumers decode through the same table, so an
//! unknown or mismatched event fails loudly instead of being guessed at.

use crate::envelope::{validate_event_type, RawEnvelope};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A typed event payload bound to one `(eventType, schemaVersion)` pair
///
/// ```rust
/// use event_bus::EventPayload;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct MessageSent {
///     #[serde(rename = "messageID")]
///     message_id: String,
/// }
///
/// impl EventPayload for MessageSent {
///     const EVENT_TYPE: &'static str = "community.message.sent";
///     const SCHEMA_VERSION: u32 = 1;
///     const AGGREGATE_TYPE: &'static str = "message";
///
///     fn aggregate_id(&self) -> String {
///         self.message_id.clone()
///     }
/// }
/// ```
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;
    const SCHEMA_VERSION: u32;
    const AGGREGATE_TYPE: &'static str;

    /// Identifier of the entity this event concerns (the ordering key)
    fn aggregate_id(&self) -> String;

    /// Semantic checks beyond what deserialization enforces
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown event {event_type} v{schema_version}")]
    UnknownEvent {
        event_type: String,
        schema_version: u32,
    },

    #[error("invalid payload for {event_type} v{schema_version}: {reason}")]
    InvalidPayload {
        event_type: String,
        schema_version: u32,
        reason: String,
    },

    #[error("expected {expected} but envelope carries {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("invalid event type: {0}")]
    InvalidEventType(String),
}

type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
struct Entry {
    aggregate_type: Option<&'static str>,
    validator: Validator,
}

/// Table of registered events, cheap to clone and share across tasks
#[derive(Clone, Default)]
pub struct EventRegistry {
    entries: Arc<BTreeMap<(String, u32), Entry>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed payload; its serde shape plus `validate` become the validator
    pub fn with<T: EventPayload>(self) -> Self {
        let validator: Validator = Arc::new(|payload: &Value| {
            let decoded: T = serde_json::from_value(payload.clone()).map_err(|e| e.to_string())?;
            decoded.validate()
        });
        self.insert(T::EVENT_TYPE, T::SCHEMA_VERSION, Some(T::AGGREGATE_TYPE), validator)
    }

    /// Register an event with a hand-written validator
    pub fn with_validator<F>(self, event_type: &str, schema_version: u32, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.insert(event_type, schema_version, None, Arc::new(validator))
    }

    fn insert(
        self,
        event_type: &str,
        schema_version: u32,
        aggregate_type: Option<&'static str>,
        validator: Validator,
    ) -> Self {
        let mut entries = Arc::try_unwrap(self.entries).unwrap_or_else(|shared| (*shared).clone());
        entries.insert(
            (event_type.to_string(), schema_version),
            Entry {
                aggregate_type,
                validator,
            },
        );
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn contains(&self, event_type: &str, schema_version: u32) -> bool {
        self.entries
            .contains_key(&(event_type.to_string(), schema_version))
    }

    /// Registered `(eventType, schemaVersion)` pairs in sorted order
    pub fn known_events(&self) -> Vec<(String, u32)> {
        self.entries.keys().cloned().collect()
    }

    pub fn aggregate_type(&self, event_type: &str, schema_version: u32) -> Option<&'static str> {
        self.entries
            .get(&(event_type.to_string(), schema_version))
            .and_then(|e| e.aggregate_type)
    }

    /// Check a payload against the validator registered for its type and version
    pub fn validate(
        &self,
        event_type: &str,
        schema_version: u32,
        payload: &Value,
    ) -> Result<(), RegistryError> {
        validate_event_type(event_type).map_err(RegistryError::InvalidEventType)?;

        let entry = self
            .entries
            .get(&(event_type.to_string(), schema_version))
            .ok_or_else(|| RegistryError::UnknownEvent {
                event_type: event_type.to_string(),
                schema_version,
            })?;

        (entry.validator)(payload).map_err(|reason| RegistryError::InvalidPayload {
            event_type: event_type.to_string(),
            schema_version,
            reason,
        })
    }

    pub fn validate_envelope(&self, envelope: &RawEnvelope) -> Result<(), RegistryError> {
        self.validate(
            &envelope.event_type,
            envelope.schema_version,
            &envelope.payload,
        )
    }

    /// Decode an envelope's payload as `T`, refusing envelopes of any other type
    pub fn decode<T: EventPayload>(&self, envelope: &RawEnvelope) -> Result<T, RegistryError> {
        if envelope.event_type != T::EVENT_TYPE || envelope.schema_version != T::SCHEMA_VERSION {
            return Err(RegistryError::TypeMismatch {
                expected: format!("{} v{}", T::EVENT_TYPE, T::SCHEMA_VERSION),
                found: format!("{} v{}", envelope.event_type, envelope.schema_version),
            });
        }
        if !self.contains(T::EVENT_TYPE, T::SCHEMA_VERSION) {
            return Err(RegistryError::UnknownEvent {
                event_type: T::EVENT_TYPE.to_string(),
                schema_version: T::SCHEMA_VERSION,
            });
        }

        let invalid = |reason: String| RegistryError::InvalidPayload {
            event_type: T::EVENT_TYPE.to_string(),
            schema_version: T::SCHEMA_VERSION,
            reason,
        };
        let decoded: T = envelope
            .decode_payload()
            .map_err(|e| invalid(e.to_string()))?;
        decoded.validate().map_err(invalid)?;
        Ok(decoded)
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("events", &self.known_events())
            .finish()
    }
}
