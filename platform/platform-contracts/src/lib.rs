//! # Platform Contracts
//!
//! Every event the platform exchanges, as a typed payload registered under its
//! `(eventType, schemaVersion)` pair. Producers validate against [`registry()`]
//! before writing to the outbox; consumers decode through it, so an unknown or
//! mismatched event fails loudly on both sides.
//!
//! Changing a payload's shape means adding a new versioned struct (`...V2`)
//! and registering it next to the old one.

mod billing;
mod community;
mod identity;

pub use billing::{SubscriptionCancelledV1, SubscriptionCreatedV1, SUBSCRIPTION_AGGREGATE};
pub use community::MessageSentV1;
pub use identity::AdminLoggedInV1;

use event_bus::{EventPayload, EventRegistry, RawEnvelope, RegistryError};

/// The closed set of platform events
pub fn registry() -> EventRegistry {
    EventRegistry::new()
        .with::<SubscriptionCreatedV1>()
        .with::<SubscriptionCancelledV1>()
        .with::<AdminLoggedInV1>()
        .with::<MessageSentV1>()
}

/// Decoded view of any registered event
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    SubscriptionCreated(SubscriptionCreatedV1),
    SubscriptionCancelled(SubscriptionCancelledV1),
    AdminLoggedIn(AdminLoggedInV1),
    MessageSent(MessageSentV1),
}

fn is<T: EventPayload>(envelope: &RawEnvelope) -> bool {
    envelope.event_type == T::EVENT_TYPE && envelope.schema_version == T::SCHEMA_VERSION
}

impl PlatformEvent {
    pub fn decode(envelope: &RawEnvelope, registry: &EventRegistry) -> Result<Self, RegistryError> {
        if is::<SubscriptionCreatedV1>(envelope) {
            registry.decode(envelope).map(Self::SubscriptionCreated)
        } else if is::<SubscriptionCancelledV1>(envelope) {
            registry.decode(envelope).map(Self::SubscriptionCancelled)
        } else if is::<AdminLoggedInV1>(envelope) {
            registry.decode(envelope).map(Self::AdminLoggedIn)
        } else if is::<MessageSentV1>(envelope) {
            registry.decode(envelope).map(Self::MessageSent)
        } else {
            Err(RegistryError::UnknownEvent {
                event_type: envelope.event_type.clone(),
                schema_version: envelope.schema_version,
            })
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SubscriptionCreated(_) => SubscriptionCreatedV1::EVENT_TYPE,
            Self::SubscriptionCancelled(_) => SubscriptionCancelledV1::EVENT_TYPE,
            Self::AdminLoggedIn(_) => AdminLoggedInV1::EVENT_TYPE,
            Self::MessageSent(_) => MessageSentV1::EVENT_TYPE,
        }
    }

    pub fn aggregate_id(&self) -> String {
        match self {
            Self::SubscriptionCreated(p) => p.aggregate_id(),
            Self::SubscriptionCancelled(p) => p.aggregate_id(),
            Self::AdminLoggedIn(p) => p.aggregate_id(),
            Self::MessageSent(p) => p.aggregate_id(),
        }
    }
}
