use event_bus::{BusError, RegistryError};
use std::fmt::Display;
use uuid::Uuid;

/// What a handler reports when it cannot apply an event
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Worth retrying: a dependency was unavailable, a lock timed out, ...
    #[error("retryable: {0}")]
    Retryable(String),

    /// Will never succeed for this envelope; goes to the dead-letter path
    #[error("poison: {0}")]
    Poison(String),
}

impl HandlerError {
    pub fn retryable(err: impl Display) -> Self {
        HandlerError::Retryable(err.to_string())
    }

    pub fn poison(err: impl Display) -> Self {
        HandlerError::Poison(err.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }
}

/// A payload the registry rejects will be rejected on every redelivery
impl From<RegistryError> for HandlerError {
    fn from(err: RegistryError) -> Self {
        HandlerError::Poison(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("no dead letter for event {event_id} in consumer {consumer}")]
    NotFound { event_id: Uuid, consumer: String },

    #[error("dead letter for event {0} is malformed and cannot be replayed")]
    NotReplayable(Uuid),

    #[error("corrupt dead letter row: {0}")]
    Corrupt(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("consumer has no subscriptions")]
    NoSubscriptions,

    #[error("invalid consumer configuration: {0}")]
    Config(String),
}
