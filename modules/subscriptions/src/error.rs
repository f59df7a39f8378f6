use event_bus::OutboxError;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("subscription {0} not found")]
    NotFound(Uuid),

    #[error("subscription {0} is already cancelled")]
    AlreadyCancelled(Uuid),

    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
