//! # Event Bus and Transactional Outbox
//!
//! Platform-level plumbing every service uses to announce domain facts without
//! losing or duplicating them.
//!
//! ## Write path
//!
//! A service appends an [`OutboxRecord`] through the [`OutboxWriter`] inside the
//! same database transaction as its business mutation. If the transaction rolls
//! back, the record never existed; if it commits, the record is durable. The
//! writer never touches the network.
//!
//! ## Relay
//!
//! Each service instance runs a [`Relay`] that claims pending records under a
//! time-bounded lease, publishes them through the [`BrokerClient`] and marks
//! them `published` only after the broker acknowledged the send.
//!
//! ## Implementations
//!
//! - **NatsBus**: Production implementation using NATS JetStream
//! - **InMemoryBus**: Test/dev implementation using in-memory channels
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{BrokerClient, EventBus, InMemoryBus};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = BrokerClient::from_bus(Arc::new(InMemoryBus::new()));
//!
//! let mut stream = broker.subscribe("events.billing.>").await?;
//! broker
//!     .publish_confirmed(event_bus::BusMessage::new(
//!         "events.billing.subscription.created".to_string(),
//!         b"{}".to_vec(),
//!     ))
//!     .await?;
//!
//! while let Some(msg) = futures::StreamExt::next(&mut stream).await {
//!     println!("Received: {} bytes on {}", msg.payload.len(), msg.subject);
//! }
//! broker.close().await?;
//! # Ok(())
//! # }
//! ```

mod broker;
pub mod config;
mod envelope;
mod inmemory_bus;
pub mod metrics;
mod nats_bus;
pub mod outbox;
pub mod partition;
pub mod registry;
pub mod relay;
pub mod retry;
mod writer;

pub use broker::BrokerClient;
pub use envelope::{
    default_routing_key, validate_envelope_fields, validate_event_type, EventEnvelope,
    RawEnvelope,
};
pub use inmemory_bus::{AckEvent, InMemoryBus};
pub use nats_bus::{NatsBus, NatsStreamConfig};
pub use outbox::{
    InMemoryOutboxStore, MemoryTx, OutboxError, OutboxRecord, OutboxResult, OutboxStatus,
    OutboxStore, PgOutboxStore,
};
pub use registry::{EventPayload, EventRegistry, RegistryError};
pub use relay::{
    AlertSink, LogAlertSink, Relay, RelayConfig, RelayHandle, RelayNotifier, RelayStats,
};
pub use writer::{AggregateRef, EmitOptions, OutboxWriter};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Header carrying the envelope's event ID; JetStream uses it for its dedup window.
pub const HEADER_MSG_ID: &str = "Nats-Msg-Id";
/// Header carrying the aggregate identifier used as the ordering key.
pub const HEADER_AGGREGATE_ID: &str = "Aggregate-Id";
pub const HEADER_EVENT_TYPE: &str = "Event-Type";
pub const HEADER_SCHEMA_VERSION: &str = "Schema-Version";

/// Acknowledgment handle attached to messages delivered through a durable consumer.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Confirm the message was fully processed.
    async fn ack(&self) -> BusResult<()>;

    /// Ask the broker to redeliver, optionally after `delay`.
    async fn nak(&self, delay: Option<Duration>) -> BusResult<()>;

    /// Stop redelivering this message (it was dead-lettered).
    async fn term(&self) -> BusResult<()>;
}

/// A message received from the event bus
#[derive(Clone)]
pub struct BusMessage {
    /// The subject/topic this message was published to
    pub subject: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Optional headers
    pub headers: Option<HashMap<String, String>>,
    /// Optional reply-to subject (for request-response patterns)
    pub reply_to: Option<String>,
    /// 1-based delivery counter; greater than 1 means the broker redelivered it
    pub delivery_attempt: u32,
    acker: Option<Arc<dyn Acker>>,
}

impl BusMessage {
    /// Create a new bus message
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: None,
            reply_to: None,
            delivery_attempt: 1,
            acker: None,
        }
    }

    /// Add headers to the message
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Add a reply-to subject
    pub fn with_reply_to(mut self, reply_to: String) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn with_delivery_attempt(mut self, attempt: u32) -> Self {
        self.delivery_attempt = attempt.max(1);
        self
    }

    pub fn with_acker(mut self, acker: Arc<dyn Acker>) -> Self {
        self.acker = Some(acker);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|h| h.get(name))
            .map(String::as_str)
    }

    /// Whether this message came from a durable consumer and must be acknowledged
    pub fn requires_ack(&self) -> bool {
        self.acker.is_some()
    }

    pub async fn ack(&self) -> BusResult<()> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    pub async fn nak(&self, delay: Option<Duration>) -> BusResult<()> {
        match &self.acker {
            Some(acker) => acker.nak(delay).await,
            None => Ok(()),
        }
    }

    pub async fn term(&self) -> BusResult<()> {
        match &self.acker {
            Some(acker) => acker.term().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .field("reply_to", &self.reply_to)
            .field("delivery_attempt", &self.delivery_attempt)
            .field("ackable", &self.acker.is_some())
            .finish()
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("failed to acknowledge message: {0}")]
    AckError(String),

    #[error("broker did not confirm publish within {0:?}")]
    Timeout(Duration),

    #[error("broker client is closed")]
    Closed,

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid subject pattern: {0}")]
    InvalidSubject(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Core event bus abstraction for publish-subscribe messaging
///
/// Publishing is confirmed: an `Ok` means the broker accepted the message.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message to a subject
    ///
    /// # Arguments
    /// * `subject` - The subject/topic to publish to (e.g., "events.billing.subscription.created")
    /// * `payload` - The message payload as raw bytes
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Publish a message including its headers, waiting for broker confirmation
    async fn publish_message(&self, msg: BusMessage) -> BusResult<()>;

    /// Subscribe to messages matching a subject pattern (fire-and-forget, no acks)
    ///
    /// # Arguments
    /// * `subject` - The subject pattern to subscribe to (supports wildcards: `*`, `>`)
    ///   - `*` matches a single token (e.g., `events.*.created`)
    ///   - `>` matches one or more tokens (e.g., `events.billing.>`)
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>>;

    /// Attach a durable, explicitly-acknowledged consumer to a subject pattern
    ///
    /// Messages yielded by the stream carry an [`Acker`]; unacknowledged messages
    /// are redelivered by the broker.
    async fn consume(
        &self,
        durable_name: &str,
        subject: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>>;

    /// Whether the underlying connection is currently usable
    fn is_connected(&self) -> bool {
        true
    }

    /// Flush pending work and release the connection
    async fn close(&self) -> BusResult<()> {
        Ok(())
    }
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
