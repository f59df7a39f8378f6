//! Handler traits and adapters

use crate::error::HandlerError;
use async_trait::async_trait;
use event_bus::{EventPayload, EventRegistry, RawEnvelope};
use std::future::Future;
use std::marker::PhantomData;

/// Applies the side effect of one event
///
/// Handlers see every delivery that the ledger has not already marked as
/// processed, so a crash between the side effect and the ledger write can
/// still replay an event; side effects should tolerate that.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &RawEnvelope) -> Result<(), HandlerError>;
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as an [`EventHandler`]
///
/// ```rust
/// use event_consumer::{handler_fn, HandlerError};
///
/// let handler = handler_fn(|envelope| async move {
///     tracing::info!(event_id = %envelope.event_id, "seen");
///     Ok::<_, HandlerError>(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(RawEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(RawEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, envelope: &RawEnvelope) -> Result<(), HandlerError> {
        (self.f)(envelope.clone()).await
    }
}

/// Handler for one registered payload type
#[async_trait]
pub trait TypedEventHandler<T: EventPayload>: Send + Sync {
    async fn handle_event(&self, envelope: &RawEnvelope, payload: T) -> Result<(), HandlerError>;
}

/// Decodes through the registry before calling a [`TypedEventHandler`]
///
/// Decoding failures (unknown version, wrong type, invalid payload) are
/// poison: redelivery cannot fix them.
pub struct Typed<T, H> {
    registry: EventRegistry,
    handler: H,
    _payload: PhantomData<fn() -> T>,
}

impl<T: EventPayload, H: TypedEventHandler<T>> Typed<T, H> {
    pub fn new(registry: EventRegistry, handler: H) -> Self {
        Self {
            registry,
            handler,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T: EventPayload, H: TypedEventHandler<T>> EventHandler for Typed<T, H> {
    async fn handle(&self, envelope: &RawEnvelope) -> Result<(), HandlerError> {
        let payload: T = self.registry.decode(envelope)?;
        self.handler.handle_event(envelope, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Serialize, Deserialize)]
    struct Sent {
        #[serde(rename = "messageID")]
        message_id: String,
    }

    impl EventPayload for Sent {
        const EVENT_TYPE: &'static str = "community.message.sent";
        const SCHEMA_VERSION: u32 = 1;
        const AGGREGATE_TYPE: &'static str = "message";

        fn aggregate_id(&self) -> String {
            self.message_id.clone()
        }
    }

    struct Recorder(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl TypedEventHandler<Sent> for Recorder {
        async fn handle_event(&self, _envelope: &RawEnvelope, payload: Sent) -> Result<(), HandlerError> {
            self.0.lock().unwrap().push(payload.message_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = Typed::new(
            EventRegistry::new().with::<Sent>(),
            Recorder(seen.clone()),
        );

        let envelope = RawEnvelope::new(
            "community.message.sent",
            1,
            "community",
            json!({"messageID": "m1"}),
        );
        handler.handle(&envelope).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn typed_handler_treats_bad_payload_as_poison() {
        let handler = Typed::new(
            EventRegistry::new().with::<Sent>(),
            Recorder(Arc::new(Mutex::new(Vec::new()))),
        );

        let wrong_version = RawEnvelope::new(
            "community.message.sent",
            2,
            "community",
            json!({"messageID": "m1"}),
        );
        let err = handler.handle(&wrong_version).await.unwrap_err();
        assert!(!err.is_retryable());

        let missing_field =
            RawEnvelope::new("community.message.sent", 1, "community", json!({}));
        assert!(matches!(
            handler.handle(&missing_field).await,
            Err(HandlerError::Poison(_))
        ));
    }

    #[tokio::test]
    async fn closure_handler_receives_envelope() {
        let handler = handler_fn(|envelope: RawEnvelope| async move {
            if envelope.payload["fail"] == json!(true) {
                Err(HandlerError::retryable("asked to fail"))
            } else {
                Ok(())
            }
        });

        let ok = RawEnvelope::new("a.b.c", 1, "test", json!({}));
        let bad = RawEnvelope::new("a.b.c", 1, "test", json!({"fail": true}));
        assert!(handler.handle(&ok).await.is_ok());
        assert!(handler.handle(&bad).await.unwrap_err().is_retryable());
    }
}
