use crate::config::Config;
use crate::handlers::{SubscriptionCancelledHandler, SubscriptionCreatedHandler};
use crate::repository::NotificationRepository;
use async_trait::async_trait;
use event_bus::{BrokerClient, EventPayload, RawEnvelope};
use event_consumer::{
    ConsumerRuntime, DeadLetterSink, EventHandler, HandlerError, ProcessedEventLedger,
    TimeoutMiddleware, TracingMiddleware, Typed,
};
use platform_contracts::{SubscriptionCancelledV1, SubscriptionCreatedV1};
use std::sync::Arc;

/// All `billing.subscription.*` events share one subscription so that a
/// subscription's events stay on one partition, in commit order
pub struct SubscriptionEvents {
    created: Typed<SubscriptionCreatedV1, SubscriptionCreatedHandler>,
    cancelled: Typed<SubscriptionCancelledV1, SubscriptionCancelledHandler>,
}

impl SubscriptionEvents {
    pub fn new(repo: Arc<dyn NotificationRepository>) -> Self {
        let registry = platform_contracts::registry();
        Self {
            created: Typed::new(registry.clone(), SubscriptionCreatedHandler::new(repo.clone())),
            cancelled: Typed::new(registry, SubscriptionCancelledHandler::new(repo)),
        }
    }
}

#[async_trait]
impl EventHandler for SubscriptionEvents {
    async fn handle(&self, envelope: &RawEnvelope) -> Result<(), HandlerError> {
        let event_type = envelope.event_type.as_str();
        if event_type == SubscriptionCreatedV1::EVENT_TYPE {
            self.created.handle(envelope).await
        } else if event_type == SubscriptionCancelledV1::EVENT_TYPE {
            self.cancelled.handle(envelope).await
        } else {
            tracing::debug!(event_type = %event_type, "No notification for event type");
            Ok(())
        }
    }
}

/// Wire the notification handlers onto a consumer runtime
pub fn build_runtime(
    config: &Config,
    broker: BrokerClient,
    ledger: Arc<dyn ProcessedEventLedger>,
    dlq: Arc<dyn DeadLetterSink>,
    repo: Arc<dyn NotificationRepository>,
) -> ConsumerRuntime {
    ConsumerRuntime::new(config.consumer.clone(), broker, ledger, dlq)
        .layer(TracingMiddleware)
        .layer(TimeoutMiddleware::new(config.handler_timeout))
        .subscribe(
            format!("{}.billing.subscription.>", config.bus.subject_prefix),
            SubscriptionEvents::new(repo),
        )
}
