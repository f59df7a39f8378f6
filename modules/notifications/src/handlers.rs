//! Handlers for `billing.subscription.*`

use crate::models::Notification;
use crate::repository::NotificationRepository;
use async_trait::async_trait;
use event_bus::{EventPayload, RawEnvelope};
use event_consumer::{HandlerError, TypedEventHandler};
use platform_contracts::{SubscriptionCancelledV1, SubscriptionCreatedV1};
use serde_json::json;
use std::sync::Arc;

pub const TEMPLATE_SUBSCRIPTION_CREATED: &str = "subscription_created";
pub const TEMPLATE_SUBSCRIPTION_CANCELLED: &str = "subscription_cancelled";

/// Welcome notification to the coach for a new subscriber
pub struct SubscriptionCreatedHandler {
    repo: Arc<dyn NotificationRepository>,
}

impl SubscriptionCreatedHandler {
    pub fn new(repo: Arc<dyn NotificationRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl TypedEventHandler<SubscriptionCreatedV1> for SubscriptionCreatedHandler {
    async fn handle_event(
        &self,
        envelope: &RawEnvelope,
        payload: SubscriptionCreatedV1,
    ) -> Result<(), HandlerError> {
        let notification = Notification::queued(
            envelope.event_id,
            TEMPLATE_SUBSCRIPTION_CREATED,
            payload.coach_id.clone(),
            payload.subscription_id.clone(),
            json!({
                "subscriptionID": payload.subscription_id,
                "clientID": payload.client_id,
                "planID": payload.plan_id,
            }),
        )
        .with_tenant(envelope.tenant_id.clone());

        let created = self
            .repo
            .create_for_event(&notification, SubscriptionCreatedV1::EVENT_TYPE)
            .await
            .map_err(HandlerError::retryable)?;

        if created {
            tracing::info!(
                subscription_id = %payload.subscription_id,
                coach_id = %payload.coach_id,
                "Subscription welcome notification queued"
            );
        } else {
            tracing::debug!(
                event_id = %envelope.event_id,
                "Notification already exists for event"
            );
        }
        Ok(())
    }
}

pub struct SubscriptionCancelledHandler {
    repo: Arc<dyn NotificationRepository>,
}

impl SubscriptionCancelledHandler {
    pub fn new(repo: Arc<dyn NotificationRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl TypedEventHandler<SubscriptionCancelledV1> for SubscriptionCancelledHandler {
    async fn handle_event(
        &self,
        envelope: &RawEnvelope,
        payload: SubscriptionCancelledV1,
    ) -> Result<(), HandlerError> {
        let notification = Notification::queued(
            envelope.event_id,
            TEMPLATE_SUBSCRIPTION_CANCELLED,
            payload.coach_id.clone(),
            payload.subscription_id.clone(),
            json!({
                "subscriptionID": payload.subscription_id,
                "reason": payload.reason,
                "cancelledAt": payload.cancelled_at,
            }),
        )
        .with_tenant(envelope.tenant_id.clone());

        self.repo
            .create_for_event(&notification, SubscriptionCancelledV1::EVENT_TYPE)
            .await
            .map_err(HandlerError::retryable)?;
        Ok(())
    }
}
