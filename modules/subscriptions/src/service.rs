//! Subscription lifecycle
//!
//! Every state change writes its row and its `billing.subscription.*` outbox
//! record in one transaction, then nudges the relay. The relay is the only
//! publisher; a missed nudge just waits for its next poll.

use crate::error::SubscriptionError;
use crate::models::{
    CancelSubscriptionRequest, CreateSubscriptionRequest, RequestContext, Subscription,
    STATUS_ACTIVE, STATUS_CANCELLED,
};
use crate::repository::SubscriptionRepository;
use chrono::Utc;
use event_bus::{EmitOptions, OutboxWriter, RelayNotifier};
use platform_contracts::{SubscriptionCancelledV1, SubscriptionCreatedV1};
use uuid::Uuid;

pub struct SubscriptionService<R: SubscriptionRepository> {
    repo: R,
    writer: OutboxWriter<R::Outbox>,
    relay: Option<RelayNotifier>,
}

impl<R: SubscriptionRepository> SubscriptionService<R>
where
    R::Outbox: Clone,
{
    pub fn new(repo: R, producer: impl Into<String>) -> Self {
        let writer = OutboxWriter::new(
            repo.outbox().clone(),
            platform_contracts::registry(),
            producer,
        )
        .with_source("subscriptions.service");
        Self {
            repo,
            writer,
            relay: None,
        }
    }

    pub fn with_relay_notifier(mut self, notifier: RelayNotifier) -> Self {
        self.relay = Some(notifier);
        self
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    fn options(tenant_id: &str, ctx: &RequestContext) -> EmitOptions {
        let mut options = EmitOptions::default().tenant(tenant_id);
        if let Some(correlation_id) = &ctx.correlation_id {
            options = options.correlation(correlation_id);
        }
        if let Some(causation_id) = &ctx.causation_id {
            options = options.causation(causation_id);
        }
        options
    }

    fn nudge(&self) {
        if let Some(relay) = &self.relay {
            relay.nudge();
        }
    }

    pub async fn create(
        &self,
        req: CreateSubscriptionRequest,
        ctx: &RequestContext,
    ) -> Result<Subscription, SubscriptionError> {
        validate_create(&req)?;

        let subscription = Subscription {
            id: Uuid::new_v4(),
            tenant_id: req.tenant_id,
            coach_id: req.coach_id,
            client_id: req.client_id,
            plan_id: req.plan_id,
            price_minor: req.price_minor,
            currency: req.currency.to_uppercase(),
            status: STATUS_ACTIVE.to_string(),
            cancel_reason: None,
            created_at: Utc::now(),
            cancelled_at: None,
        };

        let event = SubscriptionCreatedV1 {
            subscription_id: subscription.id.to_string(),
            coach_id: subscription.coach_id.clone(),
            client_id: subscription.client_id.clone(),
            plan_id: subscription.plan_id.clone(),
            price_minor: Some(subscription.price_minor),
            currency: Some(subscription.currency.clone()),
        };

        let mut tx = self.repo.begin().await?;
        self.repo.insert(&mut tx, &subscription).await?;
        let record = self
            .writer
            .emit_typed(&mut tx, &event, Self::options(&subscription.tenant_id, ctx))
            .await?;
        self.repo.commit(tx).await?;
        self.nudge();

        tracing::info!(
            subscription_id = %subscription.id,
            tenant_id = %subscription.tenant_id,
            coach_id = %subscription.coach_id,
            event_id = %record.event_id,
            "Subscription created"
        );

        Ok(subscription)
    }

    pub async fn cancel(
        &self,
        id: Uuid,
        req: CancelSubscriptionRequest,
        ctx: &RequestContext,
    ) -> Result<Subscription, SubscriptionError> {
        let mut tx = self.repo.begin().await?;
        let mut subscription = self
            .repo
            .get_for_update(&mut tx, id)
            .await?
            .ok_or(SubscriptionError::NotFound(id))?;
        if subscription.is_cancelled() {
            return Err(SubscriptionError::AlreadyCancelled(id));
        }

        let now = Utc::now();
        subscription.status = STATUS_CANCELLED.to_string();
        subscription.cancel_reason = req.reason;
        subscription.cancelled_at = Some(now);

        let event = SubscriptionCancelledV1 {
            subscription_id: subscription.id.to_string(),
            coach_id: subscription.coach_id.clone(),
            reason: subscription.cancel_reason.clone(),
            cancelled_at: now,
        };

        self.repo.update(&mut tx, &subscription).await?;
        self.writer
            .emit_typed(&mut tx, &event, Self::options(&subscription.tenant_id, ctx))
            .await?;
        self.repo.commit(tx).await?;
        self.nudge();

        tracing::info!(subscription_id = %id, "Subscription cancelled");
        Ok(subscription)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Subscription>, SubscriptionError> {
        self.repo.get(id).await
    }
}

fn validate_create(req: &CreateSubscriptionRequest) -> Result<(), SubscriptionError> {
    if req.tenant_id.trim().is_empty() {
        return Err(SubscriptionError::Validation("tenant_id is required".into()));
    }
    if req.coach_id.trim().is_empty() {
        return Err(SubscriptionError::Validation("coach_id is required".into()));
    }
    if req.price_minor < 0 {
        return Err(SubscriptionError::Validation(
            "price_minor cannot be negative".into(),
        ));
    }
    if req.currency.len() != 3 || !req.currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(SubscriptionError::Validation(format!(
            "currency '{}' must be a 3-letter code",
            req.currency
        )));
    }
    Ok(())
}
