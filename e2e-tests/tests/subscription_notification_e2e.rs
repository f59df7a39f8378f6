//! Subscription created in the subscriptions service produces exactly one
//! notification, however often the event is delivered

mod common;

use event_bus::{EventBus, Relay};
use event_consumer::{ConsumerConfig, InMemoryDeadLetterStore, InMemoryLedger};
use notifications_rs::config::{Config, CONSUMER_NAME};
use notifications_rs::handlers::{TEMPLATE_SUBSCRIPTION_CANCELLED, TEMPLATE_SUBSCRIPTION_CREATED};
use notifications_rs::{build_runtime, InMemoryNotificationRepository};
use std::sync::Arc;
use std::time::Duration;
use subscriptions_rs::models::{CancelSubscriptionRequest, CreateSubscriptionRequest, RequestContext};
use subscriptions_rs::{InMemorySubscriptionRepository, SubscriptionRepository, SubscriptionService};

fn notifications_config() -> Config {
    let consumer: ConsumerConfig = common::consumer_config(CONSUMER_NAME, 5);
    Config {
        database_url: String::new(),
        bus: event_bus::config::BusConfig::default(),
        consumer,
        handler_timeout: Duration::from_secs(1),
        publish_dead_letters: false,
    }
}

fn create_request() -> CreateSubscriptionRequest {
    CreateSubscriptionRequest {
        tenant_id: "tenant-1".to_string(),
        coach_id: "coach-1".to_string(),
        client_id: Some("client-1".to_string()),
        plan_id: Some("pro-monthly".to_string()),
        price_minor: 4900,
        currency: "USD".to_string(),
    }
}

#[tokio::test]
async fn subscription_created_yields_one_notification_despite_redeliveries() {
    common::init_tracing();
    let (bus, broker) = common::bus();
    let repo = InMemorySubscriptionRepository::new();
    let relay = Relay::new(repo.outbox().clone(), broker.clone(), common::relay_config("relay-a"));
    let service = SubscriptionService::new(repo, "subscriptions");

    let notifications = InMemoryNotificationRepository::new();
    let ledger = InMemoryLedger::new();
    let dlq = Arc::new(InMemoryDeadLetterStore::new());
    let consumer = build_runtime(
        &notifications_config(),
        broker.clone(),
        Arc::new(ledger.clone()),
        dlq.clone(),
        Arc::new(notifications.clone()),
    )
    .start()
    .await
    .unwrap();

    let subscription = service
        .create(create_request(), &RequestContext::default())
        .await
        .unwrap();
    assert_eq!(common::drain(&relay).await, 1);

    // Two redeliveries of the published message
    let published = bus.published()[0].clone();
    bus.publish_message(published.clone()).await.unwrap();
    bus.publish_message(published).await.unwrap();

    common::wait_until(|| common::acked(&bus) == 3).await;
    consumer.shutdown().await;

    let rows = notifications.all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].template, TEMPLATE_SUBSCRIPTION_CREATED);
    assert_eq!(rows[0].reference_id, subscription.id.to_string());
    assert_eq!(rows[0].recipient_id, "coach-1");
    assert_eq!(rows[0].tenant_id.as_deref(), Some("tenant-1"));
    assert_eq!(ledger.len(), 1);
    assert!(dlq.all().is_empty());
}

#[tokio::test]
async fn create_then_cancel_notifies_in_order() {
    let (bus, broker) = common::bus();
    let repo = InMemorySubscriptionRepository::new();
    let relay = Relay::new(repo.outbox().clone(), broker.clone(), common::relay_config("relay-a"))
        .spawn();
    let service = SubscriptionService::new(repo, "subscriptions").with_relay_notifier(relay.notifier());

    let notifications = InMemoryNotificationRepository::new();
    let consumer = build_runtime(
        &notifications_config(),
        broker.clone(),
        Arc::new(InMemoryLedger::new()),
        Arc::new(InMemoryDeadLetterStore::new()),
        Arc::new(notifications.clone()),
    )
    .start()
    .await
    .unwrap();

    let subscription = service
        .create(create_request(), &RequestContext::default())
        .await
        .unwrap();
    service
        .cancel(
            subscription.id,
            CancelSubscriptionRequest {
                reason: Some("client_request".to_string()),
            },
            &RequestContext::default(),
        )
        .await
        .unwrap();

    common::wait_until(|| common::acked(&bus) == 2).await;
    consumer.shutdown().await;
    relay.shutdown().await;

    let templates: Vec<String> = notifications.all().into_iter().map(|n| n.template).collect();
    assert_eq!(
        templates,
        vec![
            TEMPLATE_SUBSCRIPTION_CREATED.to_string(),
            TEMPLATE_SUBSCRIPTION_CANCELLED.to_string()
        ]
    );
}
