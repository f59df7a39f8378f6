//! A business write and its outbox record commit together or not at all

mod common;

use chrono::Utc;
use event_bus::{EmitOptions, OutboxStatus, OutboxStore, OutboxWriter, Relay};
use platform_contracts::SubscriptionCreatedV1;
use subscriptions_rs::models::{CreateSubscriptionRequest, RequestContext, Subscription, STATUS_ACTIVE};
use subscriptions_rs::{InMemorySubscriptionRepository, SubscriptionRepository, SubscriptionService};
use uuid::Uuid;

fn subscription(coach_id: &str) -> Subscription {
    Subscription {
        id: Uuid::new_v4(),
        tenant_id: "tenant-1".to_string(),
        coach_id: coach_id.to_string(),
        client_id: None,
        plan_id: Some("pro-monthly".to_string()),
        price_minor: 4900,
        currency: "USD".to_string(),
        status: STATUS_ACTIVE.to_string(),
        cancel_reason: None,
        created_at: Utc::now(),
        cancelled_at: None,
    }
}

fn created_event(sub: &Subscription) -> SubscriptionCreatedV1 {
    SubscriptionCreatedV1 {
        subscription_id: sub.id.to_string(),
        coach_id: sub.coach_id.clone(),
        client_id: None,
        plan_id: sub.plan_id.clone(),
        price_minor: Some(sub.price_minor),
        currency: Some(sub.currency.clone()),
    }
}

#[tokio::test]
async fn committed_subscription_is_published_by_the_relay() {
    common::init_tracing();
    let repo = InMemorySubscriptionRepository::new();
    let outbox = repo.outbox().clone();
    let (bus, broker) = common::bus();
    let relay = Relay::new(outbox.clone(), broker, common::relay_config("relay-a"));
    let service = SubscriptionService::new(repo, "subscriptions");

    let created = service
        .create(
            CreateSubscriptionRequest {
                tenant_id: "tenant-1".to_string(),
                coach_id: "coach-1".to_string(),
                client_id: Some("client-1".to_string()),
                plan_id: Some("pro-monthly".to_string()),
                price_minor: 4900,
                currency: "usd".to_string(),
            },
            &RequestContext::default(),
        )
        .await
        .unwrap();

    assert_eq!(common::pending(&outbox), 1);
    assert!(bus.published().is_empty());

    assert_eq!(common::drain(&relay).await, 1);
    let published = bus.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].subject, "events.billing.subscription.created");
    assert_eq!(
        published[0].header(event_bus::HEADER_AGGREGATE_ID),
        Some(created.id.to_string().as_str())
    );
    assert_eq!(outbox.count_by_status(OutboxStatus::Published), 1);
}

#[tokio::test]
async fn rolled_back_transaction_leaves_neither_row_nor_record() {
    let repo = InMemorySubscriptionRepository::new();
    let writer = OutboxWriter::new(
        repo.outbox().clone(),
        platform_contracts::registry(),
        "subscriptions",
    );
    let sub = subscription("coach-1");

    let mut tx = repo.begin().await.unwrap();
    repo.insert(&mut tx, &sub).await.unwrap();
    writer
        .emit_typed(&mut tx, &created_event(&sub), EmitOptions::default().tenant("tenant-1"))
        .await
        .unwrap();
    tx.rollback();

    assert!(repo.get(sub.id).await.unwrap().is_none());
    assert!(repo.outbox().records().is_empty());
}

#[tokio::test]
async fn rejected_event_aborts_the_business_write() {
    let repo = InMemorySubscriptionRepository::new();
    let writer = OutboxWriter::new(
        repo.outbox().clone(),
        platform_contracts::registry(),
        "subscriptions",
    );
    let sub = subscription("coach-1");
    let mut event = created_event(&sub);
    event.coach_id = String::new();

    let result = async {
        let mut tx = repo.begin().await?;
        repo.insert(&mut tx, &sub).await?;
        writer
            .emit_typed(&mut tx, &event, EmitOptions::default())
            .await?;
        repo.commit(tx).await
    }
    .await;

    assert!(result.is_err());
    assert!(repo.get(sub.id).await.unwrap().is_none());
    assert!(repo.outbox().records().is_empty());
}

#[tokio::test]
async fn commit_makes_row_and_record_visible_together() {
    let repo = InMemorySubscriptionRepository::new();
    let writer = OutboxWriter::new(
        repo.outbox().clone(),
        platform_contracts::registry(),
        "subscriptions",
    );
    let sub = subscription("coach-2");

    let mut tx = repo.begin().await.unwrap();
    repo.insert(&mut tx, &sub).await.unwrap();
    let record = writer
        .emit_typed(&mut tx, &created_event(&sub), EmitOptions::default())
        .await
        .unwrap();

    // Staged but invisible until commit
    assert!(repo.get(sub.id).await.unwrap().is_none());
    assert!(repo.outbox().find(record.id).await.unwrap().is_none());

    repo.commit(tx).await.unwrap();

    assert_eq!(repo.get(sub.id).await.unwrap(), Some(sub.clone()));
    let stored = repo.outbox().find(record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Pending);
    assert_eq!(stored.aggregate_id, sub.id.to_string());
}
