//! Relay crash recovery, competing relays and exhausted publishes

mod common;

use event_bus::{
    AlertSink, EmitOptions, InMemoryOutboxStore, OutboxRecord, OutboxStatus, OutboxStore,
    OutboxWriter, Relay, HEADER_AGGREGATE_ID, HEADER_MSG_ID,
};
use platform_contracts::SubscriptionCreatedV1;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn seed(store: &InMemoryOutboxStore, aggregates: usize, per_aggregate: usize) -> Vec<OutboxRecord> {
    let writer = OutboxWriter::new(store.clone(), platform_contracts::registry(), "subscriptions");
    let mut tx = store.begin();
    let mut records = Vec::new();
    for n in 0..per_aggregate {
        for a in 0..aggregates {
            let event = SubscriptionCreatedV1 {
                subscription_id: format!("sub-{}", a),
                coach_id: format!("coach-{}", n),
                client_id: None,
                plan_id: None,
                price_minor: None,
                currency: None,
            };
            records.push(
                writer
                    .emit_typed(&mut tx, &event, EmitOptions::default())
                    .await
                    .unwrap(),
            );
        }
    }
    tx.commit().unwrap();
    records
}

#[tokio::test]
async fn records_leased_by_a_crashed_relay_are_reclaimed_after_expiry() {
    common::init_tracing();
    let store = InMemoryOutboxStore::new();
    let records = seed(&store, 3, 1).await;
    let (bus, broker) = common::bus();
    let relay_b = Relay::new(store.clone(), broker, common::relay_config("relay-b"));

    // relay-a claims everything and dies before publishing
    let claimed = store
        .claim_batch("relay-a", Duration::from_millis(50), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 3);

    let stats = relay_b.run_once().await.unwrap();
    assert_eq!(stats.claimed, 0);
    assert!(bus.published().is_empty());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(common::drain(&relay_b).await, 3);

    for record in &records {
        assert_eq!(bus.publish_count(&record.event_id.to_string()), 1);
        // The crashed owner can no longer settle what it claimed
        assert!(!store.mark_published(record.id, "relay-a").await.unwrap());
    }
    assert_eq!(store.count_by_status(OutboxStatus::Published), 3);
}

#[tokio::test]
async fn crash_between_publish_and_mark_republishes_the_same_event_id() {
    let store = InMemoryOutboxStore::new();
    let records = seed(&store, 1, 1).await;
    let (bus, broker) = common::bus();

    let claimed = store
        .claim_batch("relay-a", Duration::from_millis(30), 10)
        .await
        .unwrap();
    let mut headers = HashMap::new();
    headers.insert(HEADER_MSG_ID.to_string(), claimed[0].event_id.to_string());
    headers.insert(HEADER_AGGREGATE_ID.to_string(), claimed[0].aggregate_id.clone());
    broker
        .publish_confirmed(
            event_bus::BusMessage::new(
                format!("events.{}", claimed[0].routing_key),
                claimed[0].envelope_bytes().unwrap(),
            )
            .with_headers(headers),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    let relay_b = Relay::new(store.clone(), broker, common::relay_config("relay-b"));
    assert_eq!(common::drain(&relay_b).await, 1);

    // At-least-once: same event ID twice, consumers dedupe on it
    assert_eq!(bus.publish_count(&records[0].event_id.to_string()), 2);
    assert_eq!(store.count_by_status(OutboxStatus::Published), 1);
}

#[tokio::test]
async fn two_relays_never_publish_the_same_record_twice() {
    let store = InMemoryOutboxStore::new();
    let records = seed(&store, 10, 5).await;
    let (bus, broker) = common::bus();
    let relay_a = Relay::new(store.clone(), broker.clone(), common::relay_config("relay-a"));
    let relay_b = Relay::new(store.clone(), broker, common::relay_config("relay-b"));

    for _ in 0..100 {
        let (a, b) = tokio::join!(relay_a.run_once(), relay_b.run_once());
        let (a, b) = (a.unwrap(), b.unwrap());
        if a.claimed == 0 && b.claimed == 0 && common::pending(&store) == 0 {
            break;
        }
    }

    assert_eq!(store.count_by_status(OutboxStatus::Published), 50);
    for record in &records {
        assert_eq!(bus.publish_count(&record.event_id.to_string()), 1);
    }

    // Per-aggregate publish order matches commit order
    let mut expected: HashMap<String, Vec<String>> = HashMap::new();
    for record in &records {
        expected
            .entry(record.aggregate_id.clone())
            .or_default()
            .push(record.event_id.to_string());
    }
    let mut seen: HashMap<String, Vec<String>> = HashMap::new();
    for msg in bus.published() {
        seen.entry(msg.header(HEADER_AGGREGATE_ID).unwrap().to_string())
            .or_default()
            .push(msg.header(HEADER_MSG_ID).unwrap().to_string());
    }
    assert_eq!(seen, expected);
}

#[derive(Default)]
struct RecordingAlerts {
    failed: Mutex<Vec<String>>,
}

impl AlertSink for RecordingAlerts {
    fn outbox_record_failed(&self, record: &OutboxRecord, _error: &str) {
        self.failed.lock().unwrap().push(record.event_id.to_string());
    }
}

#[tokio::test]
async fn exhausted_publish_fails_alerts_and_can_be_requeued() {
    let store = InMemoryOutboxStore::new();
    let records = seed(&store, 1, 1).await;
    let (bus, broker) = common::bus();
    let alerts = Arc::new(RecordingAlerts::default());
    let relay = Relay::new(store.clone(), broker, common::relay_config("relay-a"))
        .with_alert_sink(alerts.clone());

    bus.set_offline(true);
    for _ in 0..50 {
        relay.run_once().await.unwrap();
        if store.count_by_status(OutboxStatus::Failed) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let failed = store.find(records[0].id).await.unwrap().unwrap();
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert!(failed.last_error.is_some());
    assert_eq!(*alerts.failed.lock().unwrap(), vec![records[0].event_id.to_string()]);

    // Failed records stay put until an operator requeues them
    bus.set_offline(false);
    assert_eq!(common::drain(&relay).await, 0);
    assert!(store.requeue_failed(records[0].id).await.unwrap());
    assert_eq!(common::drain(&relay).await, 1);
    assert_eq!(bus.publish_count(&records[0].event_id.to_string()), 1);
}
