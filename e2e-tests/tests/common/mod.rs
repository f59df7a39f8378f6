//! Shared wiring for the in-process end-to-end tests

#![allow(dead_code)]

use event_bus::retry::RetryConfig;
use event_bus::{
    AckEvent, BrokerClient, InMemoryBus, InMemoryOutboxStore, OutboxStatus, Relay, RelayConfig,
};
use event_consumer::ConsumerConfig;
use std::sync::{Arc, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Log to the test writer; `RUST_LOG=debug` shows the relay and consumer spans
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn bus() -> (Arc<InMemoryBus>, BrokerClient) {
    let bus = Arc::new(InMemoryBus::new());
    let broker = BrokerClient::from_bus(bus.clone());
    (bus, broker)
}

pub fn relay_config(owner: &str) -> RelayConfig {
    RelayConfig {
        owner: owner.to_string(),
        batch_size: 50,
        poll_interval: Duration::from_millis(20),
        lease_ttl: Duration::from_secs(30),
        max_attempts: 3,
        backoff: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        subject_prefix: "events".to_string(),
        retention: None,
        purge_interval: Duration::from_secs(3600),
    }
}

pub fn consumer_config(name: &str, max_attempts: u32) -> ConsumerConfig {
    let mut config = ConsumerConfig::new(name);
    config.max_attempts = max_attempts;
    config.retry = RetryConfig {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    };
    config
}

/// Run relay passes until nothing is claimable
pub async fn drain(relay: &Relay<InMemoryOutboxStore>) -> usize {
    let mut published = 0;
    for _ in 0..100 {
        let stats = relay.run_once().await.expect("relay pass");
        published += stats.published;
        if stats.claimed == 0 {
            break;
        }
    }
    published
}

pub fn pending(store: &InMemoryOutboxStore) -> usize {
    store.count_by_status(OutboxStatus::Pending)
}

pub fn acked(bus: &InMemoryBus) -> usize {
    bus.ack_events()
        .iter()
        .filter(|e| matches!(e, AckEvent::Acked { .. }))
        .count()
}

pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
