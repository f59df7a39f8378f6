//! Process-wide broker client with an explicit open/close lifecycle

use crate::config::{BusConfig, BusType};
use crate::{BusError, BusMessage, BusResult, EventBus, InMemoryBus, NatsBus, NatsStreamConfig};
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared handle to the message broker
///
/// Constructed once per process and injected into the relay and consumer
/// runtimes. Publishing waits for the broker's confirmation, bounded by
/// `publish_timeout`. After [`BrokerClient::close`] every operation fails with
/// [`BusError::Closed`].
#[derive(Clone)]
pub struct BrokerClient {
    bus: Arc<dyn EventBus>,
    closed: Arc<AtomicBool>,
    publish_timeout: Duration,
}

impl BrokerClient {
    /// Connect using the configured backend
    pub async fn connect(config: &BusConfig) -> BusResult<Self> {
        let bus: Arc<dyn EventBus> = match config.bus_type {
            BusType::Nats => {
                let url = config
                    .nats_url
                    .as_deref()
                    .unwrap_or("nats://localhost:4222");
                tracing::info!(url = %url, "Connecting to NATS");
                let client = async_nats::connect(url)
                    .await
                    .map_err(|e| BusError::ConnectionError(e.to_string()))?;
                let bus = NatsBus::with_config(
                    client,
                    NatsStreamConfig {
                        partitions: config.partitions,
                        ..Default::default()
                    },
                );
                bus.ensure_stream().await?;
                Arc::new(bus)
            }
            BusType::InMemory => {
                tracing::info!("Using in-memory event bus");
                Arc::new(InMemoryBus::new())
            }
        };

        Ok(Self::from_bus(bus).with_publish_timeout(config.publish_timeout))
    }

    /// Wrap an already constructed bus
    pub fn from_bus(bus: Arc<dyn EventBus>) -> Self {
        Self {
            bus,
            closed: Arc::new(AtomicBool::new(false)),
            publish_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    fn ensure_open(&self) -> BusResult<()> {
        if self.is_closed() {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    /// Publish and wait for the broker ack
    pub async fn publish_confirmed(&self, msg: BusMessage) -> BusResult<()> {
        self.ensure_open()?;
        match tokio::time::timeout(self.publish_timeout, self.bus.publish_message(msg)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(self.publish_timeout)),
        }
    }

    pub async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        self.ensure_open()?;
        self.bus.subscribe(pattern).await
    }

    /// Attach a durable consumer with explicit acks
    pub async fn consume(
        &self,
        durable_name: &str,
        pattern: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        self.ensure_open()?;
        self.bus.consume(durable_name, pattern).await
    }

    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.bus.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flush and close; later calls are no-ops
    pub async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Closing broker client");
        self.bus.close().await
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("closed", &self.is_closed())
            .field("publish_timeout", &self.publish_timeout)
            .finish()
    }
}
