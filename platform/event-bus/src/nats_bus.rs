//! NATS-based implementation of the EventBus trait

use crate::partition::{
    any_partition_filter, partition_filter, partitioned_subject, strip_partition,
};
use crate::{Acker, BusError, BusMessage, BusResult, EventBus};
use async_nats::jetstream::{self, consumer::pull, stream, AckKind};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;

/// Stream and consumer settings applied by [`NatsBus`]
#[derive(Debug, Clone)]
pub struct NatsStreamConfig {
    /// JetStream stream that captures every event subject
    pub stream_name: String,
    pub subjects: Vec<String>,
    pub max_age: Duration,
    /// Window in which JetStream drops publishes with a repeated `Nats-Msg-Id`
    pub duplicate_window: Duration,
    /// Redelivery cap for durable consumers
    pub max_deliver: i64,
    pub ack_wait: Duration,
    /// Subject partitions; each durable consumer gets one JetStream consumer per partition
    pub partitions: u32,
}

impl Default for NatsStreamConfig {
    fn default() -> Self {
        Self {
            stream_name: "PLATFORM_EVENTS".to_string(),
            subjects: vec!["events.>".to_string(), "dlq.>".to_string()],
            max_age: Duration::from_secs(60 * 60 * 24 * 14), // 14 days
            duplicate_window: Duration::from_secs(120),
            max_deliver: 10,
            ack_wait: Duration::from_secs(30),
            partitions: 8,
        }
    }
}

/// EventBus implementation using NATS JetStream
///
/// Publishes go through JetStream and wait for the stream's ack, so an `Ok`
/// means the message is stored. Subjects are partitioned by ordering key on
/// the wire (see [`crate::partition`]) and restored on receipt, so callers
/// only ever see logical subjects.
///
/// A durable consumer is one JetStream pull consumer per partition, each with
/// explicit acks and `max_ack_pending = 1`: the next message of a partition
/// is not handed to any replica until the previous one is settled.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::new(nats_client);
/// bus.ensure_stream().await?;
///
/// bus.publish("events.billing.subscription.created", b"{}".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    jetstream: jetstream::Context,
    config: NatsStreamConfig,
}

impl NatsBus {
    /// Create a new NatsBus from an existing NATS client
    pub fn new(client: Client) -> Self {
        Self::with_config(client, NatsStreamConfig::default())
    }

    pub fn with_config(client: Client, config: NatsStreamConfig) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            config,
        }
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Create the events stream if it does not exist yet
    pub async fn ensure_stream(&self) -> BusResult<()> {
        if self
            .jetstream
            .get_stream(&self.config.stream_name)
            .await
            .is_ok()
        {
            return Ok(());
        }

        let cfg = stream::Config {
            name: self.config.stream_name.clone(),
            subjects: self
                .config
                .subjects
                .iter()
                .map(|subject| any_partition_filter(subject))
                .collect(),
            max_age: self.config.max_age,
            duplicate_window: self.config.duplicate_window,
            ..Default::default()
        };
        self.jetstream
            .create_stream(cfg)
            .await
            .map_err(|e| BusError::ConnectionError(format!("create stream: {}", e)))?;

        tracing::info!(stream = %self.config.stream_name, "JetStream stream created");
        Ok(())
    }

    async fn consume_partition(
        &self,
        durable: String,
        filter: String,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        let stream = self
            .jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: filter,
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    max_deliver: self.config.max_deliver,
                    max_ack_pending: 1,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let stream = async_stream::stream! {
            while let Some(next) = messages.next().await {
                match next {
                    Ok(js_msg) => {
                        let delivered = js_msg
                            .info()
                            .map(|info| info.delivered.max(1) as u32)
                            .unwrap_or(1);
                        let msg = Self::to_bus_message(&js_msg.message)
                            .with_delivery_attempt(delivered);
                        yield msg.with_acker(std::sync::Arc::new(JetStreamAcker { message: js_msg }));
                    }
                    Err(e) => {
                        tracing::warn!(durable = %durable, error = %e, "JetStream pull error");
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    fn to_bus_message(nats_msg: &async_nats::Message) -> BusMessage {
        let mut msg = BusMessage::new(
            strip_partition(nats_msg.subject.as_str()),
            nats_msg.payload.to_vec(),
        );

        if let Some(reply) = &nats_msg.reply {
            msg = msg.with_reply_to(reply.to_string());
        }

        if let Some(nats_headers) = &nats_msg.headers {
            let mut headers = HashMap::new();
            for (key, values) in nats_headers.iter() {
                // Take the first value for each header
                if let Some(value) = values.first() {
                    headers.insert(key.to_string(), value.to_string());
                }
            }
            if !headers.is_empty() {
                msg = msg.with_headers(headers);
            }
        }

        msg
    }
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn nak(&self, delay: Option<Duration>) -> BusResult<()> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn term(&self) -> BusResult<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.publish_message(BusMessage::new(subject.to_string(), payload))
            .await
    }

    async fn publish_message(&self, msg: BusMessage) -> BusResult<()> {
        let mut headers = HeaderMap::new();
        if let Some(h) = &msg.headers {
            for (key, value) in h {
                headers.insert(key.as_str(), value.as_str());
            }
        }

        let subject = partitioned_subject(&msg, self.config.partitions);
        let ack = self
            .jetstream
            .publish_with_headers(subject, headers, msg.payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        // Stored once the stream acks
        ack.await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(any_partition_filter(subject))
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let stream = subscriber.map(|nats_msg| Self::to_bus_message(&nats_msg));

        Ok(stream.boxed())
    }

    async fn consume(
        &self,
        durable_name: &str,
        subject: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        self.ensure_stream().await?;

        let mut partitions = Vec::with_capacity(self.config.partitions as usize);
        for partition in 0..self.config.partitions.max(1) {
            let durable = format!("{}-p{}", durable_name, partition);
            let filter = partition_filter(subject, partition);
            partitions.push(self.consume_partition(durable, filter).await?);
        }

        Ok(futures::stream::select_all(partitions).boxed())
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    async fn close(&self) -> BusResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))
    }
}
