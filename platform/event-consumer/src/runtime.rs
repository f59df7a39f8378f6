//! Consumer runtime: durable subscriptions, partitioned dispatch and the
//! dedupe → handle → ledger → ack sequence for every delivery.
//!
//! A partition worker settles one delivery before it looks at the next. When
//! the ledger or the dead-letter store is unavailable the worker holds its
//! partition and retries that step in place, so a later event of the same
//! aggregate is never handled ahead of an earlier one that is still pending.

use crate::dlq::{DeadLetter, DeadLetterKind, DeadLetterSink};
use crate::error::{ConsumerError, HandlerError};
use crate::handler::EventHandler;
use crate::ledger::{LedgerOutcome, ProcessedEventLedger};
use crate::metrics::ConsumerMetrics;
use crate::middleware::{Middleware, Pipeline};
use chrono::Utc;
use event_bus::config::{env_millis, env_parse};
use event_bus::partition::partition_of;
use event_bus::retry::{retry_while, RetryConfig};
use event_bus::{
    validate_envelope_fields, BrokerClient, BusMessage, RawEnvelope, HEADER_AGGREGATE_ID,
    HEADER_EVENT_TYPE, HEADER_MSG_ID,
};
use futures::StreamExt;
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer name: ledger scope, dead-letter owner and durable prefix
    pub name: String,
    /// Partition workers per subscription
    pub partitions: usize,
    /// Upper bound on handler invocations per event, broker redeliveries included
    pub max_attempts: u32,
    /// Backoff between in-worker retries of a transient failure
    pub retry: RetryConfig,
    /// Bounded queue in front of each partition worker
    pub queue_capacity: usize,
}

impl ConsumerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: 4,
            max_attempts: 5,
            retry: RetryConfig {
                max_attempts: 5,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(10),
            },
            queue_capacity: 64,
        }
    }

    pub fn from_env(name: impl Into<String>) -> Result<Self, ConsumerError> {
        let defaults = Self::new(name);
        let max_attempts = env_parse("CONSUMER_MAX_ATTEMPTS", defaults.max_attempts)
            .map_err(ConsumerError::Config)?;

        let config = Self {
            partitions: env_parse("CONSUMER_PARTITIONS", defaults.partitions)
                .map_err(ConsumerError::Config)?,
            max_attempts,
            retry: RetryConfig {
                max_attempts,
                initial_backoff: env_millis("CONSUMER_BACKOFF_INITIAL_MS", 200)
                    .map_err(ConsumerError::Config)?,
                max_backoff: env_millis("CONSUMER_BACKOFF_MAX_MS", 10_000)
                    .map_err(ConsumerError::Config)?,
            },
            queue_capacity: env_parse("CONSUMER_QUEUE_CAPACITY", defaults.queue_capacity)
                .map_err(ConsumerError::Config)?,
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.name.is_empty() {
            return Err(ConsumerError::Config("consumer name cannot be empty".into()));
        }
        if self.partitions == 0 {
            return Err(ConsumerError::Config("CONSUMER_PARTITIONS must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConsumerError::Config("CONSUMER_MAX_ATTEMPTS must be > 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConsumerError::Config(
                "CONSUMER_QUEUE_CAPACITY must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded, ledger written, acked
    Handled,
    /// Already in the ledger, acked without invoking the handler
    Duplicate,
    /// Dead-lettered and terminated
    DeadLettered(DeadLetterKind),
    /// Shutdown arrived while a step was failing; nacked for redelivery
    Abandoned,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Handled => "handled",
            Outcome::Duplicate => "duplicate",
            Outcome::DeadLettered(_) => "dead_lettered",
            Outcome::Abandoned => "abandoned",
        }
    }
}

/// Per-delivery processing shared by all partition workers of a consumer
#[derive(Clone)]
pub struct Dispatcher {
    consumer: String,
    ledger: Arc<dyn ProcessedEventLedger>,
    dlq: Arc<dyn DeadLetterSink>,
    max_attempts: u32,
    retry: RetryConfig,
    metrics: ConsumerMetrics,
}

impl Dispatcher {
    pub fn new(
        config: &ConsumerConfig,
        ledger: Arc<dyn ProcessedEventLedger>,
        dlq: Arc<dyn DeadLetterSink>,
        metrics: ConsumerMetrics,
    ) -> Self {
        Self {
            consumer: config.name.clone(),
            ledger,
            dlq,
            max_attempts: config.max_attempts.max(1),
            retry: config.retry.clone(),
            metrics,
        }
    }

    /// Run one delivery to completion and settle it with the broker
    ///
    /// Ledger and dead-letter failures are retried in place with backoff;
    /// only `shutdown` turns them into [`Outcome::Abandoned`].
    pub async fn process(
        &self,
        msg: BusMessage,
        pipeline: &Pipeline,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Outcome {
        let span = tracing::info_span!(
            "consume",
            consumer = %self.consumer,
            subject = %msg.subject,
            delivery_attempt = msg.delivery_attempt,
        );

        let outcome = self.settle(&msg, pipeline, shutdown).instrument(span).await;
        self.metrics
            .events_processed_total
            .with_label_values(&[self.consumer.as_str(), outcome.as_str()])
            .inc();
        outcome
    }

    async fn settle(
        &self,
        msg: &BusMessage,
        pipeline: &Pipeline,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Outcome {
        let envelope = match parse_envelope(&msg.payload) {
            Ok(envelope) => envelope,
            Err(reason) => {
                let event_id = msg
                    .header(HEADER_MSG_ID)
                    .and_then(|id| Uuid::parse_str(id).ok())
                    .unwrap_or_else(Uuid::new_v4);
                tracing::warn!(event_id = %event_id, error = %reason, "Malformed envelope");
                let letter = DeadLetter {
                    event_id,
                    consumer_name: self.consumer.clone(),
                    subject: msg.subject.clone(),
                    event_type: msg.header(HEADER_EVENT_TYPE).map(str::to_string),
                    envelope: DeadLetter::envelope_from_bytes(&msg.payload),
                    error: reason,
                    kind: DeadLetterKind::Malformed,
                    attempts: msg.delivery_attempt as i32,
                    failed_at: Utc::now(),
                    replayed_at: None,
                };
                return self.dead_letter(msg, letter, shutdown).await;
            }
        };

        let processed = self
            .hold("ledger_lookup", shutdown, || {
                self.ledger.is_processed(envelope.event_id, &self.consumer)
            })
            .await;
        match processed {
            Some(true) => {
                tracing::debug!(event_id = %envelope.event_id, "Duplicate delivery, acking");
                if let Err(e) = msg.ack().await {
                    tracing::warn!(event_id = %envelope.event_id, error = %e, "Ack failed");
                }
                return Outcome::Duplicate;
            }
            Some(false) => {}
            None => return self.abandon(msg).await,
        }

        let prior = msg.delivery_attempt.saturating_sub(1);
        let result = if prior >= self.max_attempts {
            Err((
                HandlerError::Retryable(format!(
                    "delivery limit of {} reached",
                    self.max_attempts
                )),
                0,
            ))
        } else {
            self.invoke(&envelope, pipeline, self.max_attempts - prior).await
        };

        match result {
            Ok(attempts) => self.commit(msg, &envelope, attempts, shutdown).await,
            Err((error, attempts)) => {
                let kind = if error.is_retryable() {
                    DeadLetterKind::RetriesExhausted
                } else {
                    DeadLetterKind::Poison
                };
                let letter = DeadLetter {
                    event_id: envelope.event_id,
                    consumer_name: self.consumer.clone(),
                    subject: msg.subject.clone(),
                    event_type: Some(envelope.event_type.clone()),
                    envelope: serde_json::to_value(&envelope).unwrap_or(Value::Null),
                    error: error.to_string(),
                    kind,
                    attempts: (prior + attempts) as i32,
                    failed_at: Utc::now(),
                    replayed_at: None,
                };
                self.dead_letter(msg, letter, shutdown).await
            }
        }
    }

    /// Handler with in-worker retries; returns the number of invocations made
    async fn invoke(
        &self,
        envelope: &RawEnvelope,
        pipeline: &Pipeline,
        budget: u32,
    ) -> Result<u32, (HandlerError, u32)> {
        let attempts = AtomicU32::new(0);
        let retry = RetryConfig {
            max_attempts: budget,
            ..self.retry.clone()
        };
        let context = format!("{}:{}", self.consumer, envelope.event_type);

        let result = retry_while(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                self.metrics
                    .handler_attempts_total
                    .with_label_values(&[self.consumer.as_str(), envelope.event_type.as_str()])
                    .inc();
                self.timed(pipeline, envelope)
            },
            &retry,
            &context,
            HandlerError::is_retryable,
        )
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        result.map(|_| attempts).map_err(|e| (e, attempts))
    }

    async fn timed(&self, pipeline: &Pipeline, envelope: &RawEnvelope) -> Result<(), HandlerError> {
        let started = Instant::now();
        let result = pipeline.run(envelope).await;
        let label = if result.is_ok() { "ok" } else { "error" };
        self.metrics
            .handler_duration_seconds
            .with_label_values(&[self.consumer.as_str(), label])
            .observe(started.elapsed().as_secs_f64());
        result
    }

    /// Ledger first, then ack; the handler is not invoked again while the
    /// ledger write is retried
    async fn commit(
        &self,
        msg: &BusMessage,
        envelope: &RawEnvelope,
        attempts: u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Outcome {
        let recorded = self
            .hold("ledger_write", shutdown, || {
                self.ledger
                    .record(envelope.event_id, &self.consumer, &envelope.event_type)
            })
            .await;
        match recorded {
            Some(LedgerOutcome::Inserted) => {}
            Some(LedgerOutcome::Duplicate) => {
                tracing::debug!(
                    event_id = %envelope.event_id,
                    "Ledger entry already present after handling"
                );
            }
            None => return self.abandon(msg).await,
        }

        if let Err(e) = msg.ack().await {
            tracing::warn!(event_id = %envelope.event_id, error = %e, "Ack failed");
        }
        tracing::debug!(event_id = %envelope.event_id, attempts, "Event handled");
        Outcome::Handled
    }

    async fn dead_letter(
        &self,
        msg: &BusMessage,
        letter: DeadLetter,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Outcome {
        if self
            .hold("dead_letter_write", shutdown, || self.dlq.dead_letter(&letter))
            .await
            .is_none()
        {
            return self.abandon(msg).await;
        }

        tracing::error!(
            event_id = %letter.event_id,
            event_type = letter.event_type.as_deref().unwrap_or("unknown"),
            kind = %letter.kind,
            attempts = letter.attempts,
            error = %letter.error,
            "Event dead-lettered"
        );
        self.metrics
            .events_dead_lettered_total
            .with_label_values(&[self.consumer.as_str(), letter.kind.as_str()])
            .inc();

        if let Err(e) = msg.term().await {
            tracing::warn!(event_id = %letter.event_id, error = %e, "Term failed");
        }
        Outcome::DeadLettered(letter.kind)
    }

    /// Retry `op` with backoff until it succeeds; `None` once shutdown is signalled
    async fn hold<T, E, F, Fut>(
        &self,
        step: &'static str,
        shutdown: &mut watch::Receiver<bool>,
        mut op: F,
    ) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut failures = 0u32;
        loop {
            let delay = match op().await {
                Ok(value) => return Some(value),
                Err(error) => {
                    failures += 1;
                    self.metrics
                        .partition_stalls_total
                        .with_label_values(&[self.consumer.as_str(), step])
                        .inc();
                    let delay = self.retry.backoff_for(failures);
                    tracing::warn!(
                        step,
                        failures,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "Holding partition until step succeeds"
                    );
                    delay
                }
            };

            if *shutdown.borrow() {
                return None;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn abandon(&self, msg: &BusMessage) -> Outcome {
        if let Err(e) = msg.nak(Some(self.retry.initial_backoff)).await {
            tracing::warn!(subject = %msg.subject, error = %e, "Nak failed");
        }
        Outcome::Abandoned
    }
}

fn parse_envelope(bytes: &[u8]) -> Result<RawEnvelope, String> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    validate_envelope_fields(&value)?;
    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// Ordering key of a delivery: aggregate header, then envelope aggregate,
/// then event ID, then subject
pub fn partition_key(msg: &BusMessage) -> String {
    if let Some(aggregate_id) = msg.header(HEADER_AGGREGATE_ID) {
        return aggregate_id.to_string();
    }
    if let Ok(value) = serde_json::from_slice::<Value>(&msg.payload) {
        for field in ["aggregateID", "eventID"] {
            if let Some(key) = value.get(field).and_then(Value::as_str) {
                return key.to_string();
            }
        }
    }
    msg.subject.clone()
}

pub fn partition_for(key: &str, partitions: usize) -> usize {
    partition_of(key, partitions.max(1) as u32) as usize
}

/// JetStream durable names may not contain `.`, `*` or `>`
pub fn durable_name(consumer: &str, pattern: &str) -> String {
    let sanitized: String = pattern
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{}-{}", consumer, sanitized)
}

/// Builder for a named consumer; [`ConsumerRuntime::start`] spawns its tasks
pub struct ConsumerRuntime {
    config: ConsumerConfig,
    broker: BrokerClient,
    ledger: Arc<dyn ProcessedEventLedger>,
    dlq: Arc<dyn DeadLetterSink>,
    routes: Vec<(String, Arc<dyn EventHandler>)>,
    layers: Vec<Arc<dyn Middleware>>,
    metrics: ConsumerMetrics,
}

impl ConsumerRuntime {
    pub fn new(
        config: ConsumerConfig,
        broker: BrokerClient,
        ledger: Arc<dyn ProcessedEventLedger>,
        dlq: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            config,
            broker,
            ledger,
            dlq,
            routes: Vec::new(),
            layers: Vec::new(),
            metrics: ConsumerMetrics::new(),
        }
    }

    /// Route deliveries on `pattern` to `handler`
    pub fn subscribe(mut self, pattern: impl Into<String>, handler: impl EventHandler + 'static) -> Self {
        self.routes.push((pattern.into(), Arc::new(handler)));
        self
    }

    /// Add a middleware layer; the first added is the outermost
    pub fn layer(mut self, middleware: impl Middleware + 'static) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    pub fn with_metrics(mut self, metrics: ConsumerMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &ConsumerMetrics {
        &self.metrics
    }

    pub async fn start(self) -> Result<ConsumerHandle, ConsumerError> {
        self.config.validate()?;
        if self.routes.is_empty() {
            return Err(ConsumerError::NoSubscriptions);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(
            &self.config,
            self.ledger.clone(),
            self.dlq.clone(),
            self.metrics.clone(),
        );
        let mut tasks = Vec::new();

        for (pattern, handler) in &self.routes {
            let durable = durable_name(&self.config.name, pattern);
            let stream = self.broker.consume(&durable, pattern).await?;
            let pipeline = Pipeline::new(handler.clone(), self.layers.clone());

            let mut queues = Vec::with_capacity(self.config.partitions);
            for partition in 0..self.config.partitions {
                let (tx, rx) = mpsc::channel(self.config.queue_capacity);
                queues.push(tx);
                tasks.push(tokio::spawn(partition_worker(
                    partition,
                    rx,
                    dispatcher.clone(),
                    pipeline.clone(),
                    shutdown_rx.clone(),
                )));
            }

            tasks.push(tokio::spawn(reader(
                durable.clone(),
                stream,
                queues,
                self.metrics.clone(),
                self.config.name.clone(),
                shutdown_rx.clone(),
            )));

            tracing::info!(
                consumer = %self.config.name,
                durable = %durable,
                pattern = %pattern,
                partitions = self.config.partitions,
                "Consumer subscribed"
            );
        }

        Ok(ConsumerHandle { shutdown_tx, tasks })
    }
}

async fn reader(
    durable: String,
    mut stream: futures::stream::BoxStream<'static, BusMessage>,
    queues: Vec<mpsc::Sender<BusMessage>>,
    metrics: ConsumerMetrics,
    consumer: String,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let msg = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            msg = stream.next() => match msg {
                Some(msg) => msg,
                None => {
                    tracing::warn!(durable = %durable, "Subscription stream ended");
                    break;
                }
            },
        };

        let partition = partition_for(&partition_key(&msg), queues.len());
        let partition_label = partition.to_string();
        let depth = metrics
            .partition_queue_depth
            .with_label_values(&[consumer.as_str(), partition_label.as_str()]);

        tokio::select! {
            biased;
            // Not acked, the broker redelivers it
            _ = shutdown.changed() => break,
            sent = queues[partition].send(msg) => {
                if sent.is_err() {
                    break;
                }
                depth.inc();
            }
        }
    }
    tracing::debug!(durable = %durable, "Reader stopped");
}

async fn partition_worker(
    partition: usize,
    mut queue: mpsc::Receiver<BusMessage>,
    dispatcher: Dispatcher,
    pipeline: Pipeline,
    mut shutdown: watch::Receiver<bool>,
) {
    let partition_label = partition.to_string();
    let depth = dispatcher
        .metrics
        .partition_queue_depth
        .with_label_values(&[dispatcher.consumer.as_str(), partition_label.as_str()]);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let msg = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            msg = queue.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        depth.dec();

        dispatcher.process(msg, &pipeline, &mut shutdown).await;
    }
    tracing::debug!(partition, "Partition worker stopped");
}

/// Running consumer; dropping it without [`ConsumerHandle::shutdown`] leaves
/// the tasks running
pub struct ConsumerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Stop pulling, let in-flight deliveries settle, then return
    ///
    /// Queued deliveries that never started stay unacknowledged; a delivery
    /// held on a failing ledger or dead-letter step is nacked.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Consumer task panicked");
            }
        }
    }
}
