//! Relay worker: moves committed outbox records onto the broker
//!
//! Each service instance runs one relay. A pass claims a batch of due records
//! under a lease, publishes each with the broker's confirmation and only then
//! marks it published. Failed publishes are retried with exponential backoff
//! until `max_attempts`, after which the record is marked failed and an alert
//! is raised. Several relays may share one outbox: leases keep them from
//! publishing the same record concurrently, and an expired lease lets a live
//! replica pick up a dead one's work.

use crate::config::{env_millis, env_parse};
use crate::metrics::OutboxMetrics;
use crate::outbox::{OutboxRecord, OutboxResult, OutboxStatus, OutboxStore};
use crate::retry::RetryConfig;
use crate::{
    BrokerClient, BusMessage, HEADER_AGGREGATE_ID, HEADER_EVENT_TYPE, HEADER_MSG_ID,
    HEADER_SCHEMA_VERSION,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Lease owner identity, unique per relay instance
    pub owner: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub lease_ttl: Duration,
    /// Publish attempts before a record is marked failed
    pub max_attempts: i32,
    pub backoff: RetryConfig,
    pub subject_prefix: String,
    /// Published records older than this are purged; `None` keeps them forever
    pub retention: Option<Duration>,
    pub purge_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            owner: format!("relay-{}", Uuid::new_v4().simple()),
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(30),
            max_attempts: 10,
            backoff: RetryConfig {
                max_attempts: 10,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(300),
            },
            subject_prefix: "events".to_string(),
            retention: Some(Duration::from_secs(60 * 60 * 24 * 7)), // 7 days
            purge_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl RelayConfig {
    /// Read `OUTBOX_*` settings, falling back to the defaults
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();

        let owner = std::env::var("OUTBOX_RELAY_ID").unwrap_or(defaults.owner);
        let max_attempts = env_parse("OUTBOX_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts < 1 {
            return Err("OUTBOX_MAX_ATTEMPTS must be at least 1".to_string());
        }
        let batch_size = env_parse("OUTBOX_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err("OUTBOX_BATCH_SIZE must be at least 1".to_string());
        }

        let retention_hours: u64 = env_parse("OUTBOX_RETENTION_HOURS", 24 * 7)?;

        Ok(Self {
            owner,
            batch_size,
            poll_interval: env_millis("OUTBOX_POLL_INTERVAL_MS", 1_000)?,
            lease_ttl: env_millis("OUTBOX_LEASE_TTL_MS", 30_000)?,
            max_attempts,
            backoff: RetryConfig {
                max_attempts: max_attempts as u32,
                initial_backoff: env_millis("OUTBOX_BACKOFF_INITIAL_MS", 1_000)?,
                max_backoff: env_millis("OUTBOX_BACKOFF_MAX_MS", 300_000)?,
            },
            subject_prefix: std::env::var("EVENT_SUBJECT_PREFIX")
                .unwrap_or(defaults.subject_prefix),
            retention: (retention_hours > 0)
                .then(|| Duration::from_secs(retention_hours * 60 * 60)),
            purge_interval: env_millis("OUTBOX_PURGE_INTERVAL_MS", 60 * 60 * 1_000)?,
        })
    }
}

/// Receives operational alerts for records that exhausted their attempts
pub trait AlertSink: Send + Sync {
    fn outbox_record_failed(&self, record: &OutboxRecord, error: &str);
}

/// Default sink: a structured error log line per failed record
#[derive(Debug, Default, Clone)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn outbox_record_failed(&self, record: &OutboxRecord, error: &str) {
        tracing::error!(
            alert = "outbox_record_failed",
            outbox_id = %record.id,
            event_id = %record.event_id,
            event_type = %record.event_type,
            aggregate_id = %record.aggregate_id,
            attempts = record.attempts + 1,
            error = %error,
            "Outbox record exhausted publish attempts and needs operator attention"
        );
    }
}

/// Outcome counts of one relay pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub claimed: usize,
    pub published: usize,
    pub retry_scheduled: usize,
    pub failed: usize,
    pub lease_lost: usize,
    pub released: usize,
}

/// Wakes the relay right after a local commit instead of waiting for the next tick
#[derive(Clone, Debug, Default)]
pub struct RelayNotifier {
    notify: Arc<Notify>,
}

impl RelayNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Best effort; the periodic poll still picks the record up if this is missed
    pub fn nudge(&self) {
        self.notify.notify_one();
    }
}

/// Running relay task
pub struct RelayHandle {
    notifier: RelayNotifier,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RelayHandle {
    pub fn nudge(&self) {
        self.notifier.nudge();
    }

    pub fn notifier(&self) -> RelayNotifier {
        self.notifier.clone()
    }

    /// Stop after the in-flight publish and wait for the task to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "Outbox relay task panicked");
        }
    }
}

fn stopping(shutdown: Option<&watch::Receiver<bool>>) -> bool {
    shutdown.is_some_and(|rx| *rx.borrow())
}

pub struct Relay<S: OutboxStore> {
    store: S,
    broker: BrokerClient,
    config: RelayConfig,
    alerts: Arc<dyn AlertSink>,
    metrics: OutboxMetrics,
    notifier: RelayNotifier,
}

impl<S: OutboxStore> Relay<S> {
    pub fn new(store: S, broker: BrokerClient, config: RelayConfig) -> Self {
        Self {
            store,
            broker,
            config,
            alerts: Arc::new(LogAlertSink),
            metrics: OutboxMetrics::new(),
            notifier: RelayNotifier::new(),
        }
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Share a notifier created before the relay (e.g. held by a service)
    pub fn with_notifier(mut self, notifier: RelayNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn metrics(&self) -> &OutboxMetrics {
        &self.metrics
    }

    pub fn notifier(&self) -> RelayNotifier {
        self.notifier.clone()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Claim and publish a single batch
    pub async fn run_once(&self) -> OutboxResult<RelayStats> {
        self.run_batch(None).await
    }

    /// Remove published records past the retention window
    pub async fn purge(&self) -> OutboxResult<u64> {
        let Some(retention) = self.config.retention else {
            return Ok(0);
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let purged = self.store.purge_published(cutoff).await?;
        if purged > 0 {
            self.metrics.outbox_purged_total.inc_by(purged);
            tracing::info!(purged = purged, "Purged published outbox records");
        }
        Ok(purged)
    }

    async fn run_batch(&self, shutdown: Option<&watch::Receiver<bool>>) -> OutboxResult<RelayStats> {
        let records = self
            .store
            .claim_batch(
                &self.config.owner,
                self.config.lease_ttl,
                self.config.batch_size,
            )
            .await?;

        let mut stats = RelayStats {
            claimed: records.len(),
            ..Default::default()
        };
        if records.is_empty() {
            return Ok(stats);
        }
        self.metrics.outbox_claimed_total.inc_by(records.len() as u64);
        tracing::debug!(owner = %self.config.owner, claimed = records.len(), "Claimed outbox batch");

        let mut pending = records.into_iter();
        while let Some(record) = pending.next() {
            if stopping(shutdown) {
                let ids: Vec<Uuid> = std::iter::once(record.id)
                    .chain(pending.map(|r| r.id))
                    .collect();
                stats.released = self.store.release(&ids, &self.config.owner).await? as usize;
                tracing::info!(released = stats.released, "Released leases on shutdown");
                break;
            }
            self.publish_record(&record, &mut stats).await?;
        }

        Ok(stats)
    }

    fn to_message(&self, record: &OutboxRecord) -> OutboxResult<BusMessage> {
        let mut headers = HashMap::new();
        headers.insert(HEADER_MSG_ID.to_string(), record.event_id.to_string());
        headers.insert(HEADER_EVENT_TYPE.to_string(), record.event_type.clone());
        headers.insert(
            HEADER_SCHEMA_VERSION.to_string(),
            record.schema_version.to_string(),
        );
        headers.insert(HEADER_AGGREGATE_ID.to_string(), record.aggregate_id.clone());

        let subject = format!("{}.{}", self.config.subject_prefix, record.routing_key);
        Ok(BusMessage::new(subject, record.envelope_bytes()?).with_headers(headers))
    }

    async fn publish_record(&self, record: &OutboxRecord, stats: &mut RelayStats) -> OutboxResult<()> {
        let msg = self.to_message(record)?;
        let subject = msg.subject.clone();
        let started = Instant::now();

        match self.broker.publish_confirmed(msg).await {
            Ok(()) => {
                self.metrics
                    .outbox_publish_duration_seconds
                    .with_label_values(&["ok"])
                    .observe(started.elapsed().as_secs_f64());

                if self.store.mark_published(record.id, &self.config.owner).await? {
                    stats.published += 1;
                    self.metrics
                        .outbox_published_total
                        .with_label_values(&[record.event_type.as_str()])
                        .inc();
                    tracing::debug!(
                        event_id = %record.event_id,
                        subject = %subject,
                        "Published outbox event"
                    );
                } else {
                    // Another relay reclaimed the expired lease and owns the marking
                    stats.lease_lost += 1;
                    self.metrics.outbox_lease_lost_total.inc();
                    tracing::warn!(
                        event_id = %record.event_id,
                        owner = %self.config.owner,
                        "Lease lost before marking published; duplicate publish possible"
                    );
                }
            }
            Err(e) => {
                self.metrics
                    .outbox_publish_duration_seconds
                    .with_label_values(&["error"])
                    .observe(started.elapsed().as_secs_f64());
                self.metrics
                    .outbox_publish_failures_total
                    .with_label_values(&[record.event_type.as_str()])
                    .inc();

                let attempt = (record.attempts + 1).max(1) as u32;
                let backoff = self.config.backoff.backoff_for(attempt);
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(backoff)
                        .unwrap_or_else(|_| chrono::Duration::seconds(300));
                let error = e.to_string();

                let status = self
                    .store
                    .record_failure(
                        record.id,
                        &self.config.owner,
                        &error,
                        retry_at,
                        self.config.max_attempts,
                    )
                    .await?;

                if status == OutboxStatus::Failed {
                    stats.failed += 1;
                    self.metrics
                        .outbox_failed_total
                        .with_label_values(&[record.event_type.as_str()])
                        .inc();
                    self.alerts.outbox_record_failed(record, &error);
                } else {
                    stats.retry_scheduled += 1;
                    tracing::warn!(
                        event_id = %record.event_id,
                        subject = %subject,
                        attempts = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Publish failed, will retry"
                    );
                }
            }
        }

        Ok(())
    }

    /// Run the relay loop on a background task
    pub fn spawn(self) -> RelayHandle {
        let notifier = self.notifier.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        RelayHandle {
            notifier,
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_purge = Instant::now();

        tracing::info!(
            owner = %self.config.owner,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Outbox relay started"
        );

        loop {
            if stopping(Some(&shutdown)) {
                break;
            }

            match self.run_batch(Some(&shutdown)).await {
                // More work may be waiting behind a full batch
                Ok(stats) if stats.claimed > 0 => {
                    if !stopping(Some(&shutdown)) {
                        continue;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(owner = %self.config.owner, error = %e, "Outbox relay pass failed");
                }
            }

            if self.config.retention.is_some() && last_purge.elapsed() >= self.config.purge_interval {
                last_purge = Instant::now();
                if let Err(e) = self.purge().await {
                    tracing::error!(error = %e, "Outbox purge failed");
                }
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.notifier.notify.notified() => {
                    tracing::trace!("Outbox relay nudged");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(owner = %self.config.owner, "Outbox relay stopped");
    }
}
