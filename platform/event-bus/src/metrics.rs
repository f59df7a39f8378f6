use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Instant;

/// Relay counters, one registry per relay instance
#[derive(Clone)]
pub struct OutboxMetrics {
    registry: Registry,

    // Counters
    pub outbox_claimed_total: IntCounter,
    pub outbox_published_total: IntCounterVec,
    pub outbox_publish_failures_total: IntCounterVec,
    pub outbox_failed_total: IntCounterVec,
    pub outbox_lease_lost_total: IntCounter,
    pub outbox_purged_total: IntCounter,

    // Histograms
    pub outbox_publish_duration_seconds: HistogramVec,
}

impl OutboxMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let outbox_claimed_total = IntCounter::with_opts(Opts::new(
            "outbox_claimed_total",
            "Outbox records claimed under lease",
        ))
        .expect("metric");

        let outbox_published_total = IntCounterVec::new(
            Opts::new("outbox_published_total", "Outbox records confirmed by the broker"),
            &["event_type"],
        )
        .expect("metric");

        let outbox_publish_failures_total = IntCounterVec::new(
            Opts::new("outbox_publish_failures_total", "Failed publish attempts"),
            &["event_type"],
        )
        .expect("metric");

        let outbox_failed_total = IntCounterVec::new(
            Opts::new(
                "outbox_failed_total",
                "Outbox records that exhausted their attempts",
            ),
            &["event_type"],
        )
        .expect("metric");

        let outbox_lease_lost_total = IntCounter::with_opts(Opts::new(
            "outbox_lease_lost_total",
            "Publishes whose lease had been taken over before marking",
        ))
        .expect("metric");

        let outbox_purged_total = IntCounter::with_opts(Opts::new(
            "outbox_purged_total",
            "Published records removed by retention",
        ))
        .expect("metric");

        let outbox_publish_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "outbox_publish_duration_seconds",
                "Time from publish call to broker ack",
            ),
            &["result"], // ok|error
        )
        .expect("metric");

        registry
            .register(Box::new(outbox_claimed_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(outbox_published_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(outbox_publish_failures_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(outbox_failed_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(outbox_lease_lost_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(outbox_purged_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(outbox_publish_duration_seconds.clone()))
            .expect("metric");

        Self {
            registry,
            outbox_claimed_total,
            outbox_published_total,
            outbox_publish_failures_total,
            outbox_failed_total,
            outbox_lease_lost_total,
            outbox_purged_total,
            outbox_publish_duration_seconds,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }

    pub fn timer() -> Instant {
        Instant::now()
    }
}

impl Default for OutboxMetrics {
    fn default() -> Self {
        Self::new()
    }
}
