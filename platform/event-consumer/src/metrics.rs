use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct ConsumerMetrics {
    registry: Registry,

    pub events_processed_total: IntCounterVec,
    pub events_dead_lettered_total: IntCounterVec,
    pub handler_attempts_total: IntCounterVec,
    pub partition_queue_depth: IntGaugeVec,
    pub partition_stalls_total: IntCounterVec,
    pub handler_duration_seconds: HistogramVec,
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_processed_total = IntCounterVec::new(
            Opts::new("consumer_events_processed_total", "Deliveries settled by outcome"),
            &["consumer", "outcome"], // handled|duplicate|dead_lettered|abandoned
        )
        .expect("metric");

        let events_dead_lettered_total = IntCounterVec::new(
            Opts::new("consumer_events_dead_lettered_total", "Envelopes dead-lettered"),
            &["consumer", "kind"],
        )
        .expect("metric");

        let handler_attempts_total = IntCounterVec::new(
            Opts::new("consumer_handler_attempts_total", "Handler invocations"),
            &["consumer", "event_type"],
        )
        .expect("metric");

        let partition_queue_depth = IntGaugeVec::new(
            Opts::new(
                "consumer_partition_queue_depth",
                "Messages queued per partition worker",
            ),
            &["consumer", "partition"],
        )
        .expect("metric");

        let partition_stalls_total = IntCounterVec::new(
            Opts::new(
                "consumer_partition_stalls_total",
                "Failed ledger or dead-letter steps retried while holding a partition",
            ),
            &["consumer", "step"], // ledger_lookup|ledger_write|dead_letter_write
        )
        .expect("metric");

        let handler_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "consumer_handler_duration_seconds",
                "Time spent in the handler pipeline per delivery",
            ),
            &["consumer", "result"], // ok|error
        )
        .expect("metric");

        registry
            .register(Box::new(events_processed_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(events_dead_lettered_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(handler_attempts_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(partition_queue_depth.clone()))
            .expect("metric");
        registry
            .register(Box::new(partition_stalls_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(handler_duration_seconds.clone()))
            .expect("metric");

        Self {
            registry,
            events_processed_total,
            events_dead_lettered_total,
            handler_attempts_total,
            partition_queue_depth,
            partition_stalls_total,
            handler_duration_seconds,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
