use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total frames received from MQTT"
    ))
    .unwrap();
    pub static ref PIPELINE_OUTCOMES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_pipeline_outcomes_total",
            "Pipeline runs by outcome"
        ),
        &["outcome"]
    )
    .unwrap();
    pub static ref DROPPED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("ingestor_dropped_total", "Dropped messages by reason"),
        &["reason"]
    )
    .unwrap();
    pub static ref PUBLISH_ATTEMPTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_publish_attempts_total",
        "Total publish attempts against the fanout exchange"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Total database insert failures"
    ))
    .unwrap();
    pub static ref RECONNECTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_reconnects_total",
            "Reconnect attempts by connection role"
        ),
        &["role"]
    )
    .unwrap();
    pub static ref CONNECTION_STATE: GaugeVec = GaugeVec::new(
        Opts::new(
            "ingestor_connection_state",
            "0=disconnected 1=connecting 2=connected 3=reconnecting"
        ),
        &["role"]
    )
    .unwrap();
    pub static ref QUEUE_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_queue_full_total",
        "Total number of times the work queue was full (backpressure events)"
    ))
    .unwrap();
    pub static ref PIPELINE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_pipeline_latency_seconds",
            "Time taken to run one message through the pipeline"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PIPELINE_OUTCOMES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DROPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PUBLISH_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONNECTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONNECTION_STATE.clone()))?;
    REGISTRY.register(Box::new(QUEUE_FULL_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PIPELINE_LATENCY_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
