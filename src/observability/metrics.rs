use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub dispatch_attempts_total: IntCounterVec,
    pub dispatch_latency_seconds: HistogramVec,
    pub dispatch_queue_depth: IntGauge,
    pub deliveries_active: IntGauge,
    pub location_updates_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let dispatch_attempts_total = IntCounterVec::new(
            Opts::new(
                "dispatch_attempts_total",
                "Dispatch messages processed by outcome",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_attempts_total metric");

        let dispatch_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "dispatch_latency_seconds",
                "Latency of one dispatch message in seconds",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_latency_seconds metric");

        let dispatch_queue_depth = IntGauge::new(
            "dispatch_queue_depth",
            "Messages waiting in the dispatch queue",
        )
        .expect("valid dispatch_queue_depth metric");

        let deliveries_active = IntGauge::new(
            "deliveries_active",
            "Deliveries in a non-terminal state",
        )
        .expect("valid deliveries_active metric");

        let location_updates_total = IntCounter::new(
            "location_updates_total",
            "Accepted driver location reports",
        )
        .expect("valid location_updates_total metric");

        registry
            .register(Box::new(dispatch_attempts_total.clone()))
            .expect("register dispatch_attempts_total");
        registry
            .register(Box::new(dispatch_latency_seconds.clone()))
            .expect("register dispatch_latency_seconds");
        registry
            .register(Box::new(dispatch_queue_depth.clone()))
            .expect("register dispatch_queue_depth");
        registry
            .register(Box::new(deliveries_active.clone()))
            .expect("register deliveries_active");
        registry
            .register(Box::new(location_updates_total.clone()))
            .expect("register location_updates_total");

        Self {
            registry,
            dispatch_attempts_total,
            dispatch_latency_seconds,
            dispatch_queue_depth,
            deliveries_active,
            location_updates_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
