use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tracing::warn;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SUBMISSIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "meter_submissions_total",
        "Total submissions received on /meter"
    ))
    .unwrap();
    pub static ref ACCEPTED_READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "meter_accepted_readings_total",
        "Total readings validated and stored"
    ))
    .unwrap();
    pub static ref REJECTED_READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "meter_rejected_readings_total",
        "Total submissions rejected by validation"
    ))
    .unwrap();
    pub static ref BOOT_NOTIFICATIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "meter_boot_notifications_total",
        "Total device boot notifications"
    ))
    .unwrap();
    pub static ref STORAGE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "meter_storage_failures_total",
        "Total submissions that failed in the store"
    ))
    .unwrap();
    pub static ref CLEANUP_DELETED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "meter_cleanup_deleted_total",
        "Total readings removed by retention cleanup"
    ))
    .unwrap();
    pub static ref SUBMIT_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "meter_submit_latency_seconds",
            "Time taken to validate and store one submission"
        )
        .buckets(vec![
            0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(SUBMISSIONS_TOTAL.clone()),
        Box::new(ACCEPTED_READINGS_TOTAL.clone()),
        Box::new(REJECTED_READINGS_TOTAL.clone()),
        Box::new(BOOT_NOTIFICATIONS_TOTAL.clone()),
        Box::new(STORAGE_FAILURES_TOTAL.clone()),
        Box::new(CLEANUP_DELETED_TOTAL.clone()),
        Box::new(SUBMIT_LATENCY_SECONDS.clone()),
    ];

    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            warn!("Failed to register metric: {}", e);
        }
    }
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
