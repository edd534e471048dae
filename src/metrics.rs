//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Federation Metrics
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_federation_requests_total", "Total number of federation requests"),
        &["direction", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "fedcore_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");
    pub static ref SIGNATURE_VERIFICATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_signature_verifications_total", "HTTP signature verification outcomes"),
        &["result"]
    ).expect("metric can be created");

    // Delivery Metrics
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_deliveries_total", "Signed activity deliveries by outcome"),
        &["status"]
    ).expect("metric can be created");
    pub static ref QUEUE_MESSAGES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_queue_messages_total", "Delivery queue transitions"),
        &["transition"]
    ).expect("metric can be created");

    // Actor directory cache
    pub static ref ACTOR_CACHE_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_actor_cache_total", "Actor directory lookups by cache outcome"),
        &["outcome"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcore_errors_total", "Total number of errors returned to callers"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
///
/// Registration failures (for example calling this twice) are logged and ignored.
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVITIES_RECEIVED.clone()),
        Box::new(FEDERATION_REQUESTS_TOTAL.clone()),
        Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()),
        Box::new(SIGNATURE_VERIFICATIONS_TOTAL.clone()),
        Box::new(DELIVERIES_TOTAL.clone()),
        Box::new(QUEUE_MESSAGES_TOTAL.clone()),
        Box::new(ACTOR_CACHE_TOTAL.clone()),
        Box::new(ERRORS_TOTAL.clone()),
    ];

    for collector in collectors {
        if let Err(error) = REGISTRY.register(collector) {
            tracing::warn!(%error, "Metric registration skipped");
        }
    }

    tracing::info!("Metrics registry initialized");
}
