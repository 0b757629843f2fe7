use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Once;
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Scoring metrics
    pub static ref SCORE_REQUESTS: IntCounter = IntCounter::new(
        "score_requests_total",
        "Total number of scoring requests"
    ).unwrap();

    pub static ref SCORE_DETECTIONS: IntCounter = IntCounter::new(
        "score_detections_total",
        "Total number of objects detected"
    ).unwrap();

    pub static ref SCORE_REJECTED: IntCounter = IntCounter::new(
        "score_rejected_total",
        "Total number of scoring requests that failed"
    ).unwrap();

    pub static ref SCORE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "score_duration_seconds",
            "End-to-end scoring latency in seconds"
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    ).unwrap();

    // Upload and telemetry metrics
    pub static ref UPLOADS: IntCounter = IntCounter::new(
        "uploads_total",
        "Total number of frames uploaded to blob storage"
    ).unwrap();

    pub static ref UPLOAD_FAILURES: IntCounter = IntCounter::new(
        "upload_failures_total",
        "Total number of failed frame uploads"
    ).unwrap();

    pub static ref TELEMETRY_PUBLISHED: IntCounter = IntCounter::new(
        "telemetry_published_total",
        "Total number of telemetry messages published"
    ).unwrap();

    // Configuration and model metrics
    pub static ref CONFIG_PATCHES_APPLIED: IntCounter = IntCounter::new(
        "config_patches_applied_total",
        "Total number of desired-property patches applied"
    ).unwrap();

    pub static ref MODEL_LOADS: IntCounter = IntCounter::new(
        "model_loads_total",
        "Total number of successful model loads"
    ).unwrap();

    pub static ref MODEL_LOAD_FAILURES: IntCounter = IntCounter::new(
        "model_load_failures_total",
        "Total number of failed model acquisitions"
    ).unwrap();

    pub static ref MODEL_UPDATES_DEFERRED: IntCounter = IntCounter::new(
        "model_updates_deferred_total",
        "Model specs received while a model was already loaded"
    ).unwrap();

    pub static ref MODEL_LOAD_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "model_load_duration_seconds",
            "Model download, extraction and load time in seconds"
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0])
    ).unwrap();
}

static INIT: Once = Once::new();

/// Register all collectors. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(SCORE_REQUESTS.clone())).unwrap();
        REGISTRY.register(Box::new(SCORE_DETECTIONS.clone())).unwrap();
        REGISTRY.register(Box::new(SCORE_REJECTED.clone())).unwrap();
        REGISTRY.register(Box::new(SCORE_LATENCY.clone())).unwrap();

        REGISTRY.register(Box::new(UPLOADS.clone())).unwrap();
        REGISTRY.register(Box::new(UPLOAD_FAILURES.clone())).unwrap();
        REGISTRY.register(Box::new(TELEMETRY_PUBLISHED.clone())).unwrap();

        REGISTRY.register(Box::new(CONFIG_PATCHES_APPLIED.clone())).unwrap();
        REGISTRY.register(Box::new(MODEL_LOADS.clone())).unwrap();
        REGISTRY.register(Box::new(MODEL_LOAD_FAILURES.clone())).unwrap();
        REGISTRY.register(Box::new(MODEL_UPDATES_DEFERRED.clone())).unwrap();
        REGISTRY.register(Box::new(MODEL_LOAD_LATENCY.clone())).unwrap();

        tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
    });
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
