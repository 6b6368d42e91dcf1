//! Metrics module
//!
//! Prometheus metrics describing the tracing pipeline itself: sampling
//! decisions, exported telemetry items and ingestion calls.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_int_counter_vec, CounterVec, Encoder,
    Histogram, IntCounterVec, TextEncoder,
};

lazy_static! {
    // Sampling metrics
    pub static ref SAMPLING_DECISIONS: IntCounterVec = register_int_counter_vec!(
        "currency_telemetry_sampling_decisions_total",
        "Sampling decisions made by the Application Insights sampler",
        &["decision"]  // "sampled" or "dropped"
    ).unwrap();

    // Export metrics
    pub static ref EXPORTED_ITEMS: IntCounterVec = register_int_counter_vec!(
        "currency_telemetry_exported_items_total",
        "Telemetry items sent to the ingestion endpoint",
        &["outcome"]  // "accepted" or "rejected"
    ).unwrap();

    pub static ref EXPORT_FAILURES: CounterVec = register_counter_vec!(
        "currency_telemetry_export_failures_total",
        "Ingestion calls that did not succeed",
        &["reason"]
    ).unwrap();

    pub static ref EXPORT_DURATION: Histogram = register_histogram!(
        "currency_telemetry_export_duration_seconds",
        "Ingestion call duration in seconds",
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();
}

/// Record one sampling decision
pub fn record_sampling_decision(sampled: bool) {
    let decision = if sampled { "sampled" } else { "dropped" };
    SAMPLING_DECISIONS.with_label_values(&[decision]).inc();
}

/// Record the outcome of the items in one ingestion call
pub fn record_items(accepted: usize, rejected: usize) {
    if accepted > 0 {
        EXPORTED_ITEMS
            .with_label_values(&["accepted"])
            .inc_by(accepted as u64);
    }
    if rejected > 0 {
        EXPORTED_ITEMS
            .with_label_values(&["rejected"])
            .inc_by(rejected as u64);
    }
}

/// Record a failed ingestion call
pub fn record_export_failure(reason: &str) {
    EXPORT_FAILURES.with_label_values(&[reason]).inc();
}

/// Record ingestion call duration
pub fn record_export_duration(duration_secs: f64) {
    EXPORT_DURATION.observe(duration_secs);
}

/// Render the default registry in the text exposition format
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
