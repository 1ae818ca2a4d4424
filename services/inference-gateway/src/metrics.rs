//! Gateway metrics, registered in the default prometheus registry that
//! `gateway_core::probe_routes` exposes on `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge_vec, HistogramVec, IntCounter,
    IntCounterVec, IntGaugeVec,
};

pub static CLASSIFY_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_classify_requests_total",
        "Classification requests by modality, kind and outcome",
        &["modality", "kind", "outcome"]
    )
    .expect("register gateway_classify_requests_total")
});

pub static INFERENCE_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "gateway_inference_latency_ms",
        "Wall-clock time spent in inference calls per request (ms)",
        &["modality", "kind"],
        vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]
    )
    .expect("register gateway_inference_latency_ms")
});

pub static MODEL_ACQUIRE_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "gateway_model_acquire_ms",
        "Model acquisition duration by modality and outcome (ms)",
        &["modality", "outcome"],
        vec![100.0, 500.0, 1000.0, 5000.0, 15000.0, 60000.0, 300000.0]
    )
    .expect("register gateway_model_acquire_ms")
});

pub static MODEL_READY: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!("gateway_model_ready", "1 when the modality's model is loaded", &["modality"])
        .expect("register gateway_model_ready")
});

pub static CLEANUP_DELETED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("gateway_artifact_cleanup_deleted_total", "Uploaded files deleted after the grace period")
        .expect("register gateway_artifact_cleanup_deleted_total")
});

pub static CLEANUP_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("gateway_artifact_cleanup_failures_total", "Uploaded files that could not be deleted")
        .expect("register gateway_artifact_cleanup_failures_total")
});

pub fn record_request(modality: &str, kind: &str, outcome: &str) {
    CLASSIFY_REQUESTS.with_label_values(&[modality, kind, outcome]).inc();
}
