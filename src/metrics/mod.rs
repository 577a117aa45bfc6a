//! Prometheus metrics for the publish engine
//!
//! Call `init_metrics()` once at startup to register everything. If
//! initialization never happens (library embedding, tests), every recording
//! function is a no-op.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Encoder, Gauge,
    TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all engine metrics
struct EngineMetrics {
    entries_enqueued: Counter,
    publish_outcomes: CounterVec,
    queue_depth: Gauge,
}

/// Global storage for engine metrics
static ENGINE_METRICS: OnceLock<EngineMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = EngineMetrics {
        entries_enqueued: register_counter!(
            "clipcast_entries_enqueued_total",
            "Queue entries created by the orchestrator"
        )?,
        publish_outcomes: register_counter_vec!(
            "clipcast_publish_outcomes_total",
            "Publish attempt outcomes by kind",
            &["outcome"]
        )?,
        queue_depth: register_gauge!(
            "clipcast_queue_depth",
            "Entries currently queued or processing"
        )?,
    };

    ENGINE_METRICS.set(metrics).ok();
    Ok(())
}

// ============================================================================
// Recording
// ============================================================================

/// Count one enqueued entry
pub fn record_enqueued() {
    if let Some(metrics) = ENGINE_METRICS.get() {
        metrics.entries_enqueued.inc();
    }
}

/// Count one publish outcome: "published", "retried", or "failed"
pub fn record_outcome(outcome: &str) {
    if let Some(metrics) = ENGINE_METRICS.get() {
        metrics.publish_outcomes.with_label_values(&[outcome]).inc();
    }
}

/// Record current pending queue depth
pub fn set_queue_depth(depth: i64) {
    if let Some(metrics) = ENGINE_METRICS.get() {
        metrics.queue_depth.set(depth as f64);
    }
}

/// Render all registered metrics in Prometheus text format
pub fn gather() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
