//! Prometheus metrics for feed cycles
//!
//! This module tracks, per schedule:
//! - Cycles completed and their duration
//! - Fetch units resolved and failed
//! - Stuck-cycle recoveries
//! - Items discovered
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all cycle metrics
struct CycleMetrics {
    cycles: CounterVec,
    cycle_duration: HistogramVec,
    cycle_failures: CounterVec,
    urls_fetched: CounterVec,
    stuck_recoveries: CounterVec,
    items_discovered: CounterVec,
    in_progress: GaugeVec,
}

/// Global storage for cycle metrics
static CYCLE_METRICS: OnceLock<CycleMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, subsequent metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = feedcycle::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = CycleMetrics {
        cycles: register_counter_vec!(
            "feedcycle_cycles_total",
            "Total finished cycles",
            &["schedule"]
        )?,
        cycle_duration: register_histogram_vec!(
            "feedcycle_cycle_duration_seconds",
            "Cycle duration in seconds",
            &["schedule"],
            vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
        )?,
        cycle_failures: register_counter_vec!(
            "feedcycle_cycle_failures_total",
            "Total fetch units that reported failure",
            &["schedule"]
        )?,
        urls_fetched: register_counter_vec!(
            "feedcycle_urls_fetched_total",
            "Total fetch units resolved",
            &["schedule"]
        )?,
        stuck_recoveries: register_counter_vec!(
            "feedcycle_stuck_recoveries_total",
            "Cycles started while the previous one was still running",
            &["schedule"]
        )?,
        items_discovered: register_counter_vec!(
            "feedcycle_items_discovered_total",
            "Total new items emitted",
            &["schedule"]
        )?,
        in_progress: register_gauge_vec!(
            "feedcycle_cycle_in_progress",
            "Whether a cycle is running (1 = yes, 0 = no)",
            &["schedule"]
        )?,
    };

    CYCLE_METRICS
        .set(metrics)
        .map_err(|_| "Cycle metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    CYCLE_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn gather_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a finished cycle
pub fn record_cycle(schedule: &str, duration_secs: f64, urls: usize, fails: usize) {
    let Some(m) = CYCLE_METRICS.get() else {
        return;
    };

    m.cycles.with_label_values(&[schedule]).inc();
    m.cycle_duration
        .with_label_values(&[schedule])
        .observe(duration_secs);

    if urls > 0 {
        m.urls_fetched
            .with_label_values(&[schedule])
            .inc_by(urls as f64);
    }
    if fails > 0 {
        m.cycle_failures
            .with_label_values(&[schedule])
            .inc_by(fails as f64);
    }
}

/// Record a stuck-cycle recovery
pub fn record_stuck_recovery(schedule: &str) {
    if let Some(m) = CYCLE_METRICS.get() {
        m.stuck_recoveries.with_label_values(&[schedule]).inc();
    }
}

/// Record one emitted item
pub fn record_item_discovered(schedule: &str) {
    if let Some(m) = CYCLE_METRICS.get() {
        m.items_discovered.with_label_values(&[schedule]).inc();
    }
}

/// Update the running flag of a schedule
pub fn set_in_progress(schedule: &str, running: bool) {
    if let Some(m) = CYCLE_METRICS.get() {
        m.in_progress
            .with_label_values(&[schedule])
            .set(if running { 1.0 } else { 0.0 });
    }
}

// ============================================================================
// Tests
// ============================================================================
