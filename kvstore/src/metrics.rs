//! Metrics collection module for the replicated key-value store
//!
//! This module provides functionality for collecting and exposing service metrics
//! using Prometheus.

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::time::Instant;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Counter for tracking request counts by method
    pub static ref REQ_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("request_counter", "request counter"), &["method"]).unwrap();

    /// Histogram for tracking method execution times
    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("method_cost", "method cost"),
        &["method"]
    )
    .unwrap();

    /// Counter for committed entries applied to the state table, by operation
    pub static ref APPLIED_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("applied_entries", "applied entries"), &["op"]).unwrap();

    /// Counter for snapshots captured and restored
    pub static ref SNAPSHOT_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("snapshot_counter", "snapshot counter"), &["kind"]).unwrap();
}

/// Initializes the metrics registry
///
/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(APPLIED_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SNAPSHOT_COUNTER_VEC.clone()));
}

/// Records metrics for an async operation
///
/// Increments the request counter for `method_name`, runs `handler` and
/// records how long it took.
pub async fn record_metrics<F, Fut, T>(method_name: &str, handler: F) -> T
where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = T> + Send,
{
    let start = Instant::now();
    REQ_COUNTER_VEC.with_label_values(&[method_name]).inc();
    let result = handler().await;

    let elapsed = start.elapsed();
    METHOD_HISTOGRAM_VEC
        .with_label_values(&[method_name])
        .observe(elapsed.as_secs_f64());

    result
}
