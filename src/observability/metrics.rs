//! Metrics collection and exposition.
//!
//! # Metrics
//! - `engine_test_sessions_total` (counter): sessions by outcome
//! - `engine_active_test_sessions` (gauge): sessions currently running
//! - `engine_probe_delay_ms` (histogram): observed proxy delays
//! - `engine_delay_cache_lookups_total` (counter): cache hits and misses
//! - `engine_state_publishes_total` (counter): group records replaced, by cause
//! - `engine_runtime_errors_total` (counter): failed runtime calls, by operation
//! - `engine_group_resorts_total` (counter): debounced delay re-sorts

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder with an HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

/// Record how a test session ended.
pub fn record_session(outcome: &'static str) {
    counter!("engine_test_sessions_total", "outcome" => outcome).increment(1);
}

/// Record the number of sessions currently running.
pub fn record_active_sessions(count: usize) {
    gauge!("engine_active_test_sessions").set(count as f64);
}

/// Record a known probe delay.
pub fn record_delay(delay_ms: i32) {
    if delay_ms > 0 {
        histogram!("engine_probe_delay_ms").record(f64::from(delay_ms));
    }
}

/// Record a delay cache lookup.
pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("engine_delay_cache_lookups_total", "result" => result).increment(1);
}

/// Record a group state replacement.
pub fn record_publish(cause: &'static str) {
    counter!("engine_state_publishes_total", "cause" => cause).increment(1);
}

/// Record a failed call to the proxy runtime.
pub fn record_runtime_error(operation: &'static str) {
    counter!("engine_runtime_errors_total", "operation" => operation).increment(1);
}

/// Record a debounced delay re-sort.
pub fn record_resort() {
    counter!("engine_group_resorts_total").increment(1);
}
