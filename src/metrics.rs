//! Metrics for observability.
//!
//! Recorded through the `metrics` facade; install any recorder (Prometheus
//! exporter, debugging recorder) to collect them. Without a recorder every
//! call is a no-op.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `relay_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! # Usage
//!
//! ```rust,no_run
//! use registry_relay::metrics;
//! use std::time::Duration;
//!
//! metrics::record_delivery("registry-events");
//! metrics::record_lookup(Duration::from_millis(120), true);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

fn status(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

// =============================================================================
// Consumer Metrics
// =============================================================================

/// Gauge for consumer lifecycle state.
pub fn record_consumer_state(stream: &str, state: &str) {
    // Numeric so alerts can fire on "not consuming for N minutes"
    let value = match state {
        "Disconnected" => 0.0,
        "Connecting" => 1.0,
        "Retrying" => 2.0,
        "Subscribed" => 3.0,
        "Consuming" => 4.0,
        "Draining" => 5.0,
        "Closed" => 6.0,
        _ => -1.0,
    };
    gauge!("relay_consumer_state", "stream" => stream.to_string()).set(value);
}

/// Record a connect/subscribe attempt.
pub fn record_setup_attempt(stream: &str, success: bool) {
    counter!(
        "relay_consumer_setup_attempts_total",
        "stream" => stream.to_string(),
        "status" => status(success)
    )
    .increment(1);
}

pub fn record_delivery(stream: &str) {
    counter!("relay_deliveries_total", "stream" => stream.to_string()).increment(1);
}

// =============================================================================
// Checkpoint Metrics
// =============================================================================

pub fn record_checkpoint_commit(stream: &str, success: bool) {
    counter!(
        "relay_checkpoint_commits_total",
        "stream" => stream.to_string(),
        "status" => status(success)
    )
    .increment(1);
}

/// Record a retried checkpoint store operation.
pub fn checkpoint_store_retries_total(operation: &str) {
    counter!("relay_checkpoint_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Dispatch Metrics
// =============================================================================

/// Record the outcome of handling one delivery (dispatched, ignored, failed).
pub fn record_dispatch(outcome: &str) {
    counter!("relay_dispatch_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a repeated lookup + sink attempt for one event.
pub fn record_dispatch_retry() {
    counter!("relay_dispatch_retries_total").increment(1);
}

/// Record an entity lookup round trip.
pub fn record_lookup(duration: Duration, success: bool) {
    counter!("relay_lookups_total", "status" => status(success)).increment(1);
    histogram!("relay_lookup_duration_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Initial Population Metrics
// =============================================================================

/// Running totals for the current initial population run.
pub fn record_population_progress(forwarded: u64, failed: u64) {
    gauge!("relay_population_forwarded").set(forwarded as f64);
    gauge!("relay_population_failed").set(failed as f64);
}
