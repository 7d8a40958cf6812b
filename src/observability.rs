//! Metrics emission helpers.
//!
//! Thin wrappers over the `metrics` facade so call sites stay one-liners
//! and metric names live in one place. Hosts choose the recorder; without
//! one installed these are no-ops.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// A navigation entered the pipeline.
pub fn record_navigation_started(kind: &'static str) {
    counter!("router_navigations_total", "kind" => kind).increment(1);
}

/// A navigation reached its terminal state.
pub fn record_navigation_completed(outcome: &'static str, elapsed: Duration) {
    counter!("router_navigation_outcomes_total", "outcome" => outcome).increment(1);
    histogram!("router_navigation_duration_seconds", "outcome" => outcome)
        .record(elapsed.as_secs_f64());
}

/// A loader or action settled.
pub fn record_data_call(kind: &'static str, outcome: &'static str, elapsed: Duration) {
    counter!("router_data_calls_total", "kind" => kind, "outcome" => outcome).increment(1);
    histogram!("router_data_call_duration_seconds", "kind" => kind).record(elapsed.as_secs_f64());
}

/// A navigation was replaced before settling.
pub fn record_navigation_superseded() {
    counter!("router_navigation_outcomes_total", "outcome" => "superseded").increment(1);
}

/// A redirect is being chased.
pub fn record_redirect() {
    counter!("router_redirects_total").increment(1);
}

/// A lazy route module finished resolving.
pub fn record_lazy_resolution(outcome: &'static str) {
    counter!("router_lazy_resolutions_total", "outcome" => outcome).increment(1);
}

/// Track the live fetch-controller population.
pub fn record_fetch_controllers(count: usize) {
    gauge!("router_fetch_controllers").set(count as f64);
}

/// A fetcher call entered the pipeline.
pub fn record_fetch_started(kind: &'static str) {
    counter!("router_fetches_total", "kind" => kind).increment(1);
}
