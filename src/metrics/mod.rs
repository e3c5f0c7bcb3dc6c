//! Metrics module
//!
//! Prometheus counters for authentication, authorization and responses.
//! Everything registers in the default registry; [`render`] exposes it in
//! the text exposition format.
//!
//! Counter recording follows the process-wide switch set by [`set_enabled`]
//! (`metrics.enabled` in the config file). The active-contexts gauge is
//! always tracked so its increments and decrements stay paired.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_int_gauge, CounterVec, Encoder, IntGauge, TextEncoder,
};
use std::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);

lazy_static! {
    // Authentication metrics
    pub static ref AUTH_ATTEMPTS: CounterVec = register_counter_vec!(
        "gatekeep_auth_attempts_total",
        "Authentication attempts by credential method and outcome",
        &["method", "outcome"]
    ).unwrap();

    // Authorization metrics
    pub static ref ACCESS_DECISIONS: CounterVec = register_counter_vec!(
        "gatekeep_access_decisions_total",
        "Access decisions by outcome",
        &["outcome"]  // "granted", "access_denied" or "unauthenticated"
    ).unwrap();

    // Pipeline metrics
    pub static ref RESPONSES_TOTAL: CounterVec = register_counter_vec!(
        "gatekeep_responses_total",
        "Responses produced by the filter pipeline",
        &["status"]
    ).unwrap();

    pub static ref ACTIVE_CONTEXTS: IntGauge = register_int_gauge!(
        "gatekeep_active_security_contexts",
        "Security contexts currently open"
    ).unwrap();
}

/// Turn counter recording on or off for the whole process
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Record an authentication attempt
///
/// `outcome` is `"success"` or the failure kind, e.g. `"expired_token"`.
pub fn record_auth_attempt(method: &str, outcome: &str) {
    if !is_enabled() {
        return;
    }
    AUTH_ATTEMPTS.with_label_values(&[method, outcome]).inc();
}

/// Record an access decision
pub fn record_access_decision(outcome: &str) {
    if !is_enabled() {
        return;
    }
    ACCESS_DECISIONS.with_label_values(&[outcome]).inc();
}

/// Record the status code of a pipeline response
pub fn record_response(status: u16) {
    if !is_enabled() {
        return;
    }
    RESPONSES_TOTAL
        .with_label_values(&[&status.to_string()])
        .inc();
}

/// Render all registered metrics in Prometheus text format
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
