//! Prometheus metrics for storeconverge.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`
//! and defines metric name constants.  Library code records through the
//! `metrics` macros unconditionally; without an installed recorder those
//! calls are no-ops.

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing::warn;

// -- Metric name constants ----------------------------------------------------

/// Total remote API calls (counter). Labels: api, operation, outcome.
pub const REMOTE_CALLS_TOTAL: &str = "storeconverge_remote_calls_total";

/// Total attempts made by retry loops (counter).
pub const RETRY_ATTEMPTS_TOTAL: &str = "storeconverge_retry_attempts_total";

/// Retry loops that hit their deadline and made the final attempt (counter).
pub const RETRY_DEADLINE_ESCAPES_TOTAL: &str = "storeconverge_retry_deadline_escapes_total";

/// Object versions and delete markers removed while emptying (counter).
pub const OBJECT_VERSIONS_DELETED_TOTAL: &str = "storeconverge_object_versions_deleted_total";

/// Legal holds cleared to let a forced delete through (counter).
pub const LEGAL_HOLDS_CLEARED_TOTAL: &str = "storeconverge_legal_holds_cleared_total";

/// Finished reconciler operations (counter). Labels: kind, operation, outcome.
pub const RECONCILE_TOTAL: &str = "storeconverge_reconcile_total";

/// Reconciler operation duration in seconds (histogram). Labels: kind, operation.
pub const RECONCILE_DURATION_SECONDS: &str = "storeconverge_reconcile_duration_seconds";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests).  Returns `None` when another recorder is
/// already installed by someone else.
pub fn init_metrics() -> Option<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Some(handle);
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = PROMETHEUS_HANDLE.set(handle);
        }
        Err(e) => warn!("Prometheus recorder not installed: {e}"),
    }
    PROMETHEUS_HANDLE.get()
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(REMOTE_CALLS_TOTAL, "Total remote API calls by API and operation");
    describe_counter!(RETRY_ATTEMPTS_TOTAL, "Total attempts made by retry loops");
    describe_counter!(
        RETRY_DEADLINE_ESCAPES_TOTAL,
        "Retry loops that reached their deadline and made one final attempt"
    );
    describe_counter!(
        OBJECT_VERSIONS_DELETED_TOTAL,
        "Object versions and delete markers deleted while emptying buckets"
    );
    describe_counter!(LEGAL_HOLDS_CLEARED_TOTAL, "Legal holds cleared by forced deletes");
    describe_counter!(RECONCILE_TOTAL, "Finished reconciler operations by outcome");
    describe_histogram!(
        RECONCILE_DURATION_SECONDS,
        "Reconciler operation duration in seconds"
    );
}

/// Render the current metrics in the Prometheus text format.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_share_prefix() {
        for name in [
            REMOTE_CALLS_TOTAL,
            RETRY_ATTEMPTS_TOTAL,
            RETRY_DEADLINE_ESCAPES_TOTAL,
            OBJECT_VERSIONS_DELETED_TOTAL,
            LEGAL_HOLDS_CLEARED_TOTAL,
            RECONCILE_TOTAL,
            RECONCILE_DURATION_SECONDS,
        ] {
            assert!(name.starts_with("storeconverge_"), "{name}");
        }
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        let first = init_metrics().map(|h| h as *const PrometheusHandle);
        let second = init_metrics().map(|h| h as *const PrometheusHandle);
        assert_eq!(first, second);
        describe_metrics();
        metrics::counter!(RETRY_ATTEMPTS_TOTAL).increment(1);
        if let Some(text) = render() {
            assert!(text.contains(RETRY_ATTEMPTS_TOTAL));
        }
    }
}
