use std::time::Duration;

use crate::traits::MetricsSink;

pub const JOBS_PROCESSED: &str = "jobs_processed";
pub const JOBS_FAILED: &str = "jobs_failed";
pub const JOBS_RATE_LIMITED: &str = "jobs_rate_limited";
pub const JOBS_RETRIED: &str = "jobs_retried";
pub const SCRAPE_DURATION: &str = "scrape_duration";

/// Metrics sink that emits each sample as a `tracing` event.
///
/// Events go to the `harvest::metrics` target so they can be filtered or
/// routed separately from lifecycle logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, metric: &str, class: &str) {
        tracing::debug!(target: "harvest::metrics", metric, class, "counter");
    }

    fn observe(&self, metric: &str, class: &str, value: Duration) {
        tracing::debug!(
            target: "harvest::metrics",
            metric,
            class,
            value_ms = value.as_millis() as u64,
            "histogram"
        );
    }
}
