//! Process-wide metrics registry.
//!
//! The source publishes allocation/utilization figures to CloudWatch
//! (`_publish_allocation_metrics`, `_publish_capacity_metric`,
//! `_publish_failure_metric`); this crate has no CloudWatch client to call,
//! so the same figures are exposed as `prometheus` gauges/counters/
//! histograms at a single registry constructed at startup and threaded into
//! the components that need it, rather than a process-global. Publication
//! never fails an operation: every recording call here is infallible.

use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry};

pub struct Metrics {
    pub registry: Registry,
    /// Per-tier utilization percent (0-100), feeding the same autoscaling
    /// alarms the source's CloudWatch metric does.
    pub tier_utilization_percent: IntGaugeVec,
    /// Per-tier count of active databases.
    pub tier_database_count: IntGaugeVec,
    /// Per-tier allocation failures, labeled by reason.
    pub allocation_failures_total: IntCounterVec,
    /// Per-backend-client circuit breaker open state (0/1), labeled by
    /// instance id.
    pub circuit_breaker_open: IntGaugeVec,
    /// Per-connection-pool request/failure counters, labeled by base url.
    pub pool_requests_total: IntCounterVec,
    pub pool_failures_total: IntCounterVec,
    /// SSE monitoring session duration, labeled by task type.
    pub sse_session_duration_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let tier_utilization_percent = IntGaugeVec::new(
            Opts::new(
                "graph_tier_utilization_percent",
                "Percent of per-tier instance capacity in use",
            ),
            &["tier"],
        )
        .expect("valid metric");

        let tier_database_count = IntGaugeVec::new(
            Opts::new("graph_tier_database_count", "Active databases per tier"),
            &["tier"],
        )
        .expect("valid metric");

        let allocation_failures_total = IntCounterVec::new(
            Opts::new(
                "graph_allocation_failures_total",
                "Allocation attempts that failed, by reason",
            ),
            &["tier", "reason"],
        )
        .expect("valid metric");

        let circuit_breaker_open = IntGaugeVec::new(
            Opts::new(
                "graph_circuit_breaker_open",
                "1 if the circuit breaker for this target is open",
            ),
            &["target"],
        )
        .expect("valid metric");

        let pool_requests_total = IntCounterVec::new(
            Opts::new("graph_pool_requests_total", "Requests issued per connection pool"),
            &["base_url"],
        )
        .expect("valid metric");

        let pool_failures_total = IntCounterVec::new(
            Opts::new("graph_pool_failures_total", "Failed requests per connection pool"),
            &["base_url"],
        )
        .expect("valid metric");

        let sse_session_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "graph_sse_session_duration_seconds",
            "Duration of an SSE task-monitoring session",
        ))
        .expect("valid metric");

        for collector in [
            Box::new(tier_utilization_percent.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(tier_database_count.clone()),
            Box::new(allocation_failures_total.clone()),
            Box::new(circuit_breaker_open.clone()),
            Box::new(pool_requests_total.clone()),
            Box::new(pool_failures_total.clone()),
        ] {
            registry.register(collector).expect("unique metric name");
        }
        registry
            .register(Box::new(sse_session_duration_seconds.clone()))
            .expect("unique metric name");

        Metrics {
            registry,
            tier_utilization_percent,
            tier_database_count,
            allocation_failures_total,
            circuit_breaker_open,
            pool_requests_total,
            pool_failures_total,
            sse_session_duration_seconds,
        }
    }

    pub fn record_allocation_failure(&self, tier: &str, reason: &str) {
        self.allocation_failures_total
            .with_label_values(&[tier, reason])
            .inc();
    }

    pub fn record_tier_capacity(&self, tier: &str, database_count: i64, utilization_percent: i64) {
        self.tier_database_count.with_label_values(&[tier]).set(database_count);
        self.tier_utilization_percent
            .with_label_values(&[tier])
            .set(utilization_percent);
    }

    pub fn set_circuit_breaker_open(&self, target: &str, open: bool) {
        self.circuit_breaker_open
            .with_label_values(&[target])
            .set(if open { 1 } else { 0 });
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_without_panicking() {
        let metrics = Metrics::new();
        metrics.record_allocation_failure("kuzu-standard", "no_capacity");
        metrics.record_tier_capacity("kuzu-standard", 10, 20);
        metrics.set_circuit_breaker_open("shared-master", true);
        let families = metrics.registry.gather();
        assert!(!families.is_empty());
    }
}
