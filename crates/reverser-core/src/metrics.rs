//! Prometheus metrics registry.
//!
//! One `Metrics` is constructed at startup and threaded through every
//! component that records against it; there is no global/static registry.

use std::time::Duration;

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};

pub struct Metrics {
    registry: Registry,
    events_received: IntCounter,
    events_processed: IntCounter,
    git_operations: IntCounterVec,
    git_push_duration_seconds: Histogram,
    git_commit_queue_size: IntGaugeVec,
    correlation_evictions: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_received =
            IntCounter::new("events_received", "Watch events observed from the cluster").unwrap();
        let events_processed = IntCounter::new(
            "events_processed",
            "Watch events that produced a committed Git change",
        )
        .unwrap();
        let git_operations = IntCounterVec::new(
            Opts::new("git_operations", "Git CLI invocations by outcome"),
            &["outcome"],
        )
        .unwrap();
        let git_push_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "git_push_duration_seconds",
            "Wall-clock duration of a commit+push cycle",
        ))
        .unwrap();
        let git_commit_queue_size = IntGaugeVec::new(
            Opts::new("git_commit_queue_size", "Pending envelopes per branch worker"),
            &["repo_ref", "branch"],
        )
        .unwrap();
        let correlation_evictions = IntCounter::new(
            "correlation_evictions",
            "Correlation Store entries evicted before being consumed",
        )
        .unwrap();

        registry.register(Box::new(events_received.clone())).unwrap();
        registry.register(Box::new(events_processed.clone())).unwrap();
        registry.register(Box::new(git_operations.clone())).unwrap();
        registry.register(Box::new(git_push_duration_seconds.clone())).unwrap();
        registry.register(Box::new(git_commit_queue_size.clone())).unwrap();
        registry.register(Box::new(correlation_evictions.clone())).unwrap();

        Self {
            registry,
            events_received,
            events_processed,
            git_operations,
            git_push_duration_seconds,
            git_commit_queue_size,
            correlation_evictions,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn inc_events_received(&self, count: u64) {
        self.events_received.inc_by(count);
    }

    pub fn inc_events_processed(&self, count: u64) {
        self.events_processed.inc_by(count);
    }

    pub fn inc_git_operations(&self) {
        self.git_operations.with_label_values(&["success"]).inc();
    }

    pub fn inc_git_operations_failed(&self) {
        self.git_operations.with_label_values(&["failure"]).inc();
    }

    pub fn observe_git_push_duration(&self, duration: Duration) {
        self.git_push_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn set_commit_queue_size(&self, repo_ref: &str, branch: &str, size: i64) {
        self.git_commit_queue_size
            .with_label_values(&[repo_ref, branch])
            .set(size);
    }

    pub fn inc_correlation_evictions(&self) {
        self.correlation_evictions.inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = Metrics::new();
        assert_eq!(metrics.events_received.get(), 0);
    }

    #[test]
    fn inc_events_received_accumulates() {
        let metrics = Metrics::new();
        metrics.inc_events_received(3);
        metrics.inc_events_received(2);
        assert_eq!(metrics.events_received.get(), 5);
    }

    #[test]
    fn commit_queue_gauge_is_labeled_per_branch() {
        let metrics = Metrics::new();
        metrics.set_commit_queue_size("repo-1", "main", 4);
        metrics.set_commit_queue_size("repo-1", "dev", 1);
        assert_eq!(
            metrics
                .git_commit_queue_size
                .with_label_values(&["repo-1", "main"])
                .get(),
            4
        );
        assert_eq!(
            metrics
                .git_commit_queue_size
                .with_label_values(&["repo-1", "dev"])
                .get(),
            1
        );
    }

    #[test]
    fn registry_gathers_all_registered_metrics() {
        let metrics = Metrics::new();
        metrics.inc_correlation_evictions();
        let families = metrics.registry.gather();
        assert!(families.iter().any(|f| f.get_name() == "correlation_evictions"));
    }
}
