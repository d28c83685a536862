use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};

/// Consecutive invariant failures before the degraded flag trips.
const DEGRADED_THRESHOLD: u32 = 3;

/// Prometheus metrics for daemon health, served from /metrics.
///
/// All metrics use the "netmond" namespace.
pub struct HealthMetrics {
    registry: Registry,
    invariant_streak: AtomicU32,

    /// Sampler ticks that produced a stored batch.
    pub samples_collected: Counter,
    /// Sampler ticks skipped due to enumeration errors or timeouts.
    pub sampler_errors: Counter,
    /// Raw delta rows written.
    pub rows_written: Counter,
    /// Aggregate-then-prune scheduler passes.
    pub scheduler_runs: Counter,
    /// Rows deleted by retention, by tier.
    pub retention_deleted: CounterVec,
    /// Active-tab reports accepted.
    pub ingest_reports: Counter,
    /// Active-tab reports rejected by validation.
    pub ingest_rejected: Counter,
    /// Invariant violations observed.
    pub invariant_failures: Counter,
    /// Distinct application identities currently cached.
    pub apps_tracked: Gauge,
    /// Whether the daemon is in degraded mode (1=yes, 0=no).
    pub degraded: Gauge,
}

impl HealthMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let samples_collected = Counter::with_opts(
            Opts::new("samples_collected_total", "Sampler ticks stored.").namespace("netmond"),
        )?;
        let sampler_errors = Counter::with_opts(
            Opts::new(
                "sampler_errors_total",
                "Sampler ticks skipped due to errors or timeouts.",
            )
            .namespace("netmond"),
        )?;
        let rows_written = Counter::with_opts(
            Opts::new("rows_written_total", "Raw delta rows written.").namespace("netmond"),
        )?;
        let scheduler_runs = Counter::with_opts(
            Opts::new("scheduler_runs_total", "Aggregate-then-prune passes.").namespace("netmond"),
        )?;
        let retention_deleted = CounterVec::new(
            Opts::new("retention_deleted_total", "Rows deleted by retention.")
                .namespace("netmond"),
            &["tier"],
        )?;
        let ingest_reports = Counter::with_opts(
            Opts::new("ingest_reports_total", "Active-tab reports accepted.").namespace("netmond"),
        )?;
        let ingest_rejected = Counter::with_opts(
            Opts::new(
                "ingest_rejected_total",
                "Active-tab reports rejected by validation.",
            )
            .namespace("netmond"),
        )?;
        let invariant_failures = Counter::with_opts(
            Opts::new("invariant_failures_total", "Invariant violations observed.")
                .namespace("netmond"),
        )?;
        let apps_tracked = Gauge::with_opts(
            Opts::new("apps_tracked", "Distinct application identities cached.")
                .namespace("netmond"),
        )?;
        let degraded = Gauge::with_opts(
            Opts::new("degraded", "Daemon degraded mode (1=yes, 0=no).").namespace("netmond"),
        )?;

        registry.register(Box::new(samples_collected.clone()))?;
        registry.register(Box::new(sampler_errors.clone()))?;
        registry.register(Box::new(rows_written.clone()))?;
        registry.register(Box::new(scheduler_runs.clone()))?;
        registry.register(Box::new(retention_deleted.clone()))?;
        registry.register(Box::new(ingest_reports.clone()))?;
        registry.register(Box::new(ingest_rejected.clone()))?;
        registry.register(Box::new(invariant_failures.clone()))?;
        registry.register(Box::new(apps_tracked.clone()))?;
        registry.register(Box::new(degraded.clone()))?;

        Ok(Self {
            registry,
            invariant_streak: AtomicU32::new(0),
            samples_collected,
            sampler_errors,
            rows_written,
            scheduler_runs,
            retention_deleted,
            ingest_reports,
            ingest_rejected,
            invariant_failures,
            apps_tracked,
            degraded,
        })
    }

    /// Records an invariant failure. Repeated failures trip the degraded
    /// flag, observable via /healthz.
    pub fn record_invariant_failure(&self) {
        self.invariant_failures.inc();
        let streak = self.invariant_streak.fetch_add(1, Ordering::SeqCst) + 1;
        if streak >= DEGRADED_THRESHOLD {
            self.degraded.set(1.0);
        }
    }

    /// Records a successful unit of work, clearing the failure streak.
    pub fn record_unit_success(&self) {
        self.invariant_streak.store(0, Ordering::SeqCst);
        self.degraded.set(0.0);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.get() >= 1.0
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_trips_after_streak() {
        let health = HealthMetrics::new().expect("metrics");
        assert!(!health.is_degraded());

        health.record_invariant_failure();
        health.record_invariant_failure();
        assert!(!health.is_degraded());

        health.record_invariant_failure();
        assert!(health.is_degraded());
    }

    #[test]
    fn test_success_clears_streak() {
        let health = HealthMetrics::new().expect("metrics");
        health.record_invariant_failure();
        health.record_invariant_failure();
        health.record_unit_success();
        health.record_invariant_failure();
        health.record_invariant_failure();
        assert!(!health.is_degraded(), "streak restarts after a success");
    }

    #[test]
    fn test_encode_contains_namespace() {
        let health = HealthMetrics::new().expect("metrics");
        health.samples_collected.inc();
        let text = health.encode().expect("encode");
        assert!(text.contains("netmond_samples_collected_total"));
        assert!(text.contains("netmond_degraded"));
    }
}
