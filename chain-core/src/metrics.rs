//! Metrics collection for observability
//!
//! Prometheus collectors for monitoring the chain core.
//!
//! # Metrics
//!
//! - `chain_blocks_total` - Total blocks appended
//! - `chain_append_duration_seconds` - Histogram of append critical-section latencies
//! - `chain_lock_write_acquisitions_total` - Write-lock acquisitions
//! - `chain_lock_read_acquisitions_total` - Read-lock acquisitions
//! - `chain_optimistic_retries_total` - Optimistic reads that fell back to the read lock
//! - `chain_recovery_attempts_total` - Recovery attempts
//! - `chain_rollback_blocks_removed` - Blocks removed by the last rollback

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Total blocks appended
    pub blocks_total: IntCounter,

    /// Append critical-section duration histogram
    pub append_duration: Histogram,

    /// Write-lock acquisitions
    pub lock_write_acquisitions: IntCounter,

    /// Read-lock acquisitions
    pub lock_read_acquisitions: IntCounter,

    /// Optimistic reads that failed validation and retried under the read lock
    pub optimistic_retries: IntCounter,

    /// Recovery attempts
    pub recovery_attempts: IntCounter,

    /// Blocks removed by the last rollback
    pub rollback_blocks_removed: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with a private registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let blocks_total =
            IntCounter::with_opts(Opts::new("chain_blocks_total", "Total blocks appended"))?;
        registry.register(Box::new(blocks_total.clone()))?;

        let append_duration = Histogram::with_opts(
            HistogramOpts::new(
                "chain_append_duration_seconds",
                "Histogram of append critical-section latencies",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100]),
        )?;
        registry.register(Box::new(append_duration.clone()))?;

        let lock_write_acquisitions = IntCounter::with_opts(Opts::new(
            "chain_lock_write_acquisitions_total",
            "Write-lock acquisitions",
        ))?;
        registry.register(Box::new(lock_write_acquisitions.clone()))?;

        let lock_read_acquisitions = IntCounter::with_opts(Opts::new(
            "chain_lock_read_acquisitions_total",
            "Read-lock acquisitions",
        ))?;
        registry.register(Box::new(lock_read_acquisitions.clone()))?;

        let optimistic_retries = IntCounter::with_opts(Opts::new(
            "chain_optimistic_retries_total",
            "Optimistic reads retried under the read lock",
        ))?;
        registry.register(Box::new(optimistic_retries.clone()))?;

        let recovery_attempts = IntCounter::with_opts(Opts::new(
            "chain_recovery_attempts_total",
            "Recovery attempts",
        ))?;
        registry.register(Box::new(recovery_attempts.clone()))?;

        let rollback_blocks_removed = IntGauge::with_opts(Opts::new(
            "chain_rollback_blocks_removed",
            "Blocks removed by the last rollback",
        ))?;
        registry.register(Box::new(rollback_blocks_removed.clone()))?;

        Ok(Self {
            blocks_total,
            append_duration,
            lock_write_acquisitions,
            lock_read_acquisitions,
            optimistic_retries,
            recovery_attempts,
            rollback_blocks_removed,
            registry,
        })
    }

    /// Record a block append with its critical-section duration
    pub fn record_append(&self, duration_seconds: f64) {
        self.blocks_total.inc();
        self.append_duration.observe(duration_seconds);
    }

    /// Record a write-lock acquisition
    pub fn record_write_acquisition(&self) {
        self.lock_write_acquisitions.inc();
    }

    /// Record a read-lock acquisition
    pub fn record_read_acquisition(&self) {
        self.lock_read_acquisitions.inc();
    }

    /// Record an optimistic read falling back to the read lock
    pub fn record_optimistic_retry(&self) {
        self.optimistic_retries.inc();
    }

    /// Record a recovery attempt
    pub fn record_recovery_attempt(&self) {
        self.recovery_attempts.inc();
    }

    /// Record the size of the last rollback
    pub fn record_rollback(&self, blocks_removed: u64) {
        self.rollback_blocks_removed.set(blocks_removed as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.blocks_total.get(), 0);
        assert_eq!(metrics.recovery_attempts.get(), 0);
    }

    #[test]
    fn test_record_append() {
        let metrics = Metrics::new().unwrap();
        metrics.record_append(0.002);
        metrics.record_append(0.004);
        assert_eq!(metrics.blocks_total.get(), 2);
    }

    #[test]
    fn test_record_lock_traffic() {
        let metrics = Metrics::new().unwrap();
        metrics.record_write_acquisition();
        metrics.record_read_acquisition();
        metrics.record_optimistic_retry();
        assert_eq!(metrics.lock_write_acquisitions.get(), 1);
        assert_eq!(metrics.lock_read_acquisitions.get(), 1);
        assert_eq!(metrics.optimistic_retries.get(), 1);
    }

    #[test]
    fn test_record_rollback() {
        let metrics = Metrics::new().unwrap();
        metrics.record_rollback(3);
        assert_eq!(metrics.rollback_blocks_removed.get(), 3);
    }
}
