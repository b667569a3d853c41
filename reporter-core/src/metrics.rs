//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring ingestion.
//! Collectors live in the handle's own [`Registry`]; nothing is registered
//! globally, so several handles can coexist in one process.
//!
//! # Metrics
//!
//! - `reporter_blocks_scanned_total` - Blocks emitted by the scanner
//! - `reporter_backoff_total` - Waits for a height that is not produced yet
//! - `reporter_scan_height` - Height currently being fetched
//! - `reporter_blocks_applied_total` - Blocks merged into the ledger
//! - `reporter_block_addresses` - Histogram of addresses touched per block
//! - `reporter_apply_duration_seconds` - Histogram of block apply latencies

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Blocks emitted by the scanner
    pub blocks_scanned: IntCounter,

    /// Backoff waits
    pub backoff_total: IntCounter,

    /// Height currently being fetched
    pub scan_height: IntGauge,

    /// Blocks applied to the ledger
    pub blocks_applied: IntCounter,

    /// Addresses touched per block
    pub block_addresses: Histogram,

    /// Apply duration histogram
    pub apply_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let blocks_scanned = IntCounter::new(
            "reporter_blocks_scanned_total",
            "Blocks emitted by the scanner",
        )?;
        registry.register(Box::new(blocks_scanned.clone()))?;

        let backoff_total = IntCounter::new(
            "reporter_backoff_total",
            "Waits for a height that is not produced yet",
        )?;
        registry.register(Box::new(backoff_total.clone()))?;

        let scan_height = IntGauge::new("reporter_scan_height", "Height currently being fetched")?;
        registry.register(Box::new(scan_height.clone()))?;

        let blocks_applied = IntCounter::new(
            "reporter_blocks_applied_total",
            "Blocks merged into the ledger",
        )?;
        registry.register(Box::new(blocks_applied.clone()))?;

        let block_addresses = Histogram::with_opts(
            HistogramOpts::new("reporter_block_addresses", "Addresses touched per block")
                .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]),
        )?;
        registry.register(Box::new(block_addresses.clone()))?;

        let apply_duration = Histogram::with_opts(
            HistogramOpts::new("reporter_apply_duration_seconds", "Block apply latencies")
                .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(apply_duration.clone()))?;

        Ok(Self {
            blocks_scanned,
            backoff_total,
            scan_height,
            blocks_applied,
            block_addresses,
            apply_duration,
            registry,
        })
    }

    /// Record a block handed to consumers
    pub fn record_block_scanned(&self, height: u64) {
        self.blocks_scanned.inc();
        self.scan_height.set(height as i64);
    }

    /// Record a backoff wait
    pub fn record_backoff(&self) {
        self.backoff_total.inc();
    }

    /// Record a block merged into the ledger
    pub fn record_block_applied(&self, addresses: usize, duration_seconds: f64) {
        self.blocks_applied.inc();
        self.block_addresses.observe(addresses as f64);
        self.apply_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Snapshot of all metrics in Prometheus text format
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
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
        assert_eq!(metrics.blocks_scanned.get(), 0);
        assert_eq!(metrics.blocks_applied.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_backoff();
        assert_eq!(first.backoff_total.get(), 1);
        assert_eq!(second.backoff_total.get(), 0);
    }

    #[test]
    fn test_record_block_scanned() {
        let metrics = Metrics::new().unwrap();
        metrics.record_block_scanned(41);
        metrics.record_block_scanned(42);
        assert_eq!(metrics.blocks_scanned.get(), 2);
        assert_eq!(metrics.scan_height.get(), 42);
    }

    #[test]
    fn test_record_block_applied() {
        let metrics = Metrics::new().unwrap();
        metrics.record_block_applied(3, 0.002);
        assert_eq!(metrics.blocks_applied.get(), 1);
        assert_eq!(metrics.block_addresses.get_sample_count(), 1);
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_encode_text() {
        let metrics = Metrics::new().unwrap();
        metrics.record_block_scanned(7);
        metrics.record_backoff();

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("reporter_scan_height 7"));
        assert!(text.contains("reporter_backoff_total 1"));
        assert!(text.contains("# TYPE reporter_apply_duration_seconds histogram"));
    }
}
