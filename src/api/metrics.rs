//! Prometheus exposition for the metrics endpoint.
//!
//! Gauges are refreshed from live state at scrape time rather than on
//! every update, keeping the ingest hot path free of metric writes.

use prometheus::{Encoder, Gauge, IntGauge, Opts, Registry, TextEncoder};

use crate::core::manager::IngestStats;

pub struct Metrics {
    registry: Registry,
    pub updates_total: IntGauge,
    pub rejected_total: IntGauge,
    pub invalid_total: IntGauge,
    pub connected_sources: IntGauge,
    pub total_sources: IntGauge,
    pub health_score: Gauge,
    pub feeds_tracked: IntGauge,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();
        let updates_total = IntGauge::with_opts(Opts::new(
            "feedgate_updates_total",
            "Price updates received from all adapters",
        ))
        .expect("valid metric opts");
        let rejected_total = IntGauge::with_opts(Opts::new(
            "feedgate_updates_rejected_total",
            "Updates rejected by the ingest quality gate",
        ))
        .expect("valid metric opts");
        let invalid_total = IntGauge::with_opts(Opts::new(
            "feedgate_updates_invalid_total",
            "Updates that failed tier validation",
        ))
        .expect("valid metric opts");
        let connected_sources = IntGauge::with_opts(Opts::new(
            "feedgate_connected_sources",
            "Exchange connections currently open",
        ))
        .expect("valid metric opts");
        let total_sources = IntGauge::with_opts(Opts::new(
            "feedgate_total_sources",
            "Exchange sources registered",
        ))
        .expect("valid metric opts");
        let health_score = Gauge::with_opts(Opts::new(
            "feedgate_health_score",
            "Connection health score, 0 to 100",
        ))
        .expect("valid metric opts");
        let feeds_tracked = IntGauge::with_opts(Opts::new(
            "feedgate_feeds_tracked",
            "Feeds in the active catalog",
        ))
        .expect("valid metric opts");

        for collector in [&updates_total, &rejected_total, &invalid_total, &connected_sources, &total_sources, &feeds_tracked]
        {
            registry.register(Box::new(collector.clone())).expect("unique metric");
        }
        registry.register(Box::new(health_score.clone())).expect("unique metric");

        Self {
            registry,
            updates_total,
            rejected_total,
            invalid_total,
            connected_sources,
            total_sources,
            health_score,
            feeds_tracked,
        }
    }

    pub fn set_ingest_stats(&self, stats: &IngestStats) {
        self.updates_total.set(stats.updates_total as i64);
        self.rejected_total.set(stats.rejected_total as i64);
        self.invalid_total.set(stats.invalid_total as i64);
    }

    /// Render the registry in Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
