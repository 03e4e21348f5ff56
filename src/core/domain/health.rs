//! Source health tracking types.

use serde::Serialize;

/// Health bookkeeping for one exchange source, kept for the process
/// lifetime and mutated only by the failover controller.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source_id: String,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_health_check_ms: i64,
    /// Exponential moving average of observed probe latency.
    pub average_latency_ms: f64,
}

impl SourceHealth {
    #[must_use]
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            is_healthy: true,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_health_check_ms: 0,
            average_latency_ms: 0.0,
        }
    }

    /// Fold a latency sample into the moving average (alpha 0.2).
    pub fn record_latency(&mut self, latency_ms: f64) {
        const ALPHA: f64 = 0.2;
        self.average_latency_ms = if self.average_latency_ms == 0.0 {
            latency_ms
        } else {
            ALPHA * latency_ms + (1.0 - ALPHA) * self.average_latency_ms
        };
    }
}

/// Connection summary across all registered sources.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub total_sources: usize,
    pub connected_sources: usize,
    pub average_latency_ms: f64,
    pub failed_sources: Vec<String>,
    /// `100 · healthy / total`, or 100 when no sources are registered.
    pub health_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_ema_seeds_from_first_sample() {
        let mut health = SourceHealth::new("binance");
        health.record_latency(100.0);
        assert!((health.average_latency_ms - 100.0).abs() < f64::EPSILON);

        health.record_latency(200.0);
        assert!((health.average_latency_ms - 120.0).abs() < 1e-9);
    }
}
