//! Price update and aggregation result types.

use serde::{Deserialize, Serialize};

/// One normalized ticker observation from a single exchange.
///
/// Produced by an adapter, consumed by the validator and aggregator, and
/// kept only in bounded per-feed windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// Canonical feed name, e.g. `BTC/USD`.
    pub symbol: String,
    /// Exchange id that produced the update.
    pub source: String,
    /// Last trade or mid price; always positive and finite once validated.
    pub price: f64,
    /// Exchange-reported event time in epoch milliseconds.
    pub timestamp_ms: i64,
    /// 24h volume where the exchange reports one.
    pub volume: Option<f64>,
    /// Adapter-computed quality score in `[0, 1]`.
    pub confidence: f64,
}

impl PriceUpdate {
    /// Age of the update relative to `now_ms`, clamped at zero.
    #[must_use]
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.timestamp_ms).max(0)
    }
}

/// The consensus price for one feed at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPrice {
    pub symbol: String,
    pub price: f64,
    pub timestamp_ms: i64,
    /// Exchanges that contributed to the consensus; never empty.
    pub sources: Vec<String>,
    /// Overall quality in `[0, 1]`.
    pub confidence: f64,
    /// Agreement among contributing sources in `[0, 1]`.
    pub consensus_score: f64,
}

/// One volume report from a single exchange, kept in a bounded window
/// to answer time-ranged volume queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeObservation {
    pub source: String,
    pub volume: f64,
    pub timestamp_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_age_is_clamped_at_zero() {
        let update = PriceUpdate {
            symbol: "BTC/USD".into(),
            source: "binance".into(),
            price: 50_000.0,
            timestamp_ms: 1_000,
            volume: None,
            confidence: 0.9,
        };
        assert_eq!(update.age_ms(3_500), 2_500);
        assert_eq!(update.age_ms(500), 0);
    }
}
