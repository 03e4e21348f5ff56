//! Per-exchange consensus weights.
//!
//! Each source carries a base weight, a tier multiplier (tier-1 venues
//! get ~1.4, tier-2 get 1.0) and a reliability score. Unknown sources
//! fall back to a conservative default so a feed can still aggregate
//! with a mix of known and unknown venues.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

/// Weight parameters for one source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceWeight {
    pub base_weight: f64,
    pub tier_multiplier: f64,
    pub reliability_score: f64,
}

impl SourceWeight {
    /// Fallback for venues the table has never heard of.
    pub const UNKNOWN: Self =
        Self { base_weight: 0.05, tier_multiplier: 1.0, reliability_score: 0.7 };
}

fn builtin_weights() -> HashMap<String, SourceWeight> {
    [
        ("binance", SourceWeight { base_weight: 0.20, tier_multiplier: 1.4, reliability_score: 0.95 }),
        ("coinbase", SourceWeight { base_weight: 0.18, tier_multiplier: 1.4, reliability_score: 0.93 }),
        ("kraken", SourceWeight { base_weight: 0.15, tier_multiplier: 1.0, reliability_score: 0.90 }),
        ("okx", SourceWeight { base_weight: 0.12, tier_multiplier: 1.0, reliability_score: 0.88 }),
        ("bybit", SourceWeight { base_weight: 0.10, tier_multiplier: 1.0, reliability_score: 0.85 }),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Mutable weight table with an optimization hook.
///
/// The hook nudges each source's base weight within ±10% of its
/// configured value, scaled by how closely the source has tracked the
/// consensus median lately. Changes take effect on the next aggregation.
pub struct WeightTable {
    configured: HashMap<String, SourceWeight>,
    current: RwLock<HashMap<String, SourceWeight>>,
}

impl WeightTable {
    #[must_use]
    pub fn new() -> Self {
        let configured = builtin_weights();
        Self { current: RwLock::new(configured.clone()), configured }
    }

    /// Effective weights for one source; unknown sources get the default.
    #[must_use]
    pub fn weight(&self, source: &str) -> SourceWeight {
        self.current.read().get(source).copied().unwrap_or(SourceWeight::UNKNOWN)
    }

    /// Re-derive base weights from observed consensus deviation EMAs.
    ///
    /// `deviation_ema` maps source to its smoothed fractional deviation
    /// from the consensus median. A source tracking the median perfectly
    /// earns +10% base weight; one deviating by the threshold or more
    /// loses 10%.
    pub fn optimize(&self, deviation_ema: &HashMap<String, f64>, outlier_threshold: f64) {
        let mut current = self.current.write();
        for (source, configured) in &self.configured {
            let Some(deviation) = deviation_ema.get(source) else {
                continue;
            };
            let fit = 1.0 - (deviation / outlier_threshold).clamp(0.0, 1.0);
            let factor = 0.9 + 0.2 * fit;
            let entry = current.entry(source.clone()).or_insert(*configured);
            let next = configured.base_weight * factor;
            if (next - entry.base_weight).abs() > f64::EPSILON {
                debug!(source = %source, base_weight = next, "Adjusted source weight");
            }
            entry.base_weight = next;
        }
    }
}

impl Default for WeightTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_source_gets_default() {
        let table = WeightTable::new();
        let w = table.weight("mystery-exchange");
        assert_eq!(w, SourceWeight::UNKNOWN);
    }

    #[test]
    fn test_tier_one_outweighs_tier_two() {
        let table = WeightTable::new();
        let binance = table.weight("binance");
        let kraken = table.weight("kraken");
        assert!(binance.tier_multiplier > kraken.tier_multiplier);
        assert!(binance.base_weight > kraken.base_weight);
    }

    #[test]
    fn test_optimize_rewards_consensus_trackers() {
        let table = WeightTable::new();
        let before = table.weight("binance").base_weight;

        let mut deviations = HashMap::new();
        deviations.insert("binance".to_string(), 0.0);
        deviations.insert("kraken".to_string(), 0.5);
        table.optimize(&deviations, 0.12);

        let binance = table.weight("binance").base_weight;
        let kraken = table.weight("kraken").base_weight;
        assert!((binance - before * 1.1).abs() < 1e-12);
        assert!((kraken - 0.15 * 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_optimize_stays_within_ten_percent_of_configured() {
        let table = WeightTable::new();
        let mut deviations = HashMap::new();
        deviations.insert("binance".to_string(), 10.0);
        for _ in 0..5 {
            table.optimize(&deviations, 0.12);
        }
        // Repeated pessimistic rounds never compound below -10%.
        assert!((table.weight("binance").base_weight - 0.20 * 0.9).abs() < 1e-12);
    }
}
