//! Weighted-median consensus aggregation.
//!
//! Turns a bag of fresh, valid [`PriceUpdate`]s into one
//! [`AggregatedPrice`]. Each surviving update is weighted by its
//! source's base weight and tier multiplier, decayed exponentially with
//! age and scaled by its confidence; prices are IQR-trimmed (at five or
//! more points) before the weighted median is taken. Results are cached
//! for a few hundred milliseconds, keyed by feed and guarded by an input
//! hash so a hit can never serve a different update set.

mod cache;
mod weights;

pub use weights::{SourceWeight, WeightTable};

use std::collections::HashMap;

use dashmap::DashMap;
use tracing::debug;

use crate::core::domain::{AggregatedPrice, FeedId, PriceUpdate};
use crate::core::service::{system_clock, Clock};
use crate::error::{Error, Result};

use cache::{input_hash, AggregationCache};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Minimum distinct updates required for a consensus.
    pub min_sources: usize,
    /// Updates older than this never enter the consensus.
    pub max_staleness_ms: i64,
    /// Exponential age-decay factor per millisecond.
    pub lambda: f64,
    /// Fractional deviation at which the consensus score reaches zero.
    pub outlier_threshold: f64,
    pub cache_ttl_ms: i64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_sources: 2,
            max_staleness_ms: 1_500,
            lambda: 4e-5,
            outlier_threshold: 0.12,
            cache_ttl_ms: 300,
        }
    }
}

/// One weighted observation inside an aggregation.
#[derive(Debug, Clone)]
struct Point {
    source: String,
    price: f64,
    weight: f64,
    confidence: f64,
}

pub struct ConsensusAggregator {
    cfg: AggregatorConfig,
    weights: WeightTable,
    cache: AggregationCache,
    /// Smoothed fractional deviation from the consensus median, per
    /// source; feeds the weight-optimization hook.
    deviation_ema: DashMap<String, f64>,
    clock: Clock,
}

impl ConsensusAggregator {
    #[must_use]
    pub fn new(cfg: AggregatorConfig) -> Self {
        Self::with_clock(cfg, system_clock())
    }

    #[must_use]
    pub fn with_clock(cfg: AggregatorConfig, clock: Clock) -> Self {
        let cache = AggregationCache::new(cfg.cache_ttl_ms);
        Self {
            cfg,
            weights: WeightTable::new(),
            cache,
            deviation_ema: DashMap::new(),
            clock,
        }
    }

    /// Produce the consensus price for `feed` from `updates`.
    pub fn aggregate(&self, feed: &FeedId, updates: &[PriceUpdate]) -> Result<AggregatedPrice> {
        if updates.is_empty() {
            return Err(Error::InsufficientData { feed: feed.clone() });
        }
        let now_ms = (self.clock)();

        let valid: Vec<PriceUpdate> =
            updates.iter().filter(|u| self.fast_validate(u, now_ms)).cloned().collect();
        if valid.is_empty() {
            return Err(Error::NoValidData { feed: feed.clone() });
        }
        if valid.len() < self.cfg.min_sources {
            return Err(Error::InsufficientSources {
                feed: feed.clone(),
                got: valid.len(),
                need: self.cfg.min_sources,
            });
        }

        let key = feed.key();
        let hash = input_hash(&valid);
        if let Some(hit) = self.cache.get(&key, hash, now_ms) {
            return Ok(hit);
        }

        let mut points: Vec<Point> = valid
            .iter()
            .map(|u| {
                let w = self.weights.weight(&u.source);
                let decay = (-self.cfg.lambda * u.age_ms(now_ms) as f64).exp();
                Point {
                    source: u.source.clone(),
                    price: u.price,
                    weight: w.base_weight * w.tier_multiplier * decay * u.confidence,
                    confidence: u.confidence,
                }
            })
            .collect();

        let trimmed = trim_outliers(&mut points);
        if trimmed > 0 {
            debug!(feed = %feed, trimmed, "IQR trim removed outliers");
        }

        // Sorting by (price, source) makes the walk order, and therefore
        // the result, invariant to input permutation.
        points.sort_by(|a, b| {
            a.price
                .partial_cmp(&b.price)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source.cmp(&b.source))
        });

        let total_weight: f64 = points.iter().map(|p| p.weight).sum();
        let median = weighted_median(&points, total_weight);
        let consensus_score = self.consensus_score(&points, total_weight, median);
        let confidence = overall_confidence(&points, total_weight, consensus_score);

        let mut sources: Vec<String> = points.iter().map(|p| p.source.clone()).collect();
        sources.sort();
        sources.dedup();

        for point in &points {
            self.record_deviation(&point.source, (point.price - median).abs() / median);
        }

        let result = AggregatedPrice {
            symbol: feed.name.clone(),
            price: median,
            timestamp_ms: now_ms,
            sources,
            confidence,
            consensus_score,
        };
        self.cache.insert(key, result.clone(), hash, now_ms);
        Ok(result)
    }

    /// Run the weight-optimization hook; any change takes effect on the
    /// next aggregation.
    pub fn optimize_weights(&self) {
        let deviations: HashMap<String, f64> =
            self.deviation_ema.iter().map(|e| (e.key().clone(), *e.value())).collect();
        self.weights.optimize(&deviations, self.cfg.outlier_threshold);
    }

    #[must_use]
    pub fn cached_results(&self) -> usize {
        self.cache.len()
    }

    fn fast_validate(&self, update: &PriceUpdate, now_ms: i64) -> bool {
        update.price > 0.0
            && update.price.is_finite()
            && update.age_ms(now_ms) <= self.cfg.max_staleness_ms
            && (0.1..=1.0).contains(&update.confidence)
    }

    fn consensus_score(&self, points: &[Point], total_weight: f64, median: f64) -> f64 {
        if median <= f64::EPSILON || points.is_empty() {
            return 0.0;
        }
        let avg_deviation = if total_weight > 0.0 {
            points.iter().map(|p| p.weight * (p.price - median).abs() / median).sum::<f64>()
                / total_weight
        } else {
            points.iter().map(|p| (p.price - median).abs() / median).sum::<f64>()
                / points.len() as f64
        };
        (1.0 - avg_deviation / self.cfg.outlier_threshold).clamp(0.0, 1.0)
    }

    fn record_deviation(&self, source: &str, deviation: f64) {
        const ALPHA: f64 = 0.3;
        let mut entry = self.deviation_ema.entry(source.to_string()).or_insert(deviation);
        *entry = ALPHA * deviation + (1.0 - ALPHA) * *entry;
    }
}

/// IQR-trim points in place; returns how many were removed.
///
/// Below five points the sample is too small to fence, so nothing is
/// trimmed.
fn trim_outliers(points: &mut Vec<Point>) -> usize {
    if points.len() < 5 {
        return 0;
    }
    let mut prices: Vec<f64> = points.iter().map(|p| p.price).collect();
    prices.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let q1 = percentile(&prices, 0.25);
    let q3 = percentile(&prices, 0.75);
    let iqr = q3 - q1;
    let (lo, hi) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);

    let before = points.len();
    points.retain(|p| p.price >= lo && p.price <= hi);
    before - points.len()
}

/// Linear-interpolated percentile of a sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let fraction = position - lower as f64;
    if lower + 1 < sorted.len() {
        sorted[lower] + fraction * (sorted[lower + 1] - sorted[lower])
    } else {
        sorted[lower]
    }
}

/// Walk cumulative weight until it first reaches half the total; that
/// point's price is the weighted median. Zero total weight degrades to
/// the unweighted median.
fn weighted_median(points: &[Point], total_weight: f64) -> f64 {
    debug_assert!(!points.is_empty());
    if total_weight <= 0.0 {
        let n = points.len();
        return if n % 2 == 1 {
            points[n / 2].price
        } else {
            (points[n / 2 - 1].price + points[n / 2].price) / 2.0
        };
    }
    let half = total_weight / 2.0;
    let mut cumulative = 0.0;
    for point in points {
        cumulative += point.weight;
        if cumulative >= half {
            return point.price;
        }
    }
    points[points.len() - 1].price
}

/// `0.7 · weighted avg confidence + 0.3 · consensus + source-count bonus`.
fn overall_confidence(points: &[Point], total_weight: f64, consensus_score: f64) -> f64 {
    let weighted_confidence = if total_weight > 0.0 {
        points.iter().map(|p| p.weight * p.confidence).sum::<f64>() / total_weight
    } else {
        points.iter().map(|p| p.confidence).sum::<f64>() / points.len() as f64
    };
    let count_bonus = (0.04 * points.len() as f64).min(0.2);
    (0.7 * weighted_confidence + 0.3 * consensus_score + count_bonus).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::FeedCategory;
    use crate::core::service::ManualClock;

    const NOW: i64 = 1_700_000_000_000;

    fn feed() -> FeedId {
        FeedId::new(FeedCategory::Crypto, "BTC/USD").unwrap()
    }

    fn update(source: &str, price: f64, age_ms: i64, confidence: f64) -> PriceUpdate {
        PriceUpdate {
            symbol: "BTC/USD".into(),
            source: source.into(),
            price,
            timestamp_ms: NOW - age_ms,
            volume: None,
            confidence,
        }
    }

    fn aggregator() -> ConsensusAggregator {
        ConsensusAggregator::with_clock(AggregatorConfig::default(), ManualClock::new(NOW).as_clock())
    }

    #[test]
    fn test_two_close_sources_reach_consensus() {
        let agg = aggregator();
        let updates = vec![
            update("binance", 50_000.0, 50, 0.95),
            update("coinbase", 50_010.0, 60, 0.95),
        ];
        let result = agg.aggregate(&feed(), &updates).unwrap();
        assert!((49_990.0..=50_020.0).contains(&result.price));
        assert_eq!(result.sources, vec!["binance".to_string(), "coinbase".to_string()]);
        assert!(result.consensus_score > 0.95, "score {}", result.consensus_score);
        assert!(result.confidence > 0.9, "confidence {}", result.confidence);
    }

    #[test]
    fn test_empty_input_is_insufficient_data() {
        let agg = aggregator();
        assert!(matches!(agg.aggregate(&feed(), &[]), Err(Error::InsufficientData { .. })));
    }

    #[test]
    fn test_all_filtered_is_no_valid_data() {
        let agg = aggregator();
        let stale = vec![
            update("binance", 50_000.0, 5_000, 0.95),
            update("coinbase", 50_010.0, 6_000, 0.95),
        ];
        assert!(matches!(agg.aggregate(&feed(), &stale), Err(Error::NoValidData { .. })));
    }

    #[test]
    fn test_min_sources_boundary() {
        let agg = aggregator();

        let one = vec![update("binance", 50_000.0, 50, 0.95)];
        assert!(matches!(
            agg.aggregate(&feed(), &one),
            Err(Error::InsufficientSources { got: 1, need: 2, .. })
        ));

        let two = vec![
            update("binance", 50_000.0, 50, 0.95),
            update("coinbase", 50_005.0, 50, 0.95),
        ];
        assert!(agg.aggregate(&feed(), &two).is_ok());
    }

    #[test]
    fn test_low_confidence_updates_are_filtered() {
        let agg = aggregator();
        let updates = vec![
            update("binance", 50_000.0, 50, 0.05),
            update("coinbase", 50_005.0, 50, 0.95),
        ];
        assert!(matches!(
            agg.aggregate(&feed(), &updates),
            Err(Error::InsufficientSources { got: 1, .. })
        ));
    }

    #[test]
    fn test_iqr_trim_drops_far_outlier_at_five_points() {
        let agg = aggregator();
        let updates = vec![
            update("a", 49_990.0, 50, 0.9),
            update("b", 50_000.0, 50, 0.9),
            update("c", 50_005.0, 50, 0.9),
            update("d", 50_010.0, 50, 0.9),
            update("e", 60_000.0, 50, 0.9),
        ];
        let result = agg.aggregate(&feed(), &updates).unwrap();
        assert!(!result.sources.contains(&"e".to_string()), "outlier kept: {:?}", result.sources);
        assert!((result.price - 50_000.0).abs() < 20.0);
        assert!(result.consensus_score > 0.9, "score {}", result.consensus_score);
    }

    #[test]
    fn test_four_points_skip_trimming() {
        let agg = aggregator();
        let updates = vec![
            update("a", 49_990.0, 50, 0.9),
            update("b", 50_000.0, 50, 0.9),
            update("c", 50_005.0, 50, 0.9),
            update("d", 60_000.0, 50, 0.9),
        ];
        let result = agg.aggregate(&feed(), &updates).unwrap();
        // Below five points the outlier stays in the contributor set.
        assert!(result.sources.contains(&"d".to_string()));
    }

    #[test]
    fn test_unknown_source_mixes_with_known() {
        let agg = aggregator();
        let updates = vec![
            update("binance", 50_000.0, 50, 0.95),
            update("upstart-dex", 50_020.0, 50, 0.9),
        ];
        let result = agg.aggregate(&feed(), &updates).unwrap();
        assert_eq!(result.sources.len(), 2);
        // Known tier-1 weight dominates the unknown default, so the
        // median lands on the binance price.
        assert!((result.price - 50_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_permutation_invariance() {
        let manual = ManualClock::new(NOW);
        let agg = ConsensusAggregator::with_clock(AggregatorConfig::default(), manual.as_clock());
        let updates = vec![
            update("binance", 50_000.0, 50, 0.95),
            update("coinbase", 50_010.0, 60, 0.92),
            update("kraken", 49_995.0, 70, 0.9),
        ];
        let forward = agg.aggregate(&feed(), &updates).unwrap();

        let mut reversed = updates.clone();
        reversed.reverse();
        let backward = agg.aggregate(&feed(), &reversed).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_result_invariants_hold() {
        let agg = aggregator();
        let updates = vec![
            update("binance", 50_000.0, 50, 0.95),
            update("coinbase", 50_010.0, 60, 0.92),
            update("kraken", 49_995.0, 70, 0.9),
        ];
        let result = agg.aggregate(&feed(), &updates).unwrap();
        assert!(result.price > 0.0);
        assert!(!result.sources.is_empty());
        assert!((0.0..=1.0).contains(&result.confidence));
        assert!((0.0..=1.0).contains(&result.consensus_score));
    }

    #[test]
    fn test_staleness_decay_lowers_weight() {
        let manual = ManualClock::new(NOW);
        let agg = ConsensusAggregator::with_clock(AggregatorConfig::default(), manual.as_clock());
        // Same venue weights, same confidence; the fresher point should
        // carry the median despite the higher price being second.
        let updates = vec![
            update("binance", 50_000.0, 1_400, 0.95),
            update("binance", 50_100.0, 10, 0.95),
        ];
        let result = agg.aggregate(&feed(), &updates).unwrap();
        assert!((result.price - 50_100.0).abs() < 1e-9);
    }

    #[test]
    fn test_cache_serves_identical_inputs_within_ttl() {
        let manual = ManualClock::new(NOW);
        let agg = ConsensusAggregator::with_clock(AggregatorConfig::default(), manual.as_clock());
        let updates = vec![
            update("binance", 50_000.0, 50, 0.95),
            update("coinbase", 50_010.0, 60, 0.92),
        ];
        let first = agg.aggregate(&feed(), &updates).unwrap();
        manual.advance(100);
        let second = agg.aggregate(&feed(), &updates).unwrap();
        // Served from cache: identical including timestamp.
        assert_eq!(first, second);

        // A changed input set misses the cache even within the TTL.
        let mut moved = updates.clone();
        moved[0].price = 50_500.0;
        let third = agg.aggregate(&feed(), &moved).unwrap();
        assert_ne!(first.price, third.price);
    }

    #[test]
    fn test_optimized_weights_apply_to_next_aggregation() {
        let manual = ManualClock::new(NOW);
        let agg = ConsensusAggregator::with_clock(AggregatorConfig::default(), manual.as_clock());
        let updates = vec![
            update("binance", 50_000.0, 50, 0.95),
            update("kraken", 51_000.0, 50, 0.95),
        ];
        agg.aggregate(&feed(), &updates).unwrap();
        // The hook only needs to complete; its effect is bounded.
        agg.optimize_weights();
        manual.advance(500);
        let refreshed = vec![
            update("binance", 50_000.0, 50, 0.95),
            update("kraken", 51_000.0, 50, 0.95),
        ];
        assert!(agg.aggregate(&feed(), &refreshed).is_ok());
    }
}
