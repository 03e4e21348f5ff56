//! Multi-tier price update validation.
//!
//! Six tiers run in order — format, range, staleness, statistical
//! outlier, cross-source agreement, consensus alignment — collecting
//! faults rather than short-circuiting, except that a CRITICAL fault
//! stops further tiers. The verdict is `no CRITICAL and at most one
//! HIGH`; confidence is multiplicatively penalized per fault either way,
//! so a flagged-but-valid update still contributes less weight.
//!
//! The validator is stateless over its inputs: history and cross-source
//! windows are owned by the data manager and passed in per call. Results
//! are cached briefly per `(feed, source, timestamp)` so repeated
//! queries inside one aggregation window skip the tiers.

mod cache;

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::domain::{FeedId, PriceUpdate};
use crate::core::service::{system_clock, Clock};

use cache::ResultCache;

/// Fault severity, ordered from advisory to disqualifying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Multiplicative confidence penalty for one fault of this severity.
    #[must_use]
    pub fn penalty(self) -> f64 {
        match self {
            Self::Low => 0.95,
            Self::Medium => 0.8,
            Self::High => 0.5,
            Self::Critical => 0.1,
        }
    }
}

/// What exactly went wrong, with the numbers that triggered it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Fault {
    Format { detail: String },
    Range { price: f64, min: f64, max: f64 },
    Stale { age_ms: i64, max_age_ms: i64 },
    ZScore { z: f64, mean: f64, std_dev: f64 },
    Deviation { pct: f64, recent_mean: f64 },
    CrossSource { pct: f64, peer_median: f64, peers: usize },
    ConsensusDrift { pct: f64, consensus_median: f64 },
}

/// One tier finding: the fault and how badly it counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationFault {
    pub fault: Fault,
    pub severity: Severity,
}

/// The verdict for one update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub faults: Vec<ValidationFault>,
    /// The input update with its confidence penalized per fault.
    pub adjusted: PriceUpdate,
}

impl ValidationOutcome {
    #[must_use]
    pub fn worst_severity(&self) -> Option<Severity> {
        self.faults.iter().map(|f| f.severity).max()
    }
}

/// Read-only history slices assembled by the data manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationContext<'a> {
    /// Accepted prices for this feed, oldest first.
    pub historical: &'a [f64],
    /// Updates from any source within the cross-source window.
    pub cross_source: &'a [PriceUpdate],
    /// Current consensus median, when one exists.
    pub consensus_median: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub price_min: f64,
    pub price_max: f64,
    pub max_age_ms: i64,
    /// Fractional deviation bound for the recent-mean outlier check.
    pub outlier_threshold: f64,
    pub z_score_limit: f64,
    pub cross_source_window_ms: i64,
    pub cache_capacity: usize,
    pub cache_ttl_ms: i64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            price_min: 0.01,
            price_max: 1_000_000.0,
            max_age_ms: 2_000,
            outlier_threshold: 0.12,
            z_score_limit: 2.5,
            cross_source_window_ms: 10_000,
            cache_capacity: 1_000,
            cache_ttl_ms: 5_000,
        }
    }
}

pub struct Validator {
    cfg: ValidatorConfig,
    cache: Mutex<ResultCache>,
    clock: Clock,
}

impl Validator {
    #[must_use]
    pub fn new(cfg: ValidatorConfig) -> Self {
        Self::with_clock(cfg, system_clock())
    }

    #[must_use]
    pub fn with_clock(cfg: ValidatorConfig, clock: Clock) -> Self {
        let cache = ResultCache::new(cfg.cache_capacity, cfg.cache_ttl_ms);
        Self { cfg, cache: Mutex::new(cache), clock }
    }

    /// Validate one update against its feed's history and peers.
    pub fn validate(
        &self,
        feed: &FeedId,
        update: &PriceUpdate,
        ctx: &ValidationContext<'_>,
    ) -> ValidationOutcome {
        let now_ms = (self.clock)();
        let key = cache_key(feed, update);
        if let Some(hit) = self.cache.lock().get(&key, now_ms) {
            return hit;
        }
        let outcome = self.run_tiers(update, ctx, now_ms);
        self.cache.lock().insert(key, outcome.clone(), now_ms);
        outcome
    }

    /// Validate a batch sharing one context: every batch member counts
    /// in the others' cross-source set. Returns outcomes keyed by
    /// `source@timestamp`.
    pub fn validate_batch(
        &self,
        feed: &FeedId,
        updates: &[PriceUpdate],
        ctx: &ValidationContext<'_>,
    ) -> HashMap<String, ValidationOutcome> {
        let mut combined: Vec<PriceUpdate> = ctx.cross_source.to_vec();
        combined.extend(updates.iter().cloned());

        updates
            .iter()
            .map(|update| {
                let shared = ValidationContext {
                    historical: ctx.historical,
                    cross_source: &combined,
                    consensus_median: ctx.consensus_median,
                };
                (batch_key(update), self.validate(feed, update, &shared))
            })
            .collect()
    }

    /// Drop expired cache entries; wired to the background sweep.
    pub fn sweep_cache(&self) {
        self.cache.lock().sweep((self.clock)());
    }

    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    fn run_tiers(
        &self,
        update: &PriceUpdate,
        ctx: &ValidationContext<'_>,
        now_ms: i64,
    ) -> ValidationOutcome {
        let mut faults = Vec::new();

        self.check_format(update, &mut faults);
        if !has_critical(&faults) {
            self.check_range(update, &mut faults);
        }
        if !has_critical(&faults) {
            self.check_staleness(update, now_ms, &mut faults);
        }
        if !has_critical(&faults) {
            self.check_outlier(update, ctx.historical, &mut faults);
            self.check_cross_source(update, ctx.cross_source, now_ms, &mut faults);
            self.check_consensus(update, ctx.consensus_median, &mut faults);
        }

        let high_count = faults.iter().filter(|f| f.severity == Severity::High).count();
        let is_valid = !has_critical(&faults) && high_count <= 1;

        let penalty: f64 = faults.iter().map(|f| f.severity.penalty()).product();
        let mut adjusted = update.clone();
        adjusted.confidence = (update.confidence * penalty).clamp(0.0, 1.0);

        ValidationOutcome { is_valid, faults, adjusted }
    }

    fn check_format(&self, update: &PriceUpdate, faults: &mut Vec<ValidationFault>) {
        let mut fail = |detail: String| {
            faults.push(ValidationFault {
                fault: Fault::Format { detail },
                severity: Severity::Critical,
            });
        };
        if update.symbol.is_empty() {
            fail("empty symbol".to_string());
        }
        if update.source.is_empty() {
            fail("empty source".to_string());
        }
        if !update.price.is_finite() {
            fail(format!("non-finite price {}", update.price));
        }
        if update.timestamp_ms <= 0 {
            fail(format!("invalid timestamp {}", update.timestamp_ms));
        }
        if !(0.0..=1.0).contains(&update.confidence) || update.confidence.is_nan() {
            fail(format!("confidence {} outside [0, 1]", update.confidence));
        }
        if let Some(volume) = update.volume {
            if !volume.is_finite() || volume < 0.0 {
                fail(format!("invalid volume {volume}"));
            }
        }
    }

    fn check_range(&self, update: &PriceUpdate, faults: &mut Vec<ValidationFault>) {
        let severity = if update.price <= 0.0 {
            Severity::Critical
        } else if update.price < self.cfg.price_min || update.price > self.cfg.price_max {
            Severity::High
        } else {
            return;
        };
        faults.push(ValidationFault {
            fault: Fault::Range {
                price: update.price,
                min: self.cfg.price_min,
                max: self.cfg.price_max,
            },
            severity,
        });
    }

    fn check_staleness(&self, update: &PriceUpdate, now_ms: i64, faults: &mut Vec<ValidationFault>) {
        let age_ms = update.age_ms(now_ms);
        // Reaching max_age exactly already disqualifies.
        let severity = if age_ms >= self.cfg.max_age_ms {
            Severity::Critical
        } else if age_ms as f64 > 0.8 * self.cfg.max_age_ms as f64 {
            Severity::Low
        } else {
            return;
        };
        faults.push(ValidationFault {
            fault: Fault::Stale { age_ms, max_age_ms: self.cfg.max_age_ms },
            severity,
        });
    }

    fn check_outlier(&self, update: &PriceUpdate, historical: &[f64], faults: &mut Vec<ValidationFault>) {
        if historical.len() < 3 {
            return;
        }
        let historical_mean = mean(historical);
        let std_dev = std_dev(historical, historical_mean);
        if std_dev > f64::EPSILON {
            let z = (update.price - historical_mean) / std_dev;
            if z.abs() > self.cfg.z_score_limit {
                faults.push(ValidationFault {
                    fault: Fault::ZScore { z, mean: historical_mean, std_dev },
                    severity: Severity::Medium,
                });
            }
        }

        let recent = &historical[historical.len().saturating_sub(5)..];
        let recent_mean = mean(recent);
        if recent_mean > f64::EPSILON {
            let deviation = (update.price - recent_mean).abs() / recent_mean;
            let severity = if deviation > 2.0 * self.cfg.outlier_threshold {
                Some(Severity::High)
            } else if deviation > self.cfg.outlier_threshold {
                Some(Severity::Medium)
            } else {
                None
            };
            if let Some(severity) = severity {
                faults.push(ValidationFault {
                    fault: Fault::Deviation { pct: deviation * 100.0, recent_mean },
                    severity,
                });
            }
        }
    }

    fn check_cross_source(
        &self,
        update: &PriceUpdate,
        cross_source: &[PriceUpdate],
        now_ms: i64,
        faults: &mut Vec<ValidationFault>,
    ) {
        let peers: Vec<&PriceUpdate> = cross_source
            .iter()
            .filter(|u| {
                u.source != update.source
                    && u.symbol == update.symbol
                    && u.age_ms(now_ms) <= self.cfg.cross_source_window_ms
            })
            .collect();
        let distinct: HashSet<&str> = peers.iter().map(|u| u.source.as_str()).collect();
        if distinct.len() < 2 {
            return;
        }

        let mut prices: Vec<f64> = peers.iter().map(|u| u.price).collect();
        let peer_median = median(&mut prices);
        if peer_median <= f64::EPSILON {
            return;
        }
        let deviation = (update.price - peer_median).abs() / peer_median;
        let severity = if deviation > 0.04 {
            Some(Severity::High)
        } else if deviation > 0.02 {
            Some(Severity::Medium)
        } else {
            None
        };
        if let Some(severity) = severity {
            faults.push(ValidationFault {
                fault: Fault::CrossSource {
                    pct: deviation * 100.0,
                    peer_median,
                    peers: distinct.len(),
                },
                severity,
            });
        }
    }

    fn check_consensus(
        &self,
        update: &PriceUpdate,
        consensus_median: Option<f64>,
        faults: &mut Vec<ValidationFault>,
    ) {
        let Some(consensus) = consensus_median else {
            return;
        };
        if consensus <= f64::EPSILON {
            return;
        }
        let deviation = (update.price - consensus).abs() / consensus;
        let severity = if deviation > 0.01 {
            Some(Severity::High)
        } else if deviation > 0.005 {
            Some(Severity::Medium)
        } else {
            None
        };
        if let Some(severity) = severity {
            faults.push(ValidationFault {
                fault: Fault::ConsensusDrift { pct: deviation * 100.0, consensus_median: consensus },
                severity,
            });
        }
    }
}

fn has_critical(faults: &[ValidationFault]) -> bool {
    faults.iter().any(|f| f.severity == Severity::Critical)
}

fn cache_key(feed: &FeedId, update: &PriceUpdate) -> String {
    format!("{}:{}:{}", feed.key(), update.source, update.timestamp_ms)
}

/// Key of one batch member in the [`Validator::validate_batch`] result.
#[must_use]
pub fn batch_key(update: &PriceUpdate) -> String {
    format!("{}@{}", update.source, update.timestamp_ms)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
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

    fn update(source: &str, price: f64, age_ms: i64) -> PriceUpdate {
        PriceUpdate {
            symbol: "BTC/USD".into(),
            source: source.into(),
            price,
            timestamp_ms: NOW - age_ms,
            volume: Some(100.0),
            confidence: 0.9,
        }
    }

    fn validator() -> Validator {
        Validator::with_clock(ValidatorConfig::default(), ManualClock::new(NOW).as_clock())
    }

    #[test]
    fn test_clean_update_is_valid() {
        let v = validator();
        let outcome = v.validate(&feed(), &update("binance", 50_000.0, 100), &ValidationContext::default());
        assert!(outcome.is_valid);
        assert!(outcome.faults.is_empty());
        assert!((outcome.adjusted.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_stale_at_max_age_boundary() {
        let v = validator();
        let at_limit = v.validate(&feed(), &update("binance", 50_000.0, 2_000), &ValidationContext::default());
        assert!(!at_limit.is_valid);
        assert_eq!(at_limit.worst_severity(), Some(Severity::Critical));
        assert!(matches!(at_limit.faults[0].fault, Fault::Stale { .. }));

        let just_inside = v.validate(&feed(), &update("binance", 50_000.0, 1_999), &ValidationContext::default());
        assert!(just_inside.is_valid);
        assert_eq!(just_inside.worst_severity(), Some(Severity::Low));
    }

    #[test]
    fn test_near_stale_is_low_warning() {
        let v = validator();
        let outcome = v.validate(&feed(), &update("binance", 50_000.0, 1_700), &ValidationContext::default());
        assert!(outcome.is_valid);
        assert_eq!(outcome.worst_severity(), Some(Severity::Low));
    }

    #[test]
    fn test_non_positive_price_is_critical() {
        let v = validator();
        let outcome = v.validate(&feed(), &update("binance", -5.0, 100), &ValidationContext::default());
        assert!(!outcome.is_valid);
        assert_eq!(outcome.worst_severity(), Some(Severity::Critical));
        assert!((outcome.adjusted.confidence - 0.09).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_range_price_is_high() {
        let v = validator();
        let outcome = v.validate(&feed(), &update("binance", 2_000_000.0, 100), &ValidationContext::default());
        // One HIGH fault alone does not invalidate.
        assert!(outcome.is_valid);
        assert_eq!(outcome.worst_severity(), Some(Severity::High));
    }

    #[test]
    fn test_confidence_outside_unit_interval_is_critical() {
        let v = validator();
        let mut bad = update("binance", 50_000.0, 100);
        bad.confidence = 1.2;
        let outcome = v.validate(&feed(), &bad, &ValidationContext::default());
        assert!(!outcome.is_valid);
    }

    #[test]
    fn test_z_score_outlier_needs_three_samples() {
        let v = validator();
        let spike = update("binance", 60_000.0, 100);

        let short = [50_000.0, 50_010.0];
        let ctx = ValidationContext { historical: &short, ..Default::default() };
        assert!(v.validate(&feed(), &spike, &ctx).faults.is_empty());

        let enough = [50_000.0, 50_010.0, 49_990.0, 50_005.0];
        let ctx = ValidationContext { historical: &enough, ..Default::default() };
        let outcome = v.validate(&feed(), &spike, &ctx);
        assert!(outcome.faults.iter().any(|f| matches!(f.fault, Fault::ZScore { .. })));
        assert!(outcome.faults.iter().any(|f| matches!(f.fault, Fault::Deviation { .. })));
    }

    #[test]
    fn test_cross_source_deviation_flags_lone_dissenter() {
        let v = validator();
        let peers = [update("coinbase", 40_000.0, 500), update("kraken", 40_100.0, 700)];
        let ctx = ValidationContext { cross_source: &peers, ..Default::default() };
        let outcome = v.validate(&feed(), &update("binance", 50_000.0, 100), &ctx);
        let cross = outcome
            .faults
            .iter()
            .find(|f| matches!(f.fault, Fault::CrossSource { .. }))
            .expect("cross-source fault");
        assert_eq!(cross.severity, Severity::High);
        // HIGH penalty halves confidence.
        assert!((outcome.adjusted.confidence - 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_cross_source_needs_two_distinct_peers() {
        let v = validator();
        let peers = [update("coinbase", 40_000.0, 500), update("coinbase", 40_050.0, 300)];
        let ctx = ValidationContext { cross_source: &peers, ..Default::default() };
        let outcome = v.validate(&feed(), &update("binance", 50_000.0, 100), &ctx);
        assert!(!outcome.faults.iter().any(|f| matches!(f.fault, Fault::CrossSource { .. })));
    }

    #[test]
    fn test_consensus_alignment_thresholds() {
        let v = validator();
        let ctx = ValidationContext { consensus_median: Some(50_000.0), ..Default::default() };

        let aligned = v.validate(&feed(), &update("binance", 50_100.0, 100), &ctx);
        assert!(aligned.faults.is_empty());

        let drifting = v.validate(&feed(), &update("binance", 50_400.0, 100), &ctx);
        assert_eq!(drifting.worst_severity(), Some(Severity::Medium));

        let far = v.validate(&feed(), &update("binance", 51_000.0, 100), &ctx);
        assert_eq!(far.worst_severity(), Some(Severity::High));
    }

    #[test]
    fn test_batch_members_see_each_other() {
        let v = validator();
        let batch = vec![
            update("binance", 50_000.0, 100),
            update("coinbase", 40_000.0, 200),
            update("kraken", 40_100.0, 300),
        ];
        let outcomes = v.validate_batch(&feed(), &batch, &ValidationContext::default());
        assert_eq!(outcomes.len(), 3);
        let binance = &outcomes[&batch_key(&batch[0])];
        assert!(binance.faults.iter().any(|f| matches!(f.fault, Fault::CrossSource { .. })));
    }

    #[test]
    fn test_cache_hit_skips_tiers() {
        let manual = ManualClock::new(NOW);
        let v = Validator::with_clock(ValidatorConfig::default(), manual.as_clock());
        let u = update("binance", 50_000.0, 100);

        let first = v.validate(&feed(), &u, &ValidationContext::default());
        assert!(first.faults.is_empty());

        // Same key, different context: still the cached clean verdict.
        let peers = [update("coinbase", 40_000.0, 100), update("kraken", 40_000.0, 100)];
        let ctx = ValidationContext { cross_source: &peers, ..Default::default() };
        let second = v.validate(&feed(), &u, &ctx);
        assert!(second.faults.is_empty());

        // Past the TTL the tiers run again and see the peers.
        manual.advance(6_000);
        let mut refreshed = u.clone();
        refreshed.timestamp_ms = manual.now_ms() - 100;
        let third = v.validate(&feed(), &refreshed, &ctx);
        assert!(third.faults.iter().any(|f| matches!(f.fault, Fault::CrossSource { .. })));
    }

    #[test]
    fn test_critical_stops_later_tiers() {
        let v = validator();
        let peers = [update("coinbase", 40_000.0, 100), update("kraken", 40_000.0, 100)];
        let ctx = ValidationContext { cross_source: &peers, ..Default::default() };
        let outcome = v.validate(&feed(), &update("binance", 50_000.0, 5_000), &ctx);
        assert_eq!(outcome.faults.len(), 1);
        assert!(matches!(outcome.faults[0].fault, Fault::Stale { .. }));
    }
}
