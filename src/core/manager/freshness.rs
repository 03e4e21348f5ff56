//! Freshness policy: what the ingest gate rejects, and when a cached
//! update is fresh enough to skip the REST fallback.
//!
//! Age alone never rejects data — stale updates are tagged and passed
//! through so the aggregator can decay their weight; the gate only stops
//! obviously broken input (non-finite or non-positive prices, absurd
//! timestamps, sub-minimum confidence).

use serde::Serialize;

use crate::core::domain::PriceUpdate;

/// Why the gate turned an update away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    NonFinitePrice,
    NonPositivePrice,
    BadTimestamp,
    LowConfidence,
}

#[derive(Debug, Clone)]
pub struct FreshnessPolicy {
    /// Updates at most this old bypass the REST fallback.
    pub fresh_within_ms: i64,
    /// Gate floor for adapter-reported confidence.
    pub min_confidence: f64,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self { fresh_within_ms: 1_500, min_confidence: 0.1 }
    }
}

impl FreshnessPolicy {
    /// Reject only broken data; staleness is not a gate criterion.
    pub fn gate(&self, update: &PriceUpdate) -> Result<(), RejectReason> {
        if !update.price.is_finite() {
            return Err(RejectReason::NonFinitePrice);
        }
        if update.price <= 0.0 {
            return Err(RejectReason::NonPositivePrice);
        }
        if update.timestamp_ms <= 0 {
            return Err(RejectReason::BadTimestamp);
        }
        if update.confidence.is_nan() || update.confidence < self.min_confidence {
            return Err(RejectReason::LowConfidence);
        }
        Ok(())
    }

    /// Real-time data is preferred over any fallback while this holds.
    #[must_use]
    pub fn is_fresh(&self, update: &PriceUpdate, now_ms: i64) -> bool {
        update.age_ms(now_ms) <= self.fresh_within_ms
    }

    /// Staleness tag for an update, for logging and response metadata.
    #[must_use]
    pub fn staleness_ms(&self, update: &PriceUpdate, now_ms: i64) -> i64 {
        update.age_ms(now_ms)
    }
}
