//! Short-TTL result cache for aggregations.
//!
//! An entry is only served while its TTL holds AND the current inputs
//! hash to the same value it was computed from, so a cache hit can never
//! mask a changed update set. Writes occasionally (10% of the time)
//! sweep entries older than twice the TTL.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use dashmap::DashMap;
use rand::Rng;

use crate::core::domain::{AggregatedPrice, PriceUpdate};

#[derive(Debug, Clone)]
struct Entry {
    result: AggregatedPrice,
    inserted_ms: i64,
    input_hash: u64,
}

pub(super) struct AggregationCache {
    entries: DashMap<String, Entry>,
    ttl_ms: i64,
}

impl AggregationCache {
    pub(super) fn new(ttl_ms: i64) -> Self {
        Self { entries: DashMap::new(), ttl_ms }
    }

    pub(super) fn get(&self, key: &str, input_hash: u64, now_ms: i64) -> Option<AggregatedPrice> {
        let entry = self.entries.get(key)?;
        if now_ms - entry.inserted_ms > self.ttl_ms || entry.input_hash != input_hash {
            return None;
        }
        Some(entry.result.clone())
    }

    pub(super) fn insert(&self, key: String, result: AggregatedPrice, input_hash: u64, now_ms: i64) {
        self.entries.insert(key, Entry { result, inserted_ms: now_ms, input_hash });
        if rand::thread_rng().gen_bool(0.1) {
            self.sweep(now_ms);
        }
    }

    /// Evict entries older than twice the TTL.
    pub(super) fn sweep(&self, now_ms: i64) {
        let horizon = 2 * self.ttl_ms;
        self.entries.retain(|_, entry| now_ms - entry.inserted_ms <= horizon);
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Stable hash over the update multiset.
///
/// Tuples of `(source, price in cents, timestamp in seconds)` are sorted
/// before hashing, so any permutation of the same updates hashes alike.
pub(super) fn input_hash(updates: &[PriceUpdate]) -> u64 {
    let mut tuples: Vec<(&str, i64, i64)> = updates
        .iter()
        .map(|u| (u.source.as_str(), (u.price * 100.0).round() as i64, u.timestamp_ms / 1000))
        .collect();
    tuples.sort_unstable();
    let mut hasher = DefaultHasher::new();
    tuples.hash(&mut hasher);
    hasher.finish()
}
