//! Bounded LRU cache for validation outcomes.

use std::collections::HashMap;
use std::collections::VecDeque;

use super::ValidationOutcome;

/// LRU map keyed by `(feed, source, timestamp)` strings, with a TTL on
/// every entry. Capacity eviction drops the least recently used key.
pub(super) struct ResultCache {
    entries: HashMap<String, (ValidationOutcome, i64)>,
    /// Keys in recency order, least recent at the front.
    order: VecDeque<String>,
    capacity: usize,
    ttl_ms: i64,
}

impl ResultCache {
    pub(super) fn new(capacity: usize, ttl_ms: i64) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.min(1_024)),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl_ms,
        }
    }

    pub(super) fn get(&mut self, key: &str, now_ms: i64) -> Option<ValidationOutcome> {
        let (outcome, inserted_ms) = self.entries.get(key)?;
        if now_ms - inserted_ms > self.ttl_ms {
            self.entries.remove(key);
            self.order.retain(|k| k != key);
            return None;
        }
        let outcome = outcome.clone();
        self.touch(key);
        Some(outcome)
    }

    pub(super) fn insert(&mut self, key: String, outcome: ValidationOutcome, now_ms: i64) {
        if self.entries.insert(key.clone(), (outcome, now_ms)).is_some() {
            self.touch(&key);
        } else {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    /// Drop every expired entry.
    pub(super) fn sweep(&mut self, now_ms: i64) {
        let ttl = self.ttl_ms;
        self.entries.retain(|_, (_, inserted)| now_ms - *inserted <= ttl);
        let entries = &self.entries;
        self.order.retain(|k| entries.contains_key(k));
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key = self.order.remove(pos).unwrap();
            self.order.push_back(key);
        }
    }
}
