//! Bidirectional canonical ↔ exchange-native symbol mapping.
//!
//! Built from the feed catalog, one map per adapter. The reverse
//! direction must recover the canonical `BASE/QUOTE` form from any
//! delivered frame, so both directions are kept explicitly.

use std::collections::HashMap;

/// Symbol translation table for one exchange.
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    native_by_canonical: HashMap<String, String>,
    canonical_by_native: HashMap<String, String>,
}

impl SymbolMap {
    /// Build from `(canonical, native)` pairs. Later duplicates win.
    #[must_use]
    pub fn new<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut map = Self::default();
        for (canonical, native) in pairs {
            map.insert(canonical, native);
        }
        map
    }

    pub fn insert(&mut self, canonical: String, native: String) {
        self.canonical_by_native.insert(native.clone(), canonical.clone());
        self.native_by_canonical.insert(canonical, native);
    }

    /// Canonical `BASE/QUOTE` form for an exchange-native symbol.
    #[must_use]
    pub fn canonical(&self, native: &str) -> Option<&str> {
        self.canonical_by_native.get(native).map(String::as_str)
    }

    /// Exchange-native symbol for a canonical feed name.
    #[must_use]
    pub fn native(&self, canonical: &str) -> Option<&str> {
        self.native_by_canonical.get(canonical).map(String::as_str)
    }

    #[must_use]
    pub fn contains_native(&self, native: &str) -> bool {
        self.canonical_by_native.contains_key(native)
    }

    /// All native symbols, sorted for deterministic subscribe frames.
    #[must_use]
    pub fn natives(&self) -> Vec<String> {
        let mut natives: Vec<String> = self.canonical_by_native.keys().cloned().collect();
        natives.sort();
        natives
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.native_by_canonical.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.native_by_canonical.is_empty()
    }
}
