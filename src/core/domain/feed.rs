//! Feed identity and catalog types.
//!
//! A feed is a canonical price series identified by a category and a
//! `BASE/QUOTE` name. The catalog maps each feed to an ordered list of
//! exchange sources; sources not marked as backup are primary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Coarse feed classification, mapped to wire integers 1..=4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedCategory {
    Crypto,
    Forex,
    Commodity,
    Stock,
}

impl FeedCategory {
    /// Parse the wire integer used by the HTTP API.
    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Crypto),
            2 => Some(Self::Forex),
            3 => Some(Self::Commodity),
            4 => Some(Self::Stock),
            _ => None,
        }
    }

    /// The wire integer used by the HTTP API.
    #[must_use]
    pub fn wire(self) -> u8 {
        match self {
            Self::Crypto => 1,
            Self::Forex => 2,
            Self::Commodity => 3,
            Self::Stock => 4,
        }
    }
}

/// Canonical feed identity: category plus a `BASE/QUOTE` name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedId {
    pub category: FeedCategory,
    pub name: String,
}

impl FeedId {
    /// Create a feed id, validating the `BASE/QUOTE` shape.
    pub fn new(category: FeedCategory, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_valid_feed_name(&name) {
            return Err(Error::InvalidFeed(name));
        }
        Ok(Self { category, name })
    }

    /// The base token, e.g. `BTC` in `BTC/USD`.
    #[must_use]
    pub fn base(&self) -> &str {
        self.name.split('/').next().unwrap_or("")
    }

    /// The quote token, e.g. `USD` in `BTC/USD`.
    #[must_use]
    pub fn quote(&self) -> &str {
        self.name.split('/').nth(1).unwrap_or("")
    }

    /// Stable cache key, e.g. `1:BTC/USD`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.category.wire(), self.name)
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl FromStr for FeedId {
    type Err = Error;

    /// Parse a crypto feed from its bare `BASE/QUOTE` name.
    fn from_str(s: &str) -> Result<Self> {
        Self::new(FeedCategory::Crypto, s)
    }
}

/// Check the `BASE/QUOTE` shape: two non-empty uppercase alphanumeric tokens.
#[must_use]
pub fn is_valid_feed_name(name: &str) -> bool {
    let mut parts = name.splitn(3, '/');
    let (Some(base), Some(quote), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let token_ok = |t: &str| {
        !t.is_empty() && t.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    };
    token_ok(base) && token_ok(quote)
}

/// One exchange source of a feed: which exchange, and the symbol it speaks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    /// Exchange id, e.g. `binance`.
    pub exchange: String,
    /// Exchange-native symbol, e.g. `BTCUSDT`.
    pub symbol: String,
    /// Backup sources are only activated when all primaries are unhealthy.
    #[serde(default)]
    pub backup: bool,
}

/// Catalog entry: a feed and its ordered source list (primaries first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub feed: FeedId,
    pub sources: Vec<FeedSource>,
    /// Decimals used when scaling the feed value for the HTTP API.
    #[serde(default = "default_decimals")]
    pub decimals: u8,
}

fn default_decimals() -> u8 {
    8
}

impl FeedConfig {
    /// Sources that serve the feed under normal conditions.
    #[must_use]
    pub fn primaries(&self) -> Vec<&FeedSource> {
        self.sources.iter().filter(|s| !s.backup).collect()
    }

    /// Sources promoted only when every primary is unhealthy.
    #[must_use]
    pub fn backups(&self) -> Vec<&FeedSource> {
        self.sources.iter().filter(|s| s.backup).collect()
    }

    /// The source entry for a given exchange, if the feed uses it.
    #[must_use]
    pub fn source_for(&self, exchange: &str) -> Option<&FeedSource> {
        self.sources.iter().find(|s| s.exchange == exchange)
    }
}
