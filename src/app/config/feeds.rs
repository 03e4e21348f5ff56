//! `[[feeds]]` catalog tables.

use serde::Deserialize;

use crate::core::domain::{FeedCategory, FeedConfig, FeedId, FeedSource};
use crate::error::{Error, Result};

/// One `[[feeds]]` table as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedEntry {
    pub category: FeedCategory,
    pub name: String,
    #[serde(default = "default_decimals")]
    pub decimals: u8,
    pub sources: Vec<FeedSource>,
}

fn default_decimals() -> u8 {
    8
}

impl FeedEntry {
    /// Resolve into a validated catalog entry.
    pub fn to_feed_config(&self) -> Result<FeedConfig> {
        let feed = FeedId::new(self.category, self.name.clone())?;
        if self.sources.is_empty() {
            return Err(Error::Config(format!("feed {} has no sources", self.name)));
        }
        if self.sources.iter().all(|s| s.backup) {
            return Err(Error::Config(format!("feed {} has no primary source", self.name)));
        }
        Ok(FeedConfig { feed, sources: self.sources.clone(), decimals: self.decimals })
    }
}
