//! Bounded per-feed windows: accepted prices, cross-source updates,
//! volume observations. One `FeedHistory` sits behind one lock, so the
//! ingest hot path never contends across feeds.

use std::collections::VecDeque;

use crate::core::domain::{PriceUpdate, VolumeObservation};

/// Hard cap on the cross-source window, independent of its time bound.
const CROSS_SOURCE_CAP: usize = 512;

#[derive(Debug, Default)]
pub struct FeedHistory {
    /// Validated updates, oldest first, FIFO-bounded.
    prices: VecDeque<PriceUpdate>,
    /// All gated updates within the cross-source time window.
    cross_source: VecDeque<PriceUpdate>,
    /// Volume reports, FIFO-bounded.
    volumes: VecDeque<VolumeObservation>,
}

impl FeedHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an accepted update, evicting FIFO past `window`.
    pub fn push_price(&mut self, update: PriceUpdate, window: usize) {
        self.prices.push_back(update);
        while self.prices.len() > window {
            self.prices.pop_front();
        }
    }

    /// Append to the cross-source window, dropping entries older than
    /// `window_ms` on the way in.
    pub fn push_cross_source(&mut self, update: PriceUpdate, window_ms: i64, now_ms: i64) {
        self.cross_source.push_back(update);
        self.sweep_cross_source(window_ms, now_ms);
        while self.cross_source.len() > CROSS_SOURCE_CAP {
            self.cross_source.pop_front();
        }
    }

    /// Drop cross-source entries older than `window_ms`.
    pub fn sweep_cross_source(&mut self, window_ms: i64, now_ms: i64) {
        while let Some(front) = self.cross_source.front() {
            if front.age_ms(now_ms) > window_ms {
                self.cross_source.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn push_volume(&mut self, observation: VolumeObservation, window: usize) {
        self.volumes.push_back(observation);
        while self.volumes.len() > window {
            self.volumes.pop_front();
        }
    }

    /// Accepted prices, oldest first.
    #[must_use]
    pub fn price_values(&self) -> Vec<f64> {
        self.prices.iter().map(|u| u.price).collect()
    }

    /// Snapshot of the cross-source window.
    #[must_use]
    pub fn cross_source_snapshot(&self) -> Vec<PriceUpdate> {
        self.cross_source.iter().cloned().collect()
    }

    /// Sum of volume observations inside `[start_ms, end_ms]`.
    #[must_use]
    pub fn volume_between(&self, start_ms: i64, end_ms: i64) -> f64 {
        self.volumes
            .iter()
            .filter(|v| v.timestamp_ms >= start_ms && v.timestamp_ms <= end_ms)
            .map(|v| v.volume)
            .sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}
