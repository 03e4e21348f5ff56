//! Typed events flowing between components.
//!
//! All cross-component communication is channel-based: adapters push
//! [`AdapterEvent`]s into the data manager, the manager forwards
//! [`HealthEvent`]s to the failover controller, and the controller
//! broadcasts [`OracleEvent`]s to any interested subscriber. Dropping a
//! broadcast receiver unsubscribes it.

use crate::core::domain::{FeedId, PriceUpdate};

/// Events emitted by an exchange adapter.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// A normalized ticker observation.
    Price(PriceUpdate),
    /// A standalone volume report (some protocols deliver volume
    /// separately from price).
    Volume {
        symbol: String,
        source: String,
        volume: f64,
        timestamp_ms: i64,
    },
    /// Transport-level connection state flipped. Adapters guarantee the
    /// `connected` values alternate; the same value is never emitted twice
    /// in a row.
    ConnectionChange { source: String, connected: bool },
    /// A terminal adapter error, emitted only after internal retries are
    /// exhausted.
    Error { source: String, message: String },
}

/// Health observations consumed by the failover controller.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// Forwarded transport connection change.
    ConnectionChange { source: String, connected: bool },
    /// Result of a periodic health probe.
    Probe {
        source: String,
        healthy: bool,
        latency_ms: f64,
    },
}

/// Events broadcast by the failover controller.
#[derive(Debug, Clone, PartialEq)]
pub enum OracleEvent {
    /// A source was marked unhealthy after repeated failures.
    SourceUnhealthy { source: String },
    /// A feed's active set was re-shaped and at least one source remains.
    FailoverCompleted { feed: FeedId, active: Vec<String> },
    /// Every source of the feed, backups included, is unhealthy.
    FailoverFailed { feed: FeedId },
    /// A primary recovered; lists the backups that were deactivated.
    SourceRecovered {
        feed: FeedId,
        source: String,
        deactivated_backups: Vec<String>,
    },
}
