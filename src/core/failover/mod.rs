//! Source health tracking and per-feed failover.
//!
//! The controller consumes a one-way stream of [`HealthEvent`]s (the
//! data manager forwards connection changes; the health monitor feeds
//! probe results) and mutates per-feed [`FailoverGroup`]s: when every
//! primary of a feed is unhealthy it promotes the healthy backups, and
//! when a primary recovers it demotes the now-redundant backups again.
//! Subscriptions are issued through a [`SubscriptionPort`] so the
//! controller never reaches into adapter lifecycles directly, and the
//! data manager reads the resulting active set through
//! [`FailoverController::active_sources`] — no component cycle.
//!
//! The controller never propagates errors upward; failures become log
//! lines and [`OracleEvent`]s.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::domain::{FeedConfig, FeedId, HealthEvent, OracleEvent, SourceHealth};
use crate::core::service::{system_clock, Clock, EventBus};
use crate::error::Result;

/// Subscription operations the controller needs from the orchestrator.
#[async_trait]
pub trait SubscriptionPort: Send + Sync {
    async fn subscribe(&self, exchange: &str, symbols: &[String]) -> Result<()>;
    async fn unsubscribe(&self, exchange: &str, symbols: &[String]) -> Result<()>;
    fn is_connected(&self, exchange: &str) -> bool;
    fn latency_ms(&self, exchange: &str) -> f64;
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Consecutive failures before a source is marked unhealthy.
    pub failure_threshold: u32,
    /// Consecutive successes before an unhealthy source recovers.
    pub recovery_threshold: u32,
    /// Budget from unhealthy-mark to an alternative being subscribed.
    pub max_failover_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 5,
            max_failover_ms: 100,
            health_check_interval_ms: 5_000,
        }
    }
}

/// One `(exchange, symbol)` pairing inside a feed's source list.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceRef {
    exchange: String,
    symbol: String,
}

/// Per-feed source bookkeeping. `active` and `failed` are always
/// disjoint subsets of `primary ∪ backup`.
#[derive(Debug, Clone)]
pub struct FailoverGroup {
    feed: FeedId,
    primary: Vec<SourceRef>,
    backup: Vec<SourceRef>,
    active: BTreeSet<String>,
    failed: BTreeSet<String>,
}

impl FailoverGroup {
    fn references(&self, exchange: &str) -> bool {
        self.primary.iter().chain(&self.backup).any(|s| s.exchange == exchange)
    }

    fn is_primary(&self, exchange: &str) -> bool {
        self.primary.iter().any(|s| s.exchange == exchange)
    }

    fn backup_ref(&self, exchange: &str) -> Option<&SourceRef> {
        self.backup.iter().find(|s| s.exchange == exchange)
    }
}

/// A subscription action queued while group locks were held.
enum PortAction {
    Subscribe { exchange: String, symbol: String },
    Unsubscribe { exchange: String, symbol: String },
}

pub struct FailoverController {
    groups: RwLock<HashMap<FeedId, FailoverGroup>>,
    health: RwLock<HashMap<String, SourceHealth>>,
    port: Arc<dyn SubscriptionPort>,
    bus: Arc<EventBus>,
    cfg: FailoverConfig,
    clock: Clock,
}

impl FailoverController {
    #[must_use]
    pub fn new(port: Arc<dyn SubscriptionPort>, bus: Arc<EventBus>, cfg: FailoverConfig) -> Self {
        Self::with_clock(port, bus, cfg, system_clock())
    }

    #[must_use]
    pub fn with_clock(
        port: Arc<dyn SubscriptionPort>,
        bus: Arc<EventBus>,
        cfg: FailoverConfig,
        clock: Clock,
    ) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            port,
            bus,
            cfg,
            clock,
        }
    }

    /// Create (or replace) the failover group for one catalog entry.
    /// Primaries start active; backups wait on the bench.
    pub fn register_feed(&self, config: &FeedConfig) {
        let primary: Vec<SourceRef> = config
            .primaries()
            .into_iter()
            .map(|s| SourceRef { exchange: s.exchange.clone(), symbol: s.symbol.clone() })
            .collect();
        let backup: Vec<SourceRef> = config
            .backups()
            .into_iter()
            .map(|s| SourceRef { exchange: s.exchange.clone(), symbol: s.symbol.clone() })
            .collect();
        let active: BTreeSet<String> = primary.iter().map(|s| s.exchange.clone()).collect();

        {
            let mut health = self.health.write();
            for source in primary.iter().chain(&backup) {
                health
                    .entry(source.exchange.clone())
                    .or_insert_with(|| SourceHealth::new(source.exchange.clone()));
            }
        }

        let group = FailoverGroup {
            feed: config.feed.clone(),
            primary,
            backup,
            active,
            failed: BTreeSet::new(),
        };
        self.groups.write().insert(config.feed.clone(), group);
    }

    /// Spawn the event loop consuming health events until the channel
    /// closes.
    pub fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<HealthEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.handle_event(event).await;
            }
            debug!("Health event channel closed, failover loop exiting");
        })
    }

    /// Apply one health observation.
    pub async fn handle_event(&self, event: HealthEvent) {
        match event {
            HealthEvent::ConnectionChange { source, connected } => {
                if connected {
                    self.record_success(&source).await;
                } else {
                    self.record_failure(&source).await;
                }
            }
            HealthEvent::Probe { source, healthy, latency_ms } => {
                {
                    let mut health = self.health.write();
                    let entry = health
                        .entry(source.clone())
                        .or_insert_with(|| SourceHealth::new(source.clone()));
                    entry.last_health_check_ms = (self.clock)();
                    if latency_ms > 0.0 {
                        entry.record_latency(latency_ms);
                    }
                }
                if healthy {
                    self.record_success(&source).await;
                } else {
                    self.record_failure(&source).await;
                }
            }
        }
    }

    /// Probe every tracked source through the port; wired to the
    /// periodic health monitor.
    pub async fn probe_all(&self) {
        let sources: Vec<String> = self.health.read().keys().cloned().collect();
        for source in sources {
            let healthy = self.port.is_connected(&source);
            let latency_ms = self.port.latency_ms(&source);
            self.handle_event(HealthEvent::Probe { source, healthy, latency_ms }).await;
        }
    }

    /// Read-only view of one feed's active sources.
    #[must_use]
    pub fn active_sources(&self, feed: &FeedId) -> Option<Vec<String>> {
        self.groups.read().get(feed).map(|g| g.active.iter().cloned().collect())
    }

    /// Read-only view of one feed's failed sources.
    #[must_use]
    pub fn failed_sources(&self, feed: &FeedId) -> Option<Vec<String>> {
        self.groups.read().get(feed).map(|g| g.failed.iter().cloned().collect())
    }

    #[must_use]
    pub fn source_health(&self, source: &str) -> Option<SourceHealth> {
        self.health.read().get(source).cloned()
    }

    #[must_use]
    pub fn all_health(&self) -> Vec<SourceHealth> {
        self.health.read().values().cloned().collect()
    }

    async fn record_failure(&self, source: &str) {
        let flipped = {
            let mut health = self.health.write();
            let entry =
                health.entry(source.to_string()).or_insert_with(|| SourceHealth::new(source));
            entry.consecutive_failures += 1;
            entry.consecutive_successes = 0;
            if entry.consecutive_failures >= self.cfg.failure_threshold && entry.is_healthy {
                entry.is_healthy = false;
                true
            } else {
                false
            }
        };
        if flipped {
            warn!(source, "Source marked unhealthy");
            self.bus.publish(OracleEvent::SourceUnhealthy { source: source.to_string() });
            self.failover(source).await;
        }
    }

    async fn record_success(&self, source: &str) {
        let flipped = {
            let mut health = self.health.write();
            let entry =
                health.entry(source.to_string()).or_insert_with(|| SourceHealth::new(source));
            entry.consecutive_successes += 1;
            entry.consecutive_failures = 0;
            if entry.consecutive_successes >= self.cfg.recovery_threshold && !entry.is_healthy {
                entry.is_healthy = true;
                true
            } else {
                false
            }
        };
        if flipped {
            info!(source, "Source recovered");
            self.recover(source).await;
        }
    }

    /// Re-shape every group that references the failed source.
    async fn failover(&self, source: &str) {
        let started = Instant::now();
        let mut actions: Vec<PortAction> = Vec::new();
        let mut events: Vec<OracleEvent> = Vec::new();

        {
            let health = self.health.read();
            let is_healthy = |exchange: &str| {
                health.get(exchange).map(|h| h.is_healthy).unwrap_or(false)
            };
            let mut groups = self.groups.write();
            for group in groups.values_mut().filter(|g| g.references(source)) {
                group.active.remove(source);
                group.failed.insert(source.to_string());

                let healthy_primaries: Vec<String> = group
                    .primary
                    .iter()
                    .filter(|p| {
                        !group.failed.contains(&p.exchange)
                            && is_healthy(&p.exchange)
                            && self.port.is_connected(&p.exchange)
                    })
                    .map(|p| p.exchange.clone())
                    .collect();

                if !healthy_primaries.is_empty() {
                    for primary in healthy_primaries {
                        group.active.insert(primary);
                    }
                    events.push(OracleEvent::FailoverCompleted {
                        feed: group.feed.clone(),
                        active: group.active.iter().cloned().collect(),
                    });
                    continue;
                }

                // No primary left: promote every healthy backup.
                let promotions: Vec<SourceRef> = group
                    .backup
                    .iter()
                    .filter(|b| {
                        !group.failed.contains(&b.exchange)
                            && !group.active.contains(&b.exchange)
                            && is_healthy(&b.exchange)
                    })
                    .cloned()
                    .collect();

                if promotions.is_empty() && group.active.is_empty() {
                    warn!(feed = %group.feed, "Failover failed: no healthy backup");
                    events.push(OracleEvent::FailoverFailed { feed: group.feed.clone() });
                    continue;
                }
                for backup in promotions {
                    group.active.insert(backup.exchange.clone());
                    actions.push(PortAction::Subscribe {
                        exchange: backup.exchange,
                        symbol: backup.symbol,
                    });
                }
                events.push(OracleEvent::FailoverCompleted {
                    feed: group.feed.clone(),
                    active: group.active.iter().cloned().collect(),
                });
            }
        }

        self.apply_actions(actions).await;
        for event in events {
            self.bus.publish(event);
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms > self.cfg.max_failover_ms {
            warn!(source, elapsed_ms, budget_ms = self.cfg.max_failover_ms, "Failover exceeded budget");
        } else {
            debug!(source, elapsed_ms, "Failover completed within budget");
        }
    }

    /// Reinstate a recovered source and demote now-redundant backups.
    async fn recover(&self, source: &str) {
        let mut actions: Vec<PortAction> = Vec::new();
        let mut events: Vec<OracleEvent> = Vec::new();

        {
            let health = self.health.read();
            let is_healthy = |exchange: &str| {
                health.get(exchange).map(|h| h.is_healthy).unwrap_or(false)
            };
            let mut groups = self.groups.write();
            for group in groups.values_mut().filter(|g| g.references(source)) {
                group.failed.remove(source);
                if group.is_primary(source) {
                    group.active.insert(source.to_string());
                }

                let primary_active = group
                    .primary
                    .iter()
                    .any(|p| group.active.contains(&p.exchange) && is_healthy(&p.exchange));

                let mut deactivated = Vec::new();
                if primary_active {
                    let redundant: Vec<String> = group
                        .active
                        .iter()
                        .filter(|a| group.backup_ref(a).is_some())
                        .cloned()
                        .collect();
                    for exchange in redundant {
                        group.active.remove(&exchange);
                        if let Some(backup) = group.backup_ref(&exchange) {
                            actions.push(PortAction::Unsubscribe {
                                exchange: backup.exchange.clone(),
                                symbol: backup.symbol.clone(),
                            });
                        }
                        deactivated.push(exchange);
                    }
                }
                events.push(OracleEvent::SourceRecovered {
                    feed: group.feed.clone(),
                    source: source.to_string(),
                    deactivated_backups: deactivated,
                });
            }
        }

        self.apply_actions(actions).await;
        for event in events {
            self.bus.publish(event);
        }
    }

    async fn apply_actions(&self, actions: Vec<PortAction>) {
        for action in actions {
            match action {
                PortAction::Subscribe { exchange, symbol } => {
                    if let Err(e) = self.port.subscribe(&exchange, std::slice::from_ref(&symbol)).await {
                        warn!(exchange = %exchange, symbol = %symbol, error = %e, "Backup subscribe failed");
                    }
                }
                PortAction::Unsubscribe { exchange, symbol } => {
                    if let Err(e) =
                        self.port.unsubscribe(&exchange, std::slice::from_ref(&symbol)).await
                    {
                        warn!(exchange = %exchange, symbol = %symbol, error = %e, "Backup unsubscribe failed");
                    }
                }
            }
        }
    }
}
