//! Ingest fan-in and the feed-level query surface.
//!
//! Every adapter event lands here. Price updates are gated by the
//! freshness policy, validated against per-feed history, and stored in
//! bounded windows plus a latest-per-subscription cache. Queries
//! assemble fresh updates per active source (falling back to REST for
//! quiet subscriptions), batch-validate them, and hand the survivors to
//! the consensus aggregator.
//!
//! Connection changes are forwarded to the failover controller over a
//! one-way channel; the controller's `active_sources` view is read back
//! during collection. Neither side calls into the other.

mod freshness;
mod history;
mod throttle;

pub use freshness::{FreshnessPolicy, RejectReason};
pub use history::FeedHistory;
pub use throttle::LogThrottle;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::aggregator::ConsensusAggregator;
use crate::core::domain::{
    AdapterEvent, AggregatedPrice, ConnectionHealth, FeedConfig, FeedId, HealthEvent, PriceUpdate,
    VolumeObservation,
};
use crate::core::exchange::ExchangeAdapter;
use crate::core::failover::FailoverController;
use crate::core::service::{system_clock, Clock};
use crate::core::validator::{ValidationContext, Validator};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub historical_window: usize,
    pub cross_source_window_ms: i64,
    pub volume_window: usize,
    /// Cooldown for per-`{source, symbol}` quality warnings.
    pub quality_log_cooldown_ms: i64,
    /// A connection younger than this with recent data counts as ready
    /// even before its first health probe passes.
    pub readiness_window_ms: i64,
    pub policy: FreshnessPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            historical_window: 50,
            cross_source_window_ms: 10_000,
            volume_window: 256,
            quality_log_cooldown_ms: 300_000,
            readiness_window_ms: 5_000,
            policy: FreshnessPolicy::default(),
        }
    }
}

/// Connection and delivery bookkeeping for one source.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceMetrics {
    pub connected: bool,
    pub initialized: bool,
    pub last_update_ms: i64,
    pub updates: u64,
    pub errors: u64,
}

/// Counters for the metrics endpoint.
#[derive(Debug, Default)]
struct IngestCounters {
    updates_total: AtomicU64,
    rejected_total: AtomicU64,
    invalid_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct IngestStats {
    pub updates_total: u64,
    pub rejected_total: u64,
    pub invalid_total: u64,
}

pub struct DataManager {
    catalog: RwLock<HashMap<FeedId, FeedConfig>>,
    /// Canonical name → feed, for ingest routing.
    by_name: RwLock<HashMap<String, FeedId>>,
    adapters: RwLock<HashMap<String, Arc<dyn ExchangeAdapter>>>,
    /// Per-feed windows behind per-feed locks.
    histories: DashMap<String, Mutex<FeedHistory>>,
    /// Latest gated update per `(feed key, exchange)`, with arrival time.
    latest: DashMap<(String, String), (PriceUpdate, i64)>,
    /// Feeds that have produced at least one consensus; gates the
    /// cold-start fallback.
    consensus_seen: DashMap<String, ()>,
    metrics: DashMap<String, SourceMetrics>,
    validator: Arc<Validator>,
    aggregator: Arc<ConsensusAggregator>,
    failover: Arc<FailoverController>,
    health_tx: mpsc::UnboundedSender<HealthEvent>,
    throttle: LogThrottle,
    counters: IngestCounters,
    cfg: ManagerConfig,
    clock: Clock,
}

impl DataManager {
    #[must_use]
    pub fn new(
        catalog: Vec<FeedConfig>,
        validator: Arc<Validator>,
        aggregator: Arc<ConsensusAggregator>,
        failover: Arc<FailoverController>,
        health_tx: mpsc::UnboundedSender<HealthEvent>,
        cfg: ManagerConfig,
    ) -> Self {
        Self::with_clock(catalog, validator, aggregator, failover, health_tx, cfg, system_clock())
    }

    #[must_use]
    pub fn with_clock(
        catalog: Vec<FeedConfig>,
        validator: Arc<Validator>,
        aggregator: Arc<ConsensusAggregator>,
        failover: Arc<FailoverController>,
        health_tx: mpsc::UnboundedSender<HealthEvent>,
        cfg: ManagerConfig,
        clock: Clock,
    ) -> Self {
        let by_name = catalog.iter().map(|c| (c.feed.name.clone(), c.feed.clone())).collect();
        let catalog = catalog.into_iter().map(|c| (c.feed.clone(), c)).collect();
        Self {
            catalog: RwLock::new(catalog),
            by_name: RwLock::new(by_name),
            adapters: RwLock::new(HashMap::new()),
            histories: DashMap::new(),
            latest: DashMap::new(),
            consensus_seen: DashMap::new(),
            metrics: DashMap::new(),
            validator,
            aggregator,
            failover,
            health_tx,
            throttle: LogThrottle::new(cfg.quality_log_cooldown_ms),
            counters: IngestCounters::default(),
            cfg,
            clock,
        }
    }

    /// Spawn the ingest loop consuming adapter events until the channel
    /// closes.
    pub fn spawn_ingest(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<AdapterEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                manager.ingest(event);
            }
            debug!("Adapter event channel closed, ingest loop exiting");
        })
    }

    /// Register an adapter and probe it for readiness. The adapter's own
    /// `connect` carries the standardized retry.
    pub async fn add_data_source(&self, adapter: Arc<dyn ExchangeAdapter>) -> Result<()> {
        let source = adapter.exchange_id().to_string();
        self.adapters.write().insert(source.clone(), Arc::clone(&adapter));
        self.metrics.entry(source.clone()).or_default();

        if !adapter.is_connected() {
            adapter.connect().await?;
        }

        // Ready when connected and either a probe passes or the link is
        // young and already delivering.
        let probed = adapter.health_check().await;
        let ready = if probed {
            true
        } else {
            let now_ms = (self.clock)();
            self.metrics
                .get(&source)
                .map(|m| now_ms - m.last_update_ms < self.cfg.readiness_window_ms && m.updates > 0)
                .unwrap_or(false)
        };

        if let Some(mut metrics) = self.metrics.get_mut(&source) {
            metrics.connected = adapter.is_connected();
            metrics.initialized = ready;
        }
        if ready {
            info!(source = %source, "Data source initialized");
        } else {
            warn!(source = %source, "Data source connected but not yet ready");
        }
        Ok(())
    }

    /// Process one adapter event. Non-blocking; runs on the ingest task.
    pub fn ingest(&self, event: AdapterEvent) {
        match event {
            AdapterEvent::Price(update) => self.ingest_price(update),
            AdapterEvent::Volume { symbol, source, volume, timestamp_ms } => {
                self.ingest_volume(&symbol, source, volume, timestamp_ms);
            }
            AdapterEvent::ConnectionChange { source, connected } => {
                self.metrics.entry(source.clone()).or_default().connected = connected;
                let _ = self.health_tx.send(HealthEvent::ConnectionChange { source, connected });
            }
            AdapterEvent::Error { source, message } => {
                self.metrics.entry(source.clone()).or_default().errors += 1;
                warn!(source = %source, message = %message, "Adapter error");
            }
        }
    }

    fn ingest_price(&self, update: PriceUpdate) {
        let now_ms = (self.clock)();
        self.counters.updates_total.fetch_add(1, Ordering::Relaxed);

        if let Err(reason) = self.cfg.policy.gate(&update) {
            self.counters.rejected_total.fetch_add(1, Ordering::Relaxed);
            if self.throttle.allow(&update.source, &update.symbol, now_ms) {
                warn!(
                    source = %update.source,
                    symbol = %update.symbol,
                    reason = ?reason,
                    price = update.price,
                    "Rejected broken update"
                );
            }
            return;
        }

        let Some(feed) = self.by_name.read().get(&update.symbol).cloned() else {
            debug!(symbol = %update.symbol, source = %update.source, "Update for uncataloged feed");
            return;
        };
        let key = feed.key();

        let slot = self.histories.entry(key.clone()).or_default();
        let (historical, cross_source) = {
            let history = slot.lock();
            (history.price_values(), history.cross_source_snapshot())
        };
        let ctx = ValidationContext {
            historical: &historical,
            cross_source: &cross_source,
            consensus_median: None,
        };
        let outcome = self.validator.validate(&feed, &update, &ctx);
        let adjusted = outcome.adjusted.clone();
        {
            let mut history = slot.lock();
            if outcome.is_valid {
                history.push_price(adjusted.clone(), self.cfg.historical_window);
            }
            history.push_cross_source(adjusted.clone(), self.cfg.cross_source_window_ms, now_ms);
        }
        drop(slot);

        if !outcome.is_valid {
            self.counters.invalid_total.fetch_add(1, Ordering::Relaxed);
            if self.throttle.allow(&update.source, &update.symbol, now_ms) {
                warn!(
                    source = %update.source,
                    symbol = %update.symbol,
                    faults = outcome.faults.len(),
                    worst = ?outcome.worst_severity(),
                    "Update failed validation"
                );
            }
        }

        self.latest.insert((key, adjusted.source.clone()), (adjusted.clone(), now_ms));
        let mut metrics = self.metrics.entry(adjusted.source).or_default();
        metrics.last_update_ms = now_ms;
        metrics.updates += 1;
    }

    fn ingest_volume(&self, symbol: &str, source: String, volume: f64, timestamp_ms: i64) {
        if !volume.is_finite() || volume < 0.0 {
            return;
        }
        let Some(feed) = self.by_name.read().get(symbol).cloned() else {
            return;
        };
        let slot = self.histories.entry(feed.key()).or_default();
        slot.lock().push_volume(
            VolumeObservation { source, volume, timestamp_ms },
            self.cfg.volume_window,
        );
    }

    /// Assemble fresh updates for one feed and aggregate them.
    pub async fn current_price(&self, feed: &FeedId) -> Result<AggregatedPrice> {
        let config = self
            .catalog
            .read()
            .get(feed)
            .cloned()
            .ok_or_else(|| Error::UnknownFeed(feed.to_string()))?;
        let key = feed.key();
        let now_ms = (self.clock)();

        // The failover controller decides which sources are queried.
        let active = self
            .failover
            .active_sources(feed)
            .unwrap_or_else(|| config.sources.iter().map(|s| s.exchange.clone()).collect());

        let mut collected: Vec<PriceUpdate> = Vec::new();
        let mut fetches = Vec::new();
        for source in config.sources.iter().filter(|s| active.contains(&s.exchange)) {
            if let Some(entry) = self.latest.get(&(key.clone(), source.exchange.clone())) {
                let (update, _) = entry.value();
                if self.cfg.policy.is_fresh(update, now_ms) {
                    collected.push(update.clone());
                    continue;
                }
            }
            // Quiet subscription: fall back to REST.
            let adapter = self.adapters.read().get(&source.exchange).cloned();
            if let Some(adapter) = adapter {
                let symbol = source.symbol.clone();
                fetches.push(async move { adapter.fetch_ticker_rest(&symbol).await });
            }
        }

        for update in join_all(fetches).await.into_iter().flatten() {
            match self.cfg.policy.gate(&update) {
                Ok(()) => collected.push(update),
                Err(reason) => {
                    if self.throttle.allow(&update.source, &update.symbol, now_ms) {
                        warn!(
                            source = %update.source,
                            symbol = %update.symbol,
                            reason = ?reason,
                            "REST fallback returned broken update"
                        );
                    }
                }
            }
        }

        if collected.is_empty() {
            return Err(Error::InsufficientData { feed: feed.clone() });
        }

        let (historical, cross_source) = match self.histories.get(&key) {
            Some(slot) => {
                let history = slot.lock();
                (history.price_values(), history.cross_source_snapshot())
            }
            None => (Vec::new(), Vec::new()),
        };
        let ctx = ValidationContext {
            historical: &historical,
            cross_source: &cross_source,
            consensus_median: None,
        };
        let outcomes = self.validator.validate_batch(feed, &collected, &ctx);
        let valid: Vec<PriceUpdate> = outcomes
            .into_values()
            .filter(|o| o.is_valid)
            .map(|o| o.adjusted)
            .collect();

        match self.aggregator.aggregate(feed, &valid) {
            Ok(result) => {
                self.consensus_seen.insert(key, ());
                Ok(result)
            }
            // Before the first consensus ever forms for a feed, a
            // weighted mean over whatever was collected beats no answer.
            // Once consensus has existed, thin data fails loudly instead.
            Err(e) if e.is_insufficient_data() && !self.consensus_seen.contains_key(&key) => {
                debug!(feed = %feed, error = %e, "Consensus unavailable, using cold-start mean");
                cold_start_mean(feed, &collected, now_ms).ok_or(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort parallel fan-out over many feeds. Failures are
    /// reported per feed, never fatal for the batch.
    pub async fn current_prices(
        &self,
        feeds: &[FeedId],
    ) -> Vec<(FeedId, Result<AggregatedPrice>)> {
        let queries = feeds.iter().map(|feed| async move {
            let result = self.current_price(feed).await;
            if let Err(e) = &result {
                debug!(feed = %feed, error = %e, "Feed query failed");
            }
            (feed.clone(), result)
        });
        join_all(queries).await
    }

    /// Connection summary across registered sources.
    #[must_use]
    pub fn connection_health(&self) -> ConnectionHealth {
        let adapters = self.adapters.read();
        let total = adapters.len();
        let mut connected = 0usize;
        let mut latency_sum = 0.0;
        let mut failed = Vec::new();
        for (source, adapter) in adapters.iter() {
            if adapter.is_connected() {
                connected += 1;
                latency_sum += adapter.latency_ms();
            } else {
                failed.push(source.clone());
            }
        }
        failed.sort();
        ConnectionHealth {
            total_sources: total,
            connected_sources: connected,
            average_latency_ms: if connected > 0 { latency_sum / connected as f64 } else { 0.0 },
            failed_sources: failed,
            health_score: if total > 0 { 100.0 * connected as f64 / total as f64 } else { 100.0 },
        }
    }

    /// Milliseconds since the newest arrival for this feed; `None` when
    /// nothing has arrived yet.
    #[must_use]
    pub fn data_freshness_ms(&self, feed: &FeedId) -> Option<i64> {
        let key = feed.key();
        let newest = self
            .latest
            .iter()
            .filter(|entry| entry.key().0 == key)
            .map(|entry| entry.value().1)
            .max()?;
        Some(((self.clock)() - newest).max(0))
    }

    /// Aggregate reported volume for a feed inside `[start_ms, end_ms]`.
    pub fn volume_between(&self, feed: &FeedId, start_ms: i64, end_ms: i64) -> Result<f64> {
        if !self.catalog.read().contains_key(feed) {
            return Err(Error::UnknownFeed(feed.to_string()));
        }
        Ok(self
            .histories
            .get(&feed.key())
            .map(|slot| slot.lock().volume_between(start_ms, end_ms))
            .unwrap_or(0.0))
    }

    /// Background sweep for cross-source windows and the validation
    /// cache.
    pub fn sweep_windows(&self) {
        let now_ms = (self.clock)();
        for slot in self.histories.iter() {
            slot.value().lock().sweep_cross_source(self.cfg.cross_source_window_ms, now_ms);
        }
        self.validator.sweep_cache();
    }

    /// Replace the catalog (runtime reload).
    pub fn update_catalog(&self, catalog: Vec<FeedConfig>) {
        let mut by_name = self.by_name.write();
        let mut current = self.catalog.write();
        by_name.clear();
        current.clear();
        for config in catalog {
            by_name.insert(config.feed.name.clone(), config.feed.clone());
            current.insert(config.feed.clone(), config);
        }
        info!(feeds = current.len(), "Feed catalog reloaded");
    }

    #[must_use]
    pub fn catalog_entry(&self, feed: &FeedId) -> Option<FeedConfig> {
        self.catalog.read().get(feed).cloned()
    }

    #[must_use]
    pub fn feeds(&self) -> Vec<FeedConfig> {
        self.catalog.read().values().cloned().collect()
    }

    /// At least one source is connected and initialized.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.metrics.iter().any(|m| m.connected && m.initialized)
    }

    #[must_use]
    pub fn source_metrics(&self, source: &str) -> Option<SourceMetrics> {
        self.metrics.get(source).map(|m| m.clone())
    }

    #[must_use]
    pub fn stats(&self) -> IngestStats {
        IngestStats {
            updates_total: self.counters.updates_total.load(Ordering::Relaxed),
            rejected_total: self.counters.rejected_total.load(Ordering::Relaxed),
            invalid_total: self.counters.invalid_total.load(Ordering::Relaxed),
        }
    }
}

/// Cold-start fallback: confidence-weighted mean over whatever was
/// collected, when the consensus path has nothing fresh enough.
fn cold_start_mean(feed: &FeedId, collected: &[PriceUpdate], now_ms: i64) -> Option<AggregatedPrice> {
    let weight_sum: f64 = collected.iter().map(|u| u.confidence).sum();
    if collected.is_empty() || weight_sum <= 0.0 {
        return None;
    }
    let price = collected.iter().map(|u| u.confidence * u.price).sum::<f64>() / weight_sum;
    if !(price.is_finite() && price > 0.0) {
        return None;
    }
    let mut sources: Vec<String> = collected.iter().map(|u| u.source.clone()).collect();
    sources.sort();
    sources.dedup();
    let mean_confidence = weight_sum / collected.len() as f64;
    Some(AggregatedPrice {
        symbol: feed.name.clone(),
        price,
        timestamp_ms: now_ms,
        sources,
        // A mean over unvetted points earns reduced confidence and no
        // consensus claim.
        confidence: (0.5 * mean_confidence).clamp(0.0, 1.0),
        consensus_score: 0.0,
    })
}
