//! WebSocket orchestration: the single owner of adapter lifecycles.
//!
//! The orchestrator reads the feed catalog, computes the union of
//! required symbols per exchange, connects every adapter exactly once,
//! batches subscriptions, and serves reconnect requests behind a
//! per-exchange cooldown. Per-exchange state sits behind its own async
//! mutex so concurrent subscribe calls serialize per exchange and
//! `subscribed_symbols ⊆ required_symbols` always holds.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::domain::{FeedConfig, FeedId};
use crate::core::exchange::ExchangeAdapter;
use crate::core::failover::SubscriptionPort;
use crate::core::service::{system_clock, Clock};
use crate::error::{Error, Result};

/// Minimum spacing between connection attempts per exchange.
pub const RECONNECT_COOLDOWN: Duration = Duration::from_secs(10);

/// Per-exchange bookkeeping, guarded by one async mutex per exchange.
struct ExchangeState {
    adapter: Arc<dyn ExchangeAdapter>,
    /// Cached connection flag, reconciled against the adapter's
    /// authoritative `is_connected()` whenever it is read.
    connected: bool,
    last_attempt_ms: i64,
    subscribed: BTreeSet<String>,
    required: BTreeSet<String>,
}

/// Connection snapshot for one exchange.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeStatus {
    pub connected: bool,
    pub subscribed_count: usize,
    pub required_count: usize,
}

pub struct WebSocketOrchestrator {
    exchanges: HashMap<String, Mutex<ExchangeState>>,
    /// Lock-free adapter handles for read-only accessors.
    adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
    catalog: RwLock<HashMap<FeedId, FeedConfig>>,
    cooldown: Duration,
    initialized: AtomicBool,
    clock: Clock,
}

impl WebSocketOrchestrator {
    /// Build from the catalog and one adapter per referenced exchange.
    #[must_use]
    pub fn new(
        catalog: Vec<FeedConfig>,
        adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
    ) -> Self {
        Self::with_clock(catalog, adapters, system_clock())
    }

    #[must_use]
    pub fn with_clock(
        catalog: Vec<FeedConfig>,
        adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
        clock: Clock,
    ) -> Self {
        let exchanges = adapters
            .iter()
            .map(|(exchange, adapter)| {
                (
                    exchange.clone(),
                    Mutex::new(ExchangeState {
                        adapter: Arc::clone(adapter),
                        connected: false,
                        last_attempt_ms: 0,
                        subscribed: BTreeSet::new(),
                        required: BTreeSet::new(),
                    }),
                )
            })
            .collect();
        Self {
            exchanges,
            adapters,
            catalog: RwLock::new(catalog.into_iter().map(|c| (c.feed.clone(), c)).collect()),
            cooldown: RECONNECT_COOLDOWN,
            initialized: AtomicBool::new(false),
            clock,
        }
    }

    #[cfg(any(test, feature = "testkit"))]
    pub fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }

    /// Union of required symbols per exchange over the whole catalog.
    ///
    /// Only primary sources count: backups enter an exchange's required
    /// set when the failover controller promotes them.
    fn required_by_exchange(&self) -> HashMap<String, BTreeSet<String>> {
        let mut required: HashMap<String, BTreeSet<String>> = HashMap::new();
        for config in self.catalog.read().values() {
            for source in config.sources.iter().filter(|s| !s.backup) {
                required.entry(source.exchange.clone()).or_default().insert(source.symbol.clone());
            }
        }
        required
    }

    /// Connect every referenced adapter and issue one batched subscribe
    /// per exchange. Idempotent; later calls return immediately.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("Orchestrator already initialized");
            return Ok(());
        }

        let mut required = self.required_by_exchange();
        info!(exchanges = self.exchanges.len(), "Bringing up exchange connections");

        // Connect every adapter in parallel — backup-only exchanges too,
        // so a later promotion finds a live link. One exchange failing
        // never blocks another.
        let bring_ups = self.exchanges.iter().map(|(exchange, state)| {
            let symbols = required.remove(exchange).unwrap_or_default();
            async move {
                let mut state = state.lock().await;
                state.required = symbols;
                state.last_attempt_ms = (self.clock)();
                match state.adapter.connect().await {
                    Ok(()) => {
                        state.connected = true;
                        if state.required.is_empty() {
                            return;
                        }
                        let batch: Vec<String> = state.required.iter().cloned().collect();
                        if let Err(e) = state.adapter.subscribe(&batch).await {
                            warn!(exchange = %exchange, error = %e, "Initial subscribe failed");
                        } else {
                            state.subscribed.extend(batch);
                        }
                    }
                    Err(e) => {
                        state.connected = false;
                        warn!(exchange = %exchange, error = %e, "Initial connect failed");
                    }
                }
            }
        });
        join_all(bring_ups).await;
        Ok(())
    }

    /// Additively subscribe every source of one feed.
    ///
    /// Idempotent: repeated calls leave `required` and `subscribed`
    /// unchanged. Serializes per exchange.
    pub async fn subscribe_to_feed(&self, feed: &FeedId) -> Result<()> {
        let config = self
            .catalog
            .read()
            .get(feed)
            .cloned()
            .ok_or_else(|| Error::UnknownFeed(feed.to_string()))?;

        for source in config.sources.iter().filter(|s| !s.backup) {
            let Some(state) = self.exchanges.get(&source.exchange) else {
                warn!(exchange = %source.exchange, feed = %feed, "Feed references unknown exchange");
                continue;
            };
            let mut state = state.lock().await;
            state.required.insert(source.symbol.clone());
            if state.subscribed.contains(&source.symbol) {
                continue;
            }
            if !state.adapter.is_connected() {
                debug!(exchange = %source.exchange, symbol = %source.symbol, "Deferred subscribe until reconnect");
                continue;
            }
            match state.adapter.subscribe(std::slice::from_ref(&source.symbol)).await {
                Ok(()) => {
                    state.subscribed.insert(source.symbol.clone());
                }
                Err(e) => {
                    warn!(exchange = %source.exchange, symbol = %source.symbol, error = %e, "Subscribe failed");
                }
            }
        }
        Ok(())
    }

    /// Register (or replace) a feed in the catalog and subscribe it.
    pub async fn register_feed(&self, config: FeedConfig) -> Result<()> {
        let feed = config.feed.clone();
        self.catalog.write().insert(feed.clone(), config);
        self.subscribe_to_feed(&feed).await
    }

    /// Demand-driven reconnect. Skipped (returns false) while the
    /// adapter reports connected or the cooldown since the last attempt
    /// has not elapsed; a successful connect still records the attempt.
    pub async fn reconnect_exchange(&self, exchange: &str) -> bool {
        let Some(state) = self.exchanges.get(exchange) else {
            return false;
        };
        let mut state = state.lock().await;

        if state.adapter.is_connected() {
            state.connected = true;
            return false;
        }
        state.connected = false;

        let now_ms = (self.clock)();
        let since_last = now_ms - state.last_attempt_ms;
        if since_last < self.cooldown.as_millis() as i64 {
            debug!(exchange, since_last_ms = since_last, "Reconnect within cooldown, skipped");
            return false;
        }
        state.last_attempt_ms = now_ms;

        match state.adapter.connect().await {
            Ok(()) => {
                state.connected = true;
                let batch: Vec<String> = state.required.iter().cloned().collect();
                if batch.is_empty() {
                    return true;
                }
                match state.adapter.subscribe(&batch).await {
                    Ok(()) => {
                        state.subscribed = state.required.clone();
                        info!(exchange, symbols = state.subscribed.len(), "Reconnected and resubscribed");
                    }
                    Err(e) => warn!(exchange, error = %e, "Resubscribe after reconnect failed"),
                }
                true
            }
            Err(e) => {
                warn!(exchange, error = %e, "Reconnect failed");
                false
            }
        }
    }

    /// Per-exchange snapshot, re-reading each adapter's authoritative
    /// connection state.
    pub async fn connection_status(&self) -> HashMap<String, ExchangeStatus> {
        let mut status = HashMap::new();
        for (exchange, state) in &self.exchanges {
            let mut state = state.lock().await;
            let connected = state.adapter.is_connected();
            state.connected = connected;
            status.insert(
                exchange.clone(),
                ExchangeStatus {
                    connected,
                    subscribed_count: state.subscribed.len(),
                    required_count: state.required.len(),
                },
            );
        }
        status
    }

    /// The adapter for one exchange, if registered.
    #[must_use]
    pub fn adapter(&self, exchange: &str) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters.get(exchange).cloned()
    }

    /// All registered exchange ids.
    #[must_use]
    pub fn exchange_ids(&self) -> Vec<String> {
        self.exchanges.keys().cloned().collect()
    }

    /// Disconnect every adapter; failures are logged and swallowed.
    pub async fn cleanup(&self) {
        for (exchange, state) in &self.exchanges {
            let mut state = state.lock().await;
            if let Err(e) = state.adapter.disconnect().await {
                warn!(exchange = %exchange, error = %e, "Disconnect failed during cleanup");
            }
            state.connected = false;
        }
        info!("All exchange connections closed");
    }
}

#[async_trait]
impl SubscriptionPort for WebSocketOrchestrator {
    async fn subscribe(&self, exchange: &str, symbols: &[String]) -> Result<()> {
        let state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| Error::Config(format!("unknown exchange {exchange:?}")))?;
        let mut state = state.lock().await;
        for symbol in symbols {
            state.required.insert(symbol.clone());
        }
        state.adapter.subscribe(symbols).await?;
        state.subscribed.extend(symbols.iter().cloned());
        Ok(())
    }

    async fn unsubscribe(&self, exchange: &str, symbols: &[String]) -> Result<()> {
        let state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| Error::Config(format!("unknown exchange {exchange:?}")))?;
        let mut state = state.lock().await;
        state.adapter.unsubscribe(symbols).await?;
        for symbol in symbols {
            state.subscribed.remove(symbol);
            // Demoted symbols leave the required set too, so a later
            // reconnect does not resubscribe them.
            state.required.remove(symbol);
        }
        Ok(())
    }

    fn is_connected(&self, exchange: &str) -> bool {
        self.adapters.get(exchange).map(|a| a.is_connected()).unwrap_or(false)
    }

    fn latency_ms(&self, exchange: &str) -> f64 {
        self.adapters.get(exchange).map(|a| a.latency_ms()).unwrap_or(0.0)
    }
}
