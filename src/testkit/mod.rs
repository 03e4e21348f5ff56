//! Test doubles and fixtures shared by unit and integration tests.
//!
//! Enabled with the `testkit` feature (the crate's own dev-dependency
//! turns it on for `tests/`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::core::domain::{AdapterEvent, FeedCategory, FeedConfig, FeedId, FeedSource, PriceUpdate};
use crate::core::exchange::ExchangeAdapter;
use crate::error::{Error, Result};

/// Scriptable in-memory adapter.
///
/// Tests flip its connection and health flags, preload REST responses,
/// and push events into the pipeline as if a socket had delivered them.
pub struct MockAdapter {
    id: String,
    connected: AtomicBool,
    healthy: AtomicBool,
    fail_connect: AtomicBool,
    latency_ms: Mutex<f64>,
    pub connect_calls: AtomicU32,
    pub subscribe_calls: Mutex<Vec<Vec<String>>>,
    pub unsubscribe_calls: Mutex<Vec<Vec<String>>>,
    rest_tickers: Mutex<HashMap<String, PriceUpdate>>,
    events: Mutex<Option<mpsc::UnboundedSender<AdapterEvent>>>,
}

impl MockAdapter {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            connected: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            fail_connect: AtomicBool::new(false),
            latency_ms: Mutex::new(10.0),
            connect_calls: AtomicU32::new(0),
            subscribe_calls: Mutex::new(Vec::new()),
            unsubscribe_calls: Mutex::new(Vec::new()),
            rest_tickers: Mutex::new(HashMap::new()),
            events: Mutex::new(None),
        })
    }

    /// Wire the adapter to the pipeline's event channel.
    pub fn attach(&self, tx: mpsc::UnboundedSender<AdapterEvent>) {
        *self.events.lock() = Some(tx);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency_ms: f64) {
        *self.latency_ms.lock() = latency_ms;
    }

    /// Preload the REST fallback answer for a native symbol.
    pub fn set_rest_ticker(&self, symbol: impl Into<String>, update: PriceUpdate) {
        self.rest_tickers.lock().insert(symbol.into(), update);
    }

    /// Deliver a price update as if it arrived on the socket.
    pub fn emit_price(&self, update: PriceUpdate) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(AdapterEvent::Price(update));
        }
    }

    /// Deliver a connection change, flipping the transport flag too.
    pub fn emit_connection(&self, connected: bool) {
        self.set_connected(connected);
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(AdapterEvent::ConnectionChange {
                source: self.id.clone(),
                connected,
            });
        }
    }

    #[must_use]
    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.subscribe_calls.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl ExchangeAdapter for MockAdapter {
    fn exchange_id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!("{} refused", self.id)));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Connection(format!("{} is not connected", self.id)));
        }
        self.subscribe_calls.lock().push(symbols.to_vec());
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<()> {
        self.unsubscribe_calls.lock().push(symbols.to_vec());
        Ok(())
    }

    async fn fetch_ticker_rest(&self, symbol: &str) -> Option<PriceUpdate> {
        self.rest_tickers.lock().get(symbol).cloned()
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn latency_ms(&self) -> f64 {
        *self.latency_ms.lock()
    }
}

/// A BTC/USD catalog entry with binance+coinbase primaries and a kraken
/// backup — the standard failover fixture.
#[must_use]
pub fn btc_feed_config() -> FeedConfig {
    FeedConfig {
        feed: FeedId::new(FeedCategory::Crypto, "BTC/USD").unwrap(),
        sources: vec![
            FeedSource { exchange: "binance".into(), symbol: "BTC/USD".into(), backup: false },
            FeedSource { exchange: "coinbase".into(), symbol: "BTC/USD".into(), backup: false },
            FeedSource { exchange: "kraken".into(), symbol: "BTC/USD".into(), backup: true },
        ],
        decimals: 8,
    }
}

/// Shorthand price update fixture.
#[must_use]
pub fn price_update(
    source: &str,
    symbol: &str,
    price: f64,
    timestamp_ms: i64,
    confidence: f64,
) -> PriceUpdate {
    PriceUpdate {
        symbol: symbol.to_string(),
        source: source.to_string(),
        price,
        timestamp_ms,
        volume: Some(1_000.0),
        confidence,
    }
}
