//! Shared WebSocket adapter runtime.
//!
//! [`WsAdapter`] implements [`ExchangeAdapter`] once for every protocol:
//! it owns the transport lifecycle (connect with retry, keepalive,
//! intentional vs. unexpected close), the subscription bookkeeping, and
//! the normalization of codec tickers into [`PriceUpdate`]s. Protocol
//! specifics are delegated to a [`ProtocolCodec`].
//!
//! # Tasks
//!
//! A connected adapter runs one read task (socket → events) and, for
//! protocols that need application-level pings, one keepalive task. Both
//! are aborted on disconnect before it returns, so no event is delivered
//! after `disconnect()`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::core::domain::{AdapterEvent, PriceUpdate};
use crate::core::exchange::confidence;
use crate::core::exchange::{
    AdapterTuning, ExchangeAdapter, FrameOutcome, ProtocolCodec, SymbolMap, Ticker, WsState,
};
use crate::core::service::Clock;
use crate::error::{Error, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// State shared between the adapter facade and its background tasks.
struct Shared {
    source: &'static str,
    events: mpsc::UnboundedSender<AdapterEvent>,
    state: Mutex<WsState>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    subscribed: Mutex<BTreeSet<String>>,
    /// Last connection-change value emitted, to guarantee alternation.
    last_emitted: Mutex<Option<bool>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
    /// Epoch millis of the last inbound frame of any kind.
    last_inbound_ms: AtomicI64,
    /// Probe latency EMA, stored as f64 bits.
    latency_bits: AtomicU64,
    clock: Clock,
}

impl Shared {
    fn emit_connection(&self, connected: bool) {
        let mut last = self.last_emitted.lock();
        if *last == Some(connected) {
            return;
        }
        *last = Some(connected);
        drop(last);
        let _ = self.events.send(AdapterEvent::ConnectionChange {
            source: self.source.to_string(),
            connected,
        });
    }

    fn record_latency(&self, sample_ms: f64) {
        const ALPHA: f64 = 0.2;
        let current = f64::from_bits(self.latency_bits.load(Ordering::Relaxed));
        let next = if current == 0.0 { sample_ms } else { ALPHA * sample_ms + (1.0 - ALPHA) * current };
        self.latency_bits.store(next.to_bits(), Ordering::Relaxed);
    }

    fn latency_ms(&self) -> f64 {
        f64::from_bits(self.latency_bits.load(Ordering::Relaxed))
    }

    fn mark_inbound(&self) {
        self.last_inbound_ms.store((self.clock)(), Ordering::Relaxed);
    }
}

/// Unexpected transport loss: flip state, notify once, drop the sink.
///
/// Intentional closes (`Closing`/`Closed`) are left untouched.
fn handle_transport_loss(shared: &Arc<Shared>) {
    {
        let mut state = shared.state.lock();
        match *state {
            WsState::Closing | WsState::Closed => return,
            _ => *state = WsState::Disconnected,
        }
    }
    shared.emit_connection(false);
    let cleanup = Arc::clone(shared);
    tokio::spawn(async move {
        cleanup.writer.lock().await.take();
    });
}

/// Generic exchange adapter: one codec, one socket, one event stream.
pub struct WsAdapter<C: ProtocolCodec> {
    codec: Arc<C>,
    symbols: Arc<SymbolMap>,
    tuning: AdapterTuning,
    http: reqwest::Client,
    shared: Arc<Shared>,
}

impl<C: ProtocolCodec> WsAdapter<C> {
    #[must_use]
    pub fn new(
        codec: C,
        symbols: SymbolMap,
        tuning: AdapterTuning,
        events: mpsc::UnboundedSender<AdapterEvent>,
        clock: Clock,
    ) -> Self {
        let source = codec.exchange_id();
        let http = reqwest::Client::builder()
            .user_agent(concat!("feedgate/", env!("CARGO_PKG_VERSION")))
            .timeout(tuning.rest_timeout)
            .build()
            .unwrap_or_default();
        Self {
            codec: Arc::new(codec),
            symbols: Arc::new(symbols),
            tuning,
            http,
            shared: Arc::new(Shared {
                source,
                events,
                state: Mutex::new(WsState::Disconnected),
                writer: tokio::sync::Mutex::new(None),
                subscribed: Mutex::new(BTreeSet::new()),
                last_emitted: Mutex::new(None),
                read_task: Mutex::new(None),
                keepalive_task: Mutex::new(None),
                last_inbound_ms: AtomicI64::new(0),
                latency_bits: AtomicU64::new(0),
                clock,
            }),
        }
    }

    fn spawn_read_task(&self, stream: WsSource) {
        let shared = Arc::clone(&self.shared);
        let codec = Arc::clone(&self.codec);
        let symbols = Arc::clone(&self.symbols);
        let reliability = self.codec.reliability();
        let handle = tokio::spawn(async move {
            read_loop(shared, codec, symbols, reliability, stream).await;
        });
        if let Some(old) = self.shared.read_task.lock().replace(handle) {
            old.abort();
        }
    }

    fn spawn_keepalive_task(&self) {
        let Some(ping) = self.codec.keepalive_frame() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        let interval = self.tuning.ping_interval;
        let pong_timeout = self.tuning.pong_timeout;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !matches!(*shared.state.lock(), WsState::Open) {
                    break;
                }
                let send_failed = {
                    let mut writer = shared.writer.lock().await;
                    match writer.as_mut() {
                        Some(w) => w.send(Message::Text(ping.clone())).await.is_err(),
                        None => true,
                    }
                };
                if send_failed {
                    warn!(exchange = shared.source, "Keepalive ping failed to send");
                    handle_transport_loss(&shared);
                    break;
                }
                // Give the server one timeout window to answer with
                // anything at all before declaring the link dead.
                tokio::time::sleep(pong_timeout).await;
                let last = shared.last_inbound_ms.load(Ordering::Relaxed);
                let silent_ms = (shared.clock)() - last;
                if last > 0 && silent_ms > pong_timeout.as_millis() as i64 {
                    warn!(exchange = shared.source, silent_ms, "No pong within timeout");
                    handle_transport_loss(&shared);
                    break;
                }
            }
        });
        if let Some(old) = self.shared.keepalive_task.lock().replace(handle) {
            old.abort();
        }
    }

    fn abort_tasks(&self) {
        if let Some(task) = self.shared.read_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.shared.keepalive_task.lock().take() {
            task.abort();
        }
    }
}

/// Socket read loop: classify frames, answer pings, push events.
async fn read_loop<C: ProtocolCodec>(
    shared: Arc<Shared>,
    codec: Arc<C>,
    symbols: Arc<SymbolMap>,
    reliability: f64,
    mut stream: WsSource,
) {
    while let Some(message) = stream.next().await {
        shared.mark_inbound();
        match message {
            Ok(Message::Text(text)) => {
                if codec.is_pong(&text) {
                    continue;
                }
                match codec.parse_frame(&text) {
                    FrameOutcome::Ticker(ticker) => {
                        dispatch_ticker(&shared, &symbols, reliability, ticker);
                    }
                    FrameOutcome::Ignore => {}
                    FrameOutcome::Malformed(reason) => {
                        // Malformed frames never impact source health.
                        debug!(exchange = shared.source, reason = %reason, "Dropping malformed frame");
                    }
                }
            }
            Ok(Message::Ping(payload)) => {
                let mut writer = shared.writer.lock().await;
                if let Some(w) = writer.as_mut() {
                    let _ = w.send(Message::Pong(payload)).await;
                }
            }
            Ok(Message::Close(frame)) => {
                info!(exchange = shared.source, frame = ?frame, "WebSocket closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(exchange = shared.source, error = %e, "WebSocket error");
                break;
            }
        }
    }
    handle_transport_loss(&shared);
}

/// Normalize a codec ticker into a [`PriceUpdate`].
///
/// Returns `None` for unmapped symbols; those frames are protocol noise,
/// not health-relevant failures.
fn normalize(shared: &Shared, symbols: &SymbolMap, reliability: f64, ticker: Ticker) -> Option<PriceUpdate> {
    let Some(canonical) = symbols.canonical(&ticker.native_symbol) else {
        debug!(exchange = shared.source, symbol = %ticker.native_symbol, "Dropping ticker for unmapped symbol");
        return None;
    };
    let now_ms = (shared.clock)();
    let timestamp_ms = ticker.timestamp_ms.unwrap_or(now_ms);
    let latency_ms = (now_ms - timestamp_ms).max(0) as f64;
    let spread = confidence::spread_pct(ticker.bid, ticker.ask);
    Some(PriceUpdate {
        symbol: canonical.to_string(),
        source: shared.source.to_string(),
        price: ticker.price,
        timestamp_ms,
        volume: ticker.volume,
        confidence: confidence::score(reliability, latency_ms, ticker.volume, spread),
    })
}

/// Normalize and emit one ticker from the read loop.
fn dispatch_ticker(shared: &Shared, symbols: &SymbolMap, reliability: f64, ticker: Ticker) {
    let Some(update) = normalize(shared, symbols, reliability, ticker) else {
        return;
    };
    if let Some(volume) = update.volume {
        let _ = shared.events.send(AdapterEvent::Volume {
            symbol: update.symbol.clone(),
            source: update.source.clone(),
            volume,
            timestamp_ms: update.timestamp_ms,
        });
    }
    let _ = shared.events.send(AdapterEvent::Price(update));
}

#[async_trait]
impl<C: ProtocolCodec> ExchangeAdapter for WsAdapter<C> {
    fn exchange_id(&self) -> &str {
        self.shared.source
    }

    async fn connect(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if matches!(*state, WsState::Open) {
                return Ok(());
            }
            *state = WsState::Connecting;
        }

        let url = self.codec.ws_url();
        let mut last_error = String::new();
        for attempt in 0..self.tuning.max_retries {
            if attempt > 0 {
                let delay = self.tuning.base_delay * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }
            debug!(exchange = self.shared.source, attempt, url = %url, "Connecting");
            match tokio::time::timeout(self.tuning.connection_timeout, connect_async(&url)).await {
                Ok(Ok((ws, response))) => {
                    info!(
                        exchange = self.shared.source,
                        status = %response.status(),
                        "WebSocket connected"
                    );
                    let (sink, stream) = ws.split();
                    *self.shared.writer.lock().await = Some(sink);
                    *self.shared.state.lock() = WsState::Open;
                    self.shared.mark_inbound();
                    self.shared.emit_connection(true);
                    self.spawn_read_task(stream);
                    self.spawn_keepalive_task();
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(exchange = self.shared.source, attempt, error = %e, "Connect attempt failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(exchange = self.shared.source, attempt, "Connect attempt timed out");
                    last_error = format!("timeout after {:?}", self.tuning.connection_timeout);
                }
            }
        }

        *self.shared.state.lock() = WsState::Disconnected;
        // One terminal error, one connection-change, after all attempts.
        let _ = self.shared.events.send(AdapterEvent::Error {
            source: self.shared.source.to_string(),
            message: last_error.clone(),
        });
        self.shared.emit_connection(false);
        Err(Error::Connection(format!(
            "{} refused after {} attempts: {last_error}",
            self.shared.source, self.tuning.max_retries
        )))
    }

    async fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                WsState::Open => *state = WsState::Closing,
                WsState::Closed => return Ok(()),
                _ => {
                    *state = WsState::Closed;
                    self.abort_tasks();
                    return Ok(());
                }
            }
        }

        // Stop delivery before the close handshake so no event can arrive
        // after disconnect() returns.
        self.abort_tasks();
        if let Some(mut sink) = self.shared.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        *self.shared.state.lock() = WsState::Closed;
        self.shared.emit_connection(false);
        info!(exchange = self.shared.source, "Disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(*self.shared.state.lock(), WsState::Open)
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Connection(format!("{} is not connected", self.shared.source)));
        }

        let mut valid = Vec::new();
        for symbol in symbols {
            if self.symbols.contains_native(symbol) && self.codec.valid_symbol(symbol) {
                valid.push(symbol.clone());
            } else {
                warn!(exchange = self.shared.source, symbol = %symbol, "Filtered invalid symbol");
            }
        }
        if valid.is_empty() {
            return Err(Error::Subscription(format!(
                "{}: no valid symbols to subscribe",
                self.shared.source
            )));
        }

        let frames = self.codec.subscribe_frames(&valid);
        let mut writer = self.shared.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| Error::Connection(format!("{} lost its socket", self.shared.source)))?;
        for frame in frames {
            sink.send(Message::Text(frame)).await?;
        }
        drop(writer);

        self.shared.subscribed.lock().extend(valid.iter().cloned());
        info!(exchange = self.shared.source, symbols = valid.len(), "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let targets: Vec<String> = {
            let subscribed = self.shared.subscribed.lock();
            symbols.iter().filter(|s| subscribed.contains(*s)).cloned().collect()
        };
        if targets.is_empty() {
            return Ok(());
        }

        let frames = self.codec.unsubscribe_frames(&targets);
        let mut writer = self.shared.writer.lock().await;
        if let Some(sink) = writer.as_mut() {
            for frame in frames {
                let _ = sink.send(Message::Text(frame)).await;
            }
        }
        drop(writer);

        let mut subscribed = self.shared.subscribed.lock();
        for symbol in &targets {
            subscribed.remove(symbol);
        }
        debug!(exchange = self.shared.source, symbols = targets.len(), "Unsubscribed");
        Ok(())
    }

    async fn fetch_ticker_rest(&self, symbol: &str) -> Option<PriceUpdate> {
        for attempt in 0..2u32 {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                self.tuning.rest_timeout,
                self.codec.fetch_ticker(&self.http, symbol),
            )
            .await;
            match outcome {
                Ok(Ok(ticker)) => {
                    self.shared.record_latency(started.elapsed().as_millis() as f64);
                    return normalize(&self.shared, &self.symbols, self.codec.reliability(), ticker);
                }
                Ok(Err(e)) => {
                    debug!(exchange = self.shared.source, symbol, attempt, error = %e, "REST ticker failed");
                }
                Err(_) => {
                    debug!(exchange = self.shared.source, symbol, attempt, "REST ticker timed out");
                }
            }
        }
        warn!(exchange = self.shared.source, symbol, "REST fallback exhausted");
        None
    }

    async fn health_check(&self) -> bool {
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.tuning.health_timeout, self.codec.rest_ping(&self.http)).await;
        match outcome {
            Ok(Ok(())) => {
                self.shared.record_latency(started.elapsed().as_millis() as f64);
                true
            }
            Ok(Err(e)) => {
                debug!(exchange = self.shared.source, error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                debug!(exchange = self.shared.source, "Health probe timed out");
                false
            }
        }
    }

    fn latency_ms(&self) -> f64 {
        self.shared.latency_ms()
    }
}

impl<C: ProtocolCodec> Drop for WsAdapter<C> {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
