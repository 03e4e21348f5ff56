//! Binance protocol codec.
//!
//! Stream frames come from the combined `<symbol>@ticker` channel;
//! subscriptions are managed with `SUBSCRIBE`/`UNSUBSCRIBE` method
//! frames. Binance drives keepalive with WebSocket-level pings, so no
//! application ping is needed. REST fallback uses the 24h ticker
//! endpoint and `/api/v3/ping` as the liveness probe.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::exchange::protocol::{parse_price, parse_quantity};
use crate::core::exchange::{FrameOutcome, ProtocolCodec, Ticker};
use crate::error::{Error, Result};

const WS_URL: &str = "wss://stream.binance.com:9443/ws";
const REST_URL: &str = "https://api.binance.com";

/// 24h ticker event as delivered on `<symbol>@ticker`.
#[derive(Debug, Deserialize)]
struct TickerEvent {
    /// Event type; always `24hrTicker` for this channel.
    #[serde(rename = "e")]
    event_type: String,
    /// Event time in epoch milliseconds.
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    /// Last price, as a string for precision preservation.
    #[serde(rename = "c")]
    last_price: String,
    /// 24h base asset volume.
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "b")]
    bid: String,
    #[serde(rename = "a")]
    ask: String,
}

/// REST 24h ticker response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestTicker {
    symbol: String,
    last_price: String,
    volume: String,
    bid_price: String,
    ask_price: String,
    close_time: i64,
}

pub struct BinanceCodec {
    ws_url: String,
    rest_url: String,
    /// Monotonic id for SUBSCRIBE/UNSUBSCRIBE frames.
    next_id: AtomicU64,
}

impl BinanceCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_endpoints(WS_URL, REST_URL)
    }

    #[must_use]
    pub fn with_endpoints(ws_url: impl Into<String>, rest_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            rest_url: rest_url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    fn method_frame(&self, method: &str, symbols: &[String]) -> String {
        let params: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@ticker", s.to_lowercase()))
            .collect();
        serde_json::json!({
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        })
        .to_string()
    }
}

impl Default for BinanceCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolCodec for BinanceCodec {
    fn exchange_id(&self) -> &'static str {
        "binance"
    }

    fn ws_url(&self) -> String {
        self.ws_url.clone()
    }

    fn reliability(&self) -> f64 {
        0.95
    }

    fn valid_symbol(&self, symbol: &str) -> bool {
        !symbol.is_empty()
            && symbol.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    fn subscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        vec![self.method_frame("SUBSCRIBE", symbols)]
    }

    fn unsubscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        vec![self.method_frame("UNSUBSCRIBE", symbols)]
    }

    fn parse_frame(&self, text: &str) -> FrameOutcome {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return FrameOutcome::Malformed(e.to_string()),
        };
        // Method acks look like {"result":null,"id":1}.
        if value.get("id").is_some() {
            return FrameOutcome::Ignore;
        }
        if value.get("e").and_then(|e| e.as_str()) != Some("24hrTicker") {
            return FrameOutcome::Ignore;
        }
        let event: TickerEvent = match serde_json::from_value(value) {
            Ok(e) => e,
            Err(e) => return FrameOutcome::Malformed(e.to_string()),
        };
        debug_assert_eq!(event.event_type, "24hrTicker");
        let price = match parse_price(&event.last_price) {
            Ok(p) => p,
            Err(reason) => return FrameOutcome::Malformed(reason),
        };
        FrameOutcome::Ticker(Ticker {
            native_symbol: event.symbol,
            price,
            volume: parse_quantity(&event.volume),
            bid: parse_quantity(&event.bid).filter(|b| *b > 0.0),
            ask: parse_quantity(&event.ask).filter(|a| *a > 0.0),
            timestamp_ms: Some(event.event_time),
        })
    }

    async fn fetch_ticker(&self, http: &reqwest::Client, symbol: &str) -> Result<Ticker> {
        let url = format!("{}/api/v3/ticker/24hr", self.rest_url);
        let ticker: RestTicker = http
            .get(url)
            .query(&[("symbol", symbol)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let price = parse_price(&ticker.last_price).map_err(Error::Subscription)?;
        Ok(Ticker {
            native_symbol: ticker.symbol,
            price,
            volume: parse_quantity(&ticker.volume),
            bid: parse_quantity(&ticker.bid_price).filter(|b| *b > 0.0),
            ask: parse_quantity(&ticker.ask_price).filter(|a| *a > 0.0),
            timestamp_ms: Some(ticker.close_time),
        })
    }

    async fn rest_ping(&self, http: &reqwest::Client) -> Result<()> {
        let url = format!("{}/api/v3/ping", self.rest_url);
        http.get(url).send().await?.error_for_status()?;
        Ok(())
    }
}
