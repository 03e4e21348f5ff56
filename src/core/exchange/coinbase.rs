//! Coinbase Exchange protocol codec.
//!
//! Subscribes to the `ticker` channel by product id. Timestamps arrive
//! as ISO 8601 strings and are converted to epoch milliseconds. REST
//! fallback reads `/products/{id}/ticker`; `/time` serves as the probe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::core::exchange::protocol::{parse_price, parse_quantity};
use crate::core::exchange::{FrameOutcome, ProtocolCodec, Ticker};
use crate::error::{Error, Result};

const WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";
const REST_URL: &str = "https://api.exchange.coinbase.com";

#[derive(Debug, Deserialize)]
struct TickerMessage {
    product_id: String,
    price: String,
    #[serde(default)]
    volume_24h: Option<String>,
    #[serde(default)]
    best_bid: Option<String>,
    #[serde(default)]
    best_ask: Option<String>,
    #[serde(default)]
    time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RestTicker {
    price: String,
    #[serde(default)]
    volume: Option<String>,
    #[serde(default)]
    bid: Option<String>,
    #[serde(default)]
    ask: Option<String>,
    #[serde(default)]
    time: Option<String>,
}

pub struct CoinbaseCodec {
    ws_url: String,
    rest_url: String,
}

impl CoinbaseCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_endpoints(WS_URL, REST_URL)
    }

    #[must_use]
    pub fn with_endpoints(ws_url: impl Into<String>, rest_url: impl Into<String>) -> Self {
        Self { ws_url: ws_url.into(), rest_url: rest_url.into() }
    }
}

impl Default for CoinbaseCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn iso_to_ms(iso: Option<&str>) -> Option<i64> {
    let parsed: DateTime<Utc> = iso?.parse().ok()?;
    Some(parsed.timestamp_millis())
}

fn optional_quantity(raw: Option<&str>) -> Option<f64> {
    parse_quantity(raw?).filter(|v| *v > 0.0)
}

#[async_trait]
impl ProtocolCodec for CoinbaseCodec {
    fn exchange_id(&self) -> &'static str {
        "coinbase"
    }

    fn ws_url(&self) -> String {
        self.ws_url.clone()
    }

    fn reliability(&self) -> f64 {
        0.93
    }

    fn valid_symbol(&self, symbol: &str) -> bool {
        // Product ids look like BTC-USD.
        let mut parts = symbol.splitn(3, '-');
        matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(base), Some(quote), None) if !base.is_empty() && !quote.is_empty()
        )
    }

    fn subscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        vec![serde_json::json!({
            "type": "subscribe",
            "product_ids": symbols,
            "channels": ["ticker"],
        })
        .to_string()]
    }

    fn unsubscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        vec![serde_json::json!({
            "type": "unsubscribe",
            "product_ids": symbols,
            "channels": ["ticker"],
        })
        .to_string()]
    }

    fn parse_frame(&self, text: &str) -> FrameOutcome {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return FrameOutcome::Malformed(e.to_string()),
        };
        match value.get("type").and_then(|t| t.as_str()) {
            Some("ticker") => {}
            Some("error") => {
                let reason = value
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unspecified server error");
                return FrameOutcome::Malformed(reason.to_string());
            }
            // subscriptions acks, heartbeats, etc.
            Some(_) => return FrameOutcome::Ignore,
            None => return FrameOutcome::Malformed("frame without type".to_string()),
        }
        let message: TickerMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => return FrameOutcome::Malformed(e.to_string()),
        };
        let price = match parse_price(&message.price) {
            Ok(p) => p,
            Err(reason) => return FrameOutcome::Malformed(reason),
        };
        FrameOutcome::Ticker(Ticker {
            native_symbol: message.product_id,
            price,
            volume: message.volume_24h.as_deref().and_then(parse_quantity),
            bid: optional_quantity(message.best_bid.as_deref()),
            ask: optional_quantity(message.best_ask.as_deref()),
            timestamp_ms: iso_to_ms(message.time.as_deref()),
        })
    }

    async fn fetch_ticker(&self, http: &reqwest::Client, symbol: &str) -> Result<Ticker> {
        let url = format!("{}/products/{symbol}/ticker", self.rest_url);
        let ticker: RestTicker = http.get(url).send().await?.error_for_status()?.json().await?;
        let price = parse_price(&ticker.price).map_err(Error::Subscription)?;
        Ok(Ticker {
            native_symbol: symbol.to_string(),
            price,
            volume: ticker.volume.as_deref().and_then(parse_quantity),
            bid: optional_quantity(ticker.bid.as_deref()),
            ask: optional_quantity(ticker.ask.as_deref()),
            timestamp_ms: iso_to_ms(ticker.time.as_deref()),
        })
    }

    async fn rest_ping(&self, http: &reqwest::Client) -> Result<()> {
        let url = format!("{}/time", self.rest_url);
        http.get(url).send().await?.error_for_status()?;
        Ok(())
    }
}
