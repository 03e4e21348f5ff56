//! OKX protocol codec.
//!
//! Subscriptions go through the v5 public endpoint with per-instrument
//! `tickers` channel args; ticker pushes wrap their payload in a
//! `data` array. OKX expects a bare `ping` text frame as keepalive and
//! answers with a bare `pong`.

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::exchange::protocol::{parse_price, parse_quantity};
use crate::core::exchange::{FrameOutcome, ProtocolCodec, Ticker};
use crate::error::{Error, Result};

const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const REST_URL: &str = "https://www.okx.com";

#[derive(Debug, Deserialize)]
struct TickerData {
    #[serde(rename = "instId")]
    inst_id: String,
    last: String,
    #[serde(rename = "bidPx", default)]
    bid_px: Option<String>,
    #[serde(rename = "askPx", default)]
    ask_px: Option<String>,
    #[serde(rename = "vol24h", default)]
    vol_24h: Option<String>,
    /// Epoch milliseconds, as a string.
    #[serde(default)]
    ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RestTickerResponse {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<TickerData>,
}

pub struct OkxCodec {
    ws_url: String,
    rest_url: String,
}

impl OkxCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_endpoints(WS_URL, REST_URL)
    }

    #[must_use]
    pub fn with_endpoints(ws_url: impl Into<String>, rest_url: impl Into<String>) -> Self {
        Self { ws_url: ws_url.into(), rest_url: rest_url.into() }
    }
}

impl Default for OkxCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn optional_quantity(raw: Option<&str>) -> Option<f64> {
    parse_quantity(raw?).filter(|v| *v > 0.0)
}

fn ticker_from_data(data: TickerData) -> std::result::Result<Ticker, String> {
    let price = parse_price(&data.last)?;
    Ok(Ticker {
        native_symbol: data.inst_id,
        price,
        volume: data.vol_24h.as_deref().and_then(parse_quantity),
        bid: optional_quantity(data.bid_px.as_deref()),
        ask: optional_quantity(data.ask_px.as_deref()),
        timestamp_ms: data.ts.as_deref().and_then(|t| t.parse().ok()),
    })
}

#[async_trait]
impl ProtocolCodec for OkxCodec {
    fn exchange_id(&self) -> &'static str {
        "okx"
    }

    fn ws_url(&self) -> String {
        self.ws_url.clone()
    }

    fn reliability(&self) -> f64 {
        0.88
    }

    fn valid_symbol(&self, symbol: &str) -> bool {
        // Instrument ids look like BTC-USDT.
        let mut parts = symbol.splitn(3, '-');
        matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(base), Some(quote), None) if !base.is_empty() && !quote.is_empty()
        )
    }

    fn subscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        let args: Vec<serde_json::Value> = symbols
            .iter()
            .map(|s| serde_json::json!({"channel": "tickers", "instId": s}))
            .collect();
        vec![serde_json::json!({"op": "subscribe", "args": args}).to_string()]
    }

    fn unsubscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        let args: Vec<serde_json::Value> = symbols
            .iter()
            .map(|s| serde_json::json!({"channel": "tickers", "instId": s}))
            .collect();
        vec![serde_json::json!({"op": "unsubscribe", "args": args}).to_string()]
    }

    fn keepalive_frame(&self) -> Option<String> {
        Some("ping".to_string())
    }

    fn is_pong(&self, text: &str) -> bool {
        text == "pong"
    }

    fn parse_frame(&self, text: &str) -> FrameOutcome {
        if text == "pong" {
            return FrameOutcome::Ignore;
        }
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return FrameOutcome::Malformed(e.to_string()),
        };
        // Subscribe acks and errors carry an "event" field.
        if let Some(event) = value.get("event").and_then(|e| e.as_str()) {
            if event == "error" {
                let reason =
                    value.get("msg").and_then(|m| m.as_str()).unwrap_or("unspecified server error");
                return FrameOutcome::Malformed(reason.to_string());
            }
            return FrameOutcome::Ignore;
        }
        if value.pointer("/arg/channel").and_then(|c| c.as_str()) != Some("tickers") {
            return FrameOutcome::Ignore;
        }
        let Some(first) = value.pointer("/data/0").cloned() else {
            return FrameOutcome::Malformed("ticker push without data".to_string());
        };
        let data: TickerData = match serde_json::from_value(first) {
            Ok(d) => d,
            Err(e) => return FrameOutcome::Malformed(e.to_string()),
        };
        match ticker_from_data(data) {
            Ok(ticker) => FrameOutcome::Ticker(ticker),
            Err(reason) => FrameOutcome::Malformed(reason),
        }
    }

    async fn fetch_ticker(&self, http: &reqwest::Client, symbol: &str) -> Result<Ticker> {
        let url = format!("{}/api/v5/market/ticker", self.rest_url);
        let response: RestTickerResponse = http
            .get(url)
            .query(&[("instId", symbol)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if response.code != "0" {
            return Err(Error::Subscription(format!("okx {}: {}", response.code, response.msg)));
        }
        let data = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| Error::Subscription(format!("okx: empty result for {symbol}")))?;
        ticker_from_data(data).map_err(Error::Subscription)
    }

    async fn rest_ping(&self, http: &reqwest::Client) -> Result<()> {
        let url = format!("{}/api/v5/public/time", self.rest_url);
        http.get(url).send().await?.error_for_status()?;
        Ok(())
    }
}
