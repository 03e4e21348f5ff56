//! Kraken protocol codec.
//!
//! Kraken's public feed frames ticker payloads as four-element JSON
//! arrays `[channelId, data, "ticker", pair]` and uses named events
//! (`heartbeat`, `systemStatus`, `subscriptionStatus`) for everything
//! else. The protocol expects application-level `{"event":"ping"}`
//! keepalives. Ticker payloads carry no timestamp; the runtime stamps
//! arrival time.

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::exchange::protocol::{parse_price, parse_quantity};
use crate::core::exchange::{FrameOutcome, ProtocolCodec, Ticker};
use crate::error::{Error, Result};

const WS_URL: &str = "wss://ws.kraken.com";
const REST_URL: &str = "https://api.kraken.com";

/// Ticker payload: each field is an array of wire decimals.
#[derive(Debug, Deserialize)]
struct TickerPayload {
    /// Last trade closed: `[price, lot volume]`.
    c: Vec<String>,
    /// Volume: `[today, last 24 hours]`.
    #[serde(default)]
    v: Vec<String>,
    /// Best bid: `[price, whole lot volume, lot volume]`. The whole lot
    /// volume arrives as a bare integer, so the elements are mixed-typed.
    #[serde(default)]
    b: Vec<serde_json::Value>,
    /// Best ask: `[price, whole lot volume, lot volume]`.
    #[serde(default)]
    a: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RestResponse {
    error: Vec<String>,
    #[serde(default)]
    result: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SystemStatus {
    error: Vec<String>,
    #[serde(default)]
    result: Option<SystemStatusResult>,
}

#[derive(Debug, Deserialize)]
struct SystemStatusResult {
    status: String,
}

pub struct KrakenCodec {
    ws_url: String,
    rest_url: String,
}

impl KrakenCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_endpoints(WS_URL, REST_URL)
    }

    #[must_use]
    pub fn with_endpoints(ws_url: impl Into<String>, rest_url: impl Into<String>) -> Self {
        Self { ws_url: ws_url.into(), rest_url: rest_url.into() }
    }
}

impl Default for KrakenCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn first_quantity(values: &[serde_json::Value]) -> Option<f64> {
    parse_quantity(values.first()?.as_str()?).filter(|v| *v > 0.0)
}

fn ticker_from_payload(pair: String, payload: TickerPayload) -> std::result::Result<Ticker, String> {
    let last = payload.c.first().ok_or_else(|| "ticker without last trade".to_string())?;
    let price = parse_price(last)?;
    Ok(Ticker {
        native_symbol: pair,
        price,
        // Second volume entry is the 24h figure.
        volume: payload.v.get(1).and_then(|v| parse_quantity(v)),
        bid: first_quantity(&payload.b),
        ask: first_quantity(&payload.a),
        timestamp_ms: None,
    })
}

#[async_trait]
impl ProtocolCodec for KrakenCodec {
    fn exchange_id(&self) -> &'static str {
        "kraken"
    }

    fn ws_url(&self) -> String {
        self.ws_url.clone()
    }

    fn reliability(&self) -> f64 {
        0.9
    }

    fn valid_symbol(&self, symbol: &str) -> bool {
        // WebSocket pairs look like XBT/USD.
        let mut parts = symbol.splitn(3, '/');
        matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(base), Some(quote), None) if !base.is_empty() && !quote.is_empty()
        )
    }

    fn subscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        vec![serde_json::json!({
            "event": "subscribe",
            "pair": symbols,
            "subscription": {"name": "ticker"},
        })
        .to_string()]
    }

    fn unsubscribe_frames(&self, symbols: &[String]) -> Vec<String> {
        vec![serde_json::json!({
            "event": "unsubscribe",
            "pair": symbols,
            "subscription": {"name": "ticker"},
        })
        .to_string()]
    }

    fn keepalive_frame(&self) -> Option<String> {
        Some(r#"{"event":"ping"}"#.to_string())
    }

    fn is_pong(&self, text: &str) -> bool {
        serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .and_then(|v| v.get("event").and_then(|e| e.as_str()).map(|e| e == "pong"))
            .unwrap_or(false)
    }

    fn parse_frame(&self, text: &str) -> FrameOutcome {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return FrameOutcome::Malformed(e.to_string()),
        };
        // Named events: heartbeat, systemStatus, subscriptionStatus, pong.
        if value.get("event").is_some() {
            return FrameOutcome::Ignore;
        }
        let Some(entries) = value.as_array() else {
            return FrameOutcome::Malformed("frame is neither event nor channel array".to_string());
        };
        if entries.len() != 4 || entries[2].as_str() != Some("ticker") {
            return FrameOutcome::Ignore;
        }
        let Some(pair) = entries[3].as_str() else {
            return FrameOutcome::Malformed("ticker frame without pair".to_string());
        };
        let payload: TickerPayload = match serde_json::from_value(entries[1].clone()) {
            Ok(p) => p,
            Err(e) => return FrameOutcome::Malformed(e.to_string()),
        };
        match ticker_from_payload(pair.to_string(), payload) {
            Ok(ticker) => FrameOutcome::Ticker(ticker),
            Err(reason) => FrameOutcome::Malformed(reason),
        }
    }

    async fn fetch_ticker(&self, http: &reqwest::Client, symbol: &str) -> Result<Ticker> {
        // REST pairs drop the slash: XBT/USD -> XBTUSD.
        let pair = symbol.replace('/', "");
        let url = format!("{}/0/public/Ticker", self.rest_url);
        let response: RestResponse =
            http.get(url).query(&[("pair", pair.as_str())]).send().await?.error_for_status()?.json().await?;
        if let Some(error) = response.error.first() {
            return Err(Error::Subscription(format!("kraken: {error}")));
        }
        // The result key is Kraken's internal pair name, which differs
        // from the request pair; take the single entry.
        let (_, payload) = response
            .result
            .into_iter()
            .next()
            .ok_or_else(|| Error::Subscription(format!("kraken: empty result for {symbol}")))?;
        let payload: TickerPayload = serde_json::from_value(payload)?;
        ticker_from_payload(symbol.to_string(), payload).map_err(Error::Subscription)
    }

    async fn rest_ping(&self, http: &reqwest::Client) -> Result<()> {
        let url = format!("{}/0/public/SystemStatus", self.rest_url);
        let status: SystemStatus = http.get(url).send().await?.error_for_status()?.json().await?;
        if let Some(error) = status.error.first() {
            return Err(Error::Connection(format!("kraken: {error}")));
        }
        match status.result {
            Some(result) if result.status == "online" => Ok(()),
            Some(result) => Err(Error::Connection(format!("kraken status {}", result.status))),
            None => Err(Error::Connection("kraken status missing".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICKER_FRAME: &str = r#"[
        42,
        {
            "a": ["50001.5", 1, "1.000"],
            "b": ["50000.1", 2, "2.000"],
            "c": ["50000.9", "0.05"],
            "v": ["120.5", "800.25"],
            "p": ["49900.0", "49800.0"],
            "t": [100, 900],
            "l": ["49000.0", "48500.0"],
            "h": ["50500.0", "50600.0"],
            "o": ["49500.0", "49400.0"]
        },
        "ticker",
        "XBT/USD"
    ]"#;

    #[test]
    fn test_parse_ticker_frame() {
        let codec = KrakenCodec::new();
        match codec.parse_frame(TICKER_FRAME) {
            FrameOutcome::Ticker(ticker) => {
                assert_eq!(ticker.native_symbol, "XBT/USD");
                assert!((ticker.price - 50_000.9).abs() < 1e-9);
                assert!((ticker.volume.unwrap() - 800.25).abs() < 1e-9);
                assert_eq!(ticker.timestamp_ms, None);
            }
            other => panic!("expected ticker, got {other:?}"),
        }
    }

    #[test]
    fn test_named_events_are_ignored() {
        let codec = KrakenCodec::new();
        for frame in [
            r#"{"event":"heartbeat"}"#,
            r#"{"event":"systemStatus","status":"online","version":"1.9.0"}"#,
            r#"{"event":"subscriptionStatus","status":"subscribed","pair":"XBT/USD"}"#,
        ] {
            assert_eq!(codec.parse_frame(frame), FrameOutcome::Ignore, "frame {frame}");
        }
    }

    #[test]
    fn test_pong_detection() {
        let codec = KrakenCodec::new();
        assert!(codec.is_pong(r#"{"event":"pong","reqid":1}"#));
        assert!(!codec.is_pong(r#"{"event":"heartbeat"}"#));
        assert!(!codec.is_pong("not json"));
    }

    #[test]
    fn test_other_channels_are_ignored() {
        let codec = KrakenCodec::new();
        let frame = r#"[7,[["50000.1","0.01","1700000000.1234","b","l",""]],"trade","XBT/USD"]"#;
        assert_eq!(codec.parse_frame(frame), FrameOutcome::Ignore);
    }

    #[test]
    fn test_ticker_without_last_trade_is_malformed() {
        let codec = KrakenCodec::new();
        let frame = r#"[42,{"a":["1.0",1,"1.0"],"b":["0.9",1,"1.0"],"c":[]},"ticker","XBT/USD"]"#;
        assert!(matches!(codec.parse_frame(frame), FrameOutcome::Malformed(_)));
    }

    #[test]
    fn test_keepalive_is_app_level_ping() {
        let codec = KrakenCodec::new();
        let ping = codec.keepalive_frame().unwrap();
        let value: serde_json::Value = serde_json::from_str(&ping).unwrap();
        assert_eq!(value["event"], "ping");
    }
}
