//! Per-exchange protocol codec contract.
//!
//! A codec knows one exchange's wire format: how to phrase subscribe and
//! unsubscribe frames, how to read a ticker out of an inbound frame, and
//! which REST endpoints back the fallback path. The shared adapter
//! runtime drives the connection; codecs never hold transport state.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::Result;

/// Parse a wire decimal, rejecting non-positive and non-finite values.
pub(crate) fn parse_price(raw: &str) -> std::result::Result<f64, String> {
    let decimal: Decimal = raw.parse().map_err(|_| format!("bad decimal {raw:?}"))?;
    if decimal <= Decimal::ZERO {
        return Err(format!("non-positive price {raw:?}"));
    }
    decimal
        .to_f64()
        .filter(|p| p.is_finite())
        .ok_or_else(|| format!("unrepresentable price {raw:?}"))
}

/// Parse an optional non-negative wire decimal; empty or bad input is None.
pub(crate) fn parse_quantity(raw: &str) -> Option<f64> {
    let decimal: Decimal = raw.parse().ok()?;
    let value = decimal.to_f64()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// A ticker as read off the wire, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticker {
    /// Exchange-native symbol, e.g. `BTCUSDT`.
    pub native_symbol: String,
    pub price: f64,
    pub volume: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    /// Exchange event time; `None` when the protocol carries no
    /// timestamp (the runtime stamps arrival time instead).
    pub timestamp_ms: Option<i64>,
}

/// What one inbound text frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Ticker(Ticker),
    /// Protocol chatter (acks, heartbeats, status) — not an error.
    Ignore,
    /// Unparseable or contradictory frame; logged and dropped without
    /// touching source health.
    Malformed(String),
}

/// One exchange's wire protocol.
#[async_trait]
pub trait ProtocolCodec: Send + Sync + 'static {
    /// Stable exchange id, e.g. `binance`.
    fn exchange_id(&self) -> &'static str;

    /// WebSocket endpoint.
    fn ws_url(&self) -> String;

    /// Baseline confidence for this exchange's updates.
    fn reliability(&self) -> f64 {
        0.9
    }

    /// Whether a symbol is plausibly valid for this exchange.
    fn valid_symbol(&self, symbol: &str) -> bool;

    /// Text frames that subscribe the given native symbols.
    fn subscribe_frames(&self, symbols: &[String]) -> Vec<String>;

    /// Text frames that unsubscribe the given native symbols.
    fn unsubscribe_frames(&self, symbols: &[String]) -> Vec<String>;

    /// Application-level ping payload, for protocols that require one.
    /// `None` means WebSocket-level pings suffice.
    fn keepalive_frame(&self) -> Option<String> {
        None
    }

    /// Whether a frame is the reply to [`keepalive_frame`](Self::keepalive_frame).
    fn is_pong(&self, _text: &str) -> bool {
        false
    }

    /// Classify one inbound text frame.
    fn parse_frame(&self, text: &str) -> FrameOutcome;

    /// REST ticker fallback for one native symbol.
    async fn fetch_ticker(&self, http: &reqwest::Client, symbol: &str) -> Result<Ticker>;

    /// Cheap REST liveness probe.
    async fn rest_ping(&self, http: &reqwest::Client) -> Result<()>;
}
