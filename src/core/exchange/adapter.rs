//! The exchange adapter capability trait.
//!
//! One adapter talks to exactly one exchange and turns its wire protocol
//! into normalized [`PriceUpdate`]s, delivered through an event channel
//! owned by the data manager. Protocol specifics live in
//! [`ProtocolCodec`](super::ProtocolCodec) implementations; the shared
//! runtime in [`runtime`](super::runtime) handles retry, keepalive and
//! subscription bookkeeping for all of them.

use std::time::Duration;

use async_trait::async_trait;

use crate::core::domain::PriceUpdate;
use crate::error::Result;

/// WebSocket transport lifecycle.
///
/// `Open → Closing` happens only on intentional disconnect; any other
/// loss from `Open` goes to `Disconnected` and emits a connection-change
/// exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Retry, timeout and keepalive knobs shared by all adapters.
#[derive(Debug, Clone)]
pub struct AdapterTuning {
    /// Connection attempts before giving up.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub base_delay: Duration,
    pub connection_timeout: Duration,
    pub rest_timeout: Duration,
    pub health_timeout: Duration,
    /// Cadence for application-level pings where the protocol needs them.
    pub ping_interval: Duration,
    /// Inbound silence after a ping that counts as transport failure.
    pub pong_timeout: Duration,
}

impl Default for AdapterTuning {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            connection_timeout: Duration::from_secs(5),
            rest_timeout: Duration::from_secs(5),
            health_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

/// Capability interface of one exchange connection.
///
/// All methods take `&self`: adapters are shared across the orchestrator,
/// the data manager and the failover controller, and manage their own
/// interior state.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Stable exchange id, e.g. `binance`.
    fn exchange_id(&self) -> &str;

    /// Open the transport. Idempotent; retries internally with
    /// exponential backoff and fails only after all attempts.
    async fn connect(&self) -> Result<()>;

    /// Close the transport. Idempotent; event delivery stops before this
    /// returns.
    async fn disconnect(&self) -> Result<()>;

    /// Authoritative transport state, never a stale cached flag.
    fn is_connected(&self) -> bool;

    /// Request server-side subscriptions for exchange-native symbols.
    /// Invalid symbols are filtered with a warning; fails only if the
    /// resulting set is empty or the adapter is not connected.
    async fn subscribe(&self, symbols: &[String]) -> Result<()>;

    /// Remove server-side subscriptions. Silently a no-op when
    /// disconnected or for symbols that are not subscribed.
    async fn unsubscribe(&self, symbols: &[String]) -> Result<()>;

    /// REST fallback for one exchange-native symbol. Returns `None` on
    /// any error after internal retry.
    async fn fetch_ticker_rest(&self, symbol: &str) -> Option<PriceUpdate>;

    /// Cheap liveness probe; resolves within the health timeout.
    async fn health_check(&self) -> bool;

    /// Moving average of observed probe latency.
    fn latency_ms(&self) -> f64;
}
