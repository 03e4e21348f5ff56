//! Runtime construction of adapters by exchange id.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::core::domain::AdapterEvent;
use crate::core::exchange::{
    AdapterTuning, BinanceCodec, CoinbaseCodec, ExchangeAdapter, KrakenCodec, OkxCodec, SymbolMap,
    WsAdapter,
};
use crate::core::service::Clock;
use crate::error::{Error, Result};

/// Exchange ids this build can construct adapters for.
pub const KNOWN_EXCHANGES: &[&str] = &["binance", "coinbase", "kraken", "okx"];

/// Build one adapter for `exchange`, wired to the shared event channel.
pub fn build_adapter(
    exchange: &str,
    symbols: SymbolMap,
    tuning: AdapterTuning,
    events: mpsc::UnboundedSender<AdapterEvent>,
    clock: Clock,
) -> Result<Arc<dyn ExchangeAdapter>> {
    match exchange {
        "binance" => Ok(Arc::new(WsAdapter::new(BinanceCodec::new(), symbols, tuning, events, clock))),
        "coinbase" => Ok(Arc::new(WsAdapter::new(CoinbaseCodec::new(), symbols, tuning, events, clock))),
        "kraken" => Ok(Arc::new(WsAdapter::new(KrakenCodec::new(), symbols, tuning, events, clock))),
        "okx" => Ok(Arc::new(WsAdapter::new(OkxCodec::new(), symbols, tuning, events, clock))),
        other => Err(Error::Config(format!("unknown exchange {other:?}"))),
    }
}
