//! Exchange adapter layer.
//!
//! ## Adding a New Exchange
//!
//! 1. Create a codec module under `exchange/<name>.rs`
//! 2. Implement [`ProtocolCodec`] with the exchange's subscribe frames,
//!    ticker parsing and REST fallback endpoints
//! 3. Register it in [`factory::build_adapter`]
//!
//! The shared [`WsAdapter`] runtime handles everything else: connect
//! retry, keepalive, subscription bookkeeping and normalization into
//! [`PriceUpdate`](crate::core::domain::PriceUpdate)s.

mod adapter;
mod binance;
mod coinbase;
pub mod confidence;
pub mod factory;
mod kraken;
mod okx;
mod protocol;
mod runtime;
mod symbols;

pub use adapter::{AdapterTuning, ExchangeAdapter, WsState};
pub use binance::BinanceCodec;
pub use coinbase::CoinbaseCodec;
pub use factory::{build_adapter, KNOWN_EXCHANGES};
pub use kraken::KrakenCodec;
pub use okx::OkxCodec;
pub use protocol::{FrameOutcome, ProtocolCodec, Ticker};
pub use runtime::WsAdapter;
pub use symbols::SymbolMap;
