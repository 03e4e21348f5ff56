//! Feedgate - Real-time price oracle gateway.
//!
//! # Architecture
//!
//! ```text
//! src/
//! ├── core/              # Reusable library components
//! │   ├── domain/        # Feed, price and health value types
//! │   ├── exchange/      # Exchange adapter trait + protocol codecs
//! │   ├── orchestrator/  # WebSocket lifecycle owner
//! │   ├── manager/       # Ingest fan-in and feed query surface
//! │   ├── validator/     # Multi-tier update validation
//! │   ├── aggregator/    # Weighted-median consensus
//! │   ├── failover/      # Source health and failover groups
//! │   └── service/       # Scheduler, event bus, clock
//! ├── api/               # HTTP feed API (axum)
//! ├── app/               # Configuration and bootstrap
//! └── cli/               # Command-line entry points
//! ```
//!
//! Ticker updates flow from exchange adapters into the data manager, which
//! gates them for freshness and quality, feeds the validator's history
//! windows, and asks the consensus aggregator for one canonical price per
//! feed. The failover controller watches source health and keeps at least
//! one healthy source active per feed.

pub mod api;
pub mod app;
pub mod cli;
pub mod core;
pub mod error;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
