//! HTTP feed API.
//!
//! The only surface the core exposes to users: batched feed values
//! (optionally bound to a voting round), time-ranged volumes, health
//! probes, and Prometheus metrics. Request validation and error-body
//! shaping live in [`types`]; everything else is delegated to the data
//! manager.

mod handlers;
mod metrics;
pub mod types;

pub use metrics::Metrics;
pub use types::ApiError;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::core::manager::DataManager;
use crate::core::service::{system_clock, Clock};
use crate::error::Result;

/// Default voting round length.
pub const ROUND_DURATION_MS: i64 = 90_000;

/// Shared state behind every handler.
pub struct ApiState {
    pub manager: Arc<DataManager>,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
    pub round_duration_ms: i64,
    pub clock: Clock,
}

impl ApiState {
    #[must_use]
    pub fn new(manager: Arc<DataManager>) -> Self {
        Self {
            manager,
            metrics: Arc::new(Metrics::new()),
            started_at: Instant::now(),
            round_duration_ms: ROUND_DURATION_MS,
            clock: system_clock(),
        }
    }
}

/// Build the application router.
#[must_use]
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/feed-values", post(handlers::feed_values))
        .route("/feed-values/:voting_round_id", post(handlers::feed_values_for_round))
        .route("/volumes", post(handlers::volumes))
        .route("/health", get(handlers::health))
        .route("/health/ready", get(handlers::health_ready))
        .route("/health/live", get(handlers::health_live))
        .route("/metrics/prometheus", get(handlers::metrics_prometheus))
        .with_state(state)
}

/// Serve the API until `shutdown` resolves.
pub async fn serve(
    state: Arc<ApiState>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP API listening");
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await?;
    Ok(())
}
